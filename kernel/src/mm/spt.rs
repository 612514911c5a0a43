//! Per-process supplemental page table: a map from page-aligned virtual
//! address to the SPTE describing it.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use spin::Mutex;

use crate::log_service::LogLevel;
use crate::mm::frame_table::FrameTable;
use crate::mm::pagedir::PageDirectory;
use crate::mm::spte::{Spte, SpteStatus};
use crate::mm::swap::SwapAllocator;
use crate::mm::{page_round_down, FileId};
use crate::print::log_and_record;
use crate::process::ProcessId;
use crate::vm_error;

pub struct Spt {
    owner: ProcessId,
    pagedir: Arc<Mutex<Box<dyn PageDirectory>>>,
    entries: Mutex<BTreeMap<usize, Arc<Spte>>>,
}

impl Spt {
    pub fn new(owner: ProcessId, pagedir: Arc<Mutex<Box<dyn PageDirectory>>>) -> Self {
        Self {
            owner,
            pagedir,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// `page_add`: insert a fresh SPTE. Returns `false` without modifying
    /// anything if `upage` is already present.
    #[allow(clippy::too_many_arguments)]
    pub fn add_file_backed(
        &self,
        upage: usize,
        file: FileId,
        ofs: u64,
        read_bytes: u32,
        zero_bytes: u32,
        writable: bool,
    ) -> bool {
        self.insert(
            upage,
            SpteStatus::InFile {
                file,
                ofs,
                read_bytes,
                zero_bytes,
            },
            writable,
        )
    }

    /// `page_add` for an already-resolved stack page (used by
    /// `grow_stack`); also exposed directly for loader-created stack
    /// setup.
    pub fn add_stack(&self, upage: usize, zero_bytes: u32, writable: bool) -> bool {
        self.insert(upage, SpteStatus::InStack { zero_bytes }, writable)
    }

    fn insert(&self, upage: usize, status: SpteStatus, writable: bool) -> bool {
        let upage = page_round_down(upage);
        let mut entries = self.entries.lock();
        if entries.contains_key(&upage) {
            log_and_record(
                LogLevel::Warn,
                "spt",
                &alloc::format!("{}", vm_error!(DuplicateMapping { upage })),
            );
            return false;
        }
        let spte = Spte::new(self.owner, upage, writable, status, self.pagedir.clone());
        entries.insert(upage, spte);
        true
    }

    /// `page_find`: round `va` down to its page and look up the SPTE.
    pub fn find(&self, va: usize) -> Option<Arc<Spte>> {
        self.entries.lock().get(&page_round_down(va)).cloned()
    }

    /// `page_unpin`.
    pub fn unpin(&self, upage: usize) {
        if let Some(spte) = self.find(upage) {
            spte.unpin();
        }
    }

    /// `page_table_destroy`: tear down every entry, returning any held
    /// frame to `frame_table` and any held swap slot to `swap`.
    pub fn destroy(
        &self,
        frame_table: &FrameTable,
        swap: &SwapAllocator,
        pagedir: &Arc<Mutex<Box<dyn PageDirectory>>>,
    ) {
        let mut entries = self.entries.lock();
        for (upage, spte) in entries.iter() {
            let status = *spte.lock_state();
            match status {
                SpteStatus::InFrame { frame } => {
                    pagedir.lock().clear_page(*upage);
                    frame_table.free(frame);
                }
                SpteStatus::InSwap { swap_idx } => {
                    swap.swap_clear(swap_idx);
                }
                SpteStatus::InFile { .. } | SpteStatus::InStack { .. } => {}
            }
        }
        entries.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::pagedir::MockPageDirectory;
    use crate::mm::block::RamBlockDevice;
    use crate::mm::SECTORS_PER_PAGE;

    fn spt() -> Spt {
        let pagedir: Arc<Mutex<Box<dyn PageDirectory>>> =
            Arc::new(Mutex::new(Box::new(MockPageDirectory::new())));
        Spt::new(ProcessId(1), pagedir)
    }

    #[test]
    fn add_file_backed_rejects_duplicate_upage() {
        let spt = spt();
        assert!(spt.add_file_backed(0x1000, 0, 0, 100, 4096 - 100, true));
        assert!(!spt.add_file_backed(0x1000, 0, 0, 50, 50, true));
        assert_eq!(spt.len(), 1);
    }

    #[test]
    fn find_rounds_down_to_page_boundary() {
        let spt = spt();
        spt.add_stack(0x2000, 4096, true);
        assert!(spt.find(0x2123).is_some());
        assert_eq!(spt.find(0x2123).unwrap().upage, 0x2000);
    }

    #[test]
    fn destroy_clears_mapping_and_returns_swap_slot() {
        let spt = spt();
        spt.add_stack(0x3000, 4096, true);
        let spte = spt.find(0x3000).unwrap();

        let device: Arc<dyn crate::mm::block::BlockDevice> =
            Arc::new(RamBlockDevice::new(4 * SECTORS_PER_PAGE as u64));
        let swap = SwapAllocator::new(device);
        let idx = swap.swap_out(&[0u8; crate::mm::PAGE_SIZE]);
        *spte.lock_state() = SpteStatus::InSwap { swap_idx: idx };

        let frame_table = crate::mm::frame_table::FrameTable::new(2);
        let pagedir: Arc<Mutex<Box<dyn PageDirectory>>> =
            Arc::new(Mutex::new(Box::new(MockPageDirectory::new())));
        spt.destroy(&frame_table, &swap, &pagedir);

        assert_eq!(spt.len(), 0);
    }
}
