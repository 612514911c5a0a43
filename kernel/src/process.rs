//! The minimal process shell this crate needs: enough to own a
//! supplemental page table and a page directory, and to be looked back up
//! by the frame table's eviction path.
//!
//! Everything else a real process has — threads, a scheduler entry, open
//! file descriptors beyond what paging needs — belongs to the surrounding
//! kernel and is out of scope here (spec.md Non-goals: "the scheduler
//! itself").

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::mm::filesystem::FileSystem;
use crate::mm::frame_table::FrameTable;
use crate::mm::pagedir::PageDirectory;
use crate::mm::spt::Spt;
use crate::mm::swap::SwapAllocator;

/// Process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

impl ProcessId {
    /// Allocate a fresh process id. Monotonic, never reused within a run.
    pub fn fresh() -> Self {
        Self(NEXT_PID.fetch_add(1, Ordering::Relaxed))
    }
}

/// The process-wide singletons spec.md §9 calls out by name
/// (`frame_table`, `swap_table`, `filesys_lock`): bundled into one handle
/// built once at boot and shared via `Arc`, rather than free-standing
/// globals, per the design note's explicit instruction.
pub struct PagingSystem {
    pub frame_table: FrameTable,
    pub swap: SwapAllocator,
    pub filesys_lock: Mutex<()>,
    pub fs: Box<dyn FileSystem>,
    registry: Mutex<BTreeMap<ProcessId, Arc<Process>>>,
}

impl PagingSystem {
    pub fn new(frame_table: FrameTable, swap: SwapAllocator, fs: Box<dyn FileSystem>) -> Arc<Self> {
        Arc::new(Self {
            frame_table,
            swap,
            filesys_lock: Mutex::new(()),
            fs,
            registry: Mutex::new(BTreeMap::new()),
        })
    }

    /// Resolve a process id recorded in an FTE's `(pid, upage)` identifier
    /// back to a live `Process`, or `None` if it already exited.
    pub fn lookup_process(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.registry.lock().get(&pid).cloned()
    }

    fn register(&self, process: &Arc<Process>) {
        self.registry.lock().insert(process.pid, process.clone());
    }

    fn unregister(&self, pid: ProcessId) {
        self.registry.lock().remove(&pid);
    }
}

/// A process, as far as the paging core is concerned: an id, a page
/// directory, and a supplemental page table.
pub struct Process {
    pub pid: ProcessId,
    pub pagedir: Arc<Mutex<Box<dyn PageDirectory>>>,
    pub spt: Spt,
    pub system: Arc<PagingSystem>,
}

impl Process {
    /// Create a process and register it with `system` so the frame table
    /// can resolve eviction victims that belong to it.
    pub fn new(pagedir: Box<dyn PageDirectory>, system: Arc<PagingSystem>) -> Arc<Self> {
        let pid = ProcessId::fresh();
        let pagedir = Arc::new(Mutex::new(pagedir));
        let process = Arc::new(Self {
            pid,
            pagedir: pagedir.clone(),
            spt: Spt::new(pid, pagedir),
            system,
        });
        process.system.register(&process);
        process
    }

    /// `page_table_destroy` plus process exit: tears down every SPTE,
    /// returning frames and swap slots, then removes this process from the
    /// registry so no stale `SpteId` can resolve back to it.
    pub fn exit(&self) {
        self.spt.destroy(&self.system.frame_table, &self.system.swap, &self.pagedir);
        self.system.unregister(self.pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::block::RamBlockDevice;
    use crate::mm::filesystem::InMemoryFileSystem;
    use crate::mm::frame_table::FrameTable;
    use crate::mm::pagedir::MockPageDirectory;
    use crate::mm::swap::SwapAllocator;
    use crate::mm::spte::SpteStatus;
    use crate::mm::SECTORS_PER_PAGE;

    fn system(capacity: usize) -> Arc<PagingSystem> {
        let device: Arc<dyn crate::mm::block::BlockDevice> =
            Arc::new(RamBlockDevice::new(4 * SECTORS_PER_PAGE as u64));
        PagingSystem::new(
            FrameTable::new(capacity),
            SwapAllocator::new(device),
            Box::new(InMemoryFileSystem::new()),
        )
    }

    /// Scenario 6: exit on a process with mixed INFRAME/INSWAP/INFILE
    /// pages returns every frame and swap slot, and leaves the registry
    /// with no trace of the process.
    #[test]
    fn exit_tears_down_mixed_resident_swapped_and_file_backed_pages() {
        let system = system(1);
        let process = Process::new(Box::new(MockPageDirectory::new()), system.clone());

        // INFRAME: a stack page loaded into the sole frame.
        process.spt.add_stack(0x1000, 4096, true);
        let frame = system
            .frame_table
            .alloc(
                crate::mm::frame_table::SpteId { pid: process.pid, upage: 0x1000 },
                &system,
            )
            .unwrap();
        process.pagedir.lock().set_page(0x1000, frame, true);
        *process.spt.find(0x1000).unwrap().lock_state() = SpteStatus::InFrame { frame };

        // INSWAP: a page already written out.
        process.spt.add_stack(0x2000, 4096, true);
        let swap_idx = system.swap.swap_out(&[0u8; crate::mm::PAGE_SIZE]);
        *process.spt.find(0x2000).unwrap().lock_state() = SpteStatus::InSwap { swap_idx };

        // INFILE: never touched, no frame or swap slot to give back.
        process.spt.add_file_backed(0x3000, 7, 0, 100, crate::mm::PAGE_SIZE as u32 - 100, true);

        process.exit();

        assert_eq!(process.spt.len(), 0);
        assert!(system.lookup_process(process.pid).is_none());
        assert!(process.pagedir.lock().get_page(0x1000).is_none());

        let regained = system
            .frame_table
            .alloc(
                crate::mm::frame_table::SpteId { pid: ProcessId(999), upage: 0x9000 },
                &system,
            )
            .expect("the sole frame must have been returned to the free list");
        assert_eq!(regained, frame);
    }
}
