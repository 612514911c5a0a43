//! Supplemental page table entry: per-page metadata describing where a
//! virtual page's contents currently live.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, MutexGuard};

use crate::mm::pagedir::PageDirectory;
use crate::mm::{FileId, FrameId, SwapIndex};
use crate::process::ProcessId;

/// Where an SPTE's contents currently live. Exactly one variant applies at
/// any moment, and each variant only carries the fields meaningful in that
/// state — the Rust encoding of spec.md's "exactly one of four statuses"
/// invariant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpteStatus {
    /// Backed by a read-only region of an open file.
    InFile {
        file: FileId,
        ofs: u64,
        read_bytes: u32,
        zero_bytes: u32,
    },
    /// A stack page, zero-filled on first load.
    InStack { zero_bytes: u32 },
    /// Written out to a swap slot; no frame, no MMU mapping.
    InSwap { swap_idx: SwapIndex },
    /// Resident in a physical frame with an installed MMU mapping.
    InFrame { frame: FrameId },
}

/// One entry of a process's supplemental page table.
///
/// `load_lock` (the `state` mutex below) serializes every transition; it
/// is impossible to read or write `status` without holding it, so "only
/// transitions under load_lock" is a property of the type, not a
/// convention.
pub struct Spte {
    pub owner: ProcessId,
    pub upage: usize,
    pub writable: bool,
    /// True while kernel code is actively touching this page; the clock
    /// scan must never select a pinned entry. Kept outside `state` so the
    /// frame table's eviction scan can check it without contending for
    /// every candidate's load lock.
    pub pin: AtomicBool,
    /// The owning process's page directory, shared so both the process
    /// and every SPTE it creates can reach it without a back-pointer to
    /// the `Process` itself.
    pagedir: Arc<Mutex<alloc::boxed::Box<dyn PageDirectory>>>,
    state: Mutex<SpteStatus>,
}

impl Spte {
    pub fn new(
        owner: ProcessId,
        upage: usize,
        writable: bool,
        status: SpteStatus,
        pagedir: Arc<Mutex<alloc::boxed::Box<dyn PageDirectory>>>,
    ) -> Arc<Self> {
        debug_assert_eq!(upage, crate::mm::page_round_down(upage), "upage must be page-aligned");
        Arc::new(Self {
            owner,
            upage,
            writable,
            pin: AtomicBool::new(false),
            pagedir,
            state: Mutex::new(status),
        })
    }

    pub fn pagedir(&self) -> &Arc<Mutex<alloc::boxed::Box<dyn PageDirectory>>> {
        &self.pagedir
    }

    pub fn is_pinned(&self) -> bool {
        self.pin.load(Ordering::Acquire)
    }

    pub fn set_pinned(&self, value: bool) {
        self.pin.store(value, Ordering::Release);
    }

    /// Acquire `load_lock`, blocking.
    pub fn lock_state(&self) -> MutexGuard<'_, SpteStatus> {
        self.state.lock()
    }

    /// Acquire `load_lock` without blocking, used by the frame table's
    /// eviction scan to avoid inverting the lock order against a
    /// concurrent `load_page`.
    pub fn try_lock_state(&self) -> Option<MutexGuard<'_, SpteStatus>> {
        self.state.try_lock()
    }

    pub fn status(&self) -> SpteStatus {
        *self.state.lock()
    }

    /// `page_unpin`: idempotent — unpinning an already-unpinned or
    /// non-resident entry is a no-op.
    pub fn unpin(&self) {
        let status = self.state.lock();
        if matches!(*status, SpteStatus::InFrame { .. }) {
            self.set_pinned(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::pagedir::MockPageDirectory;
    use alloc::boxed::Box;

    fn pagedir() -> Arc<Mutex<Box<dyn PageDirectory>>> {
        Arc::new(Mutex::new(Box::new(MockPageDirectory::new())))
    }

    #[test]
    fn new_spte_is_unpinned() {
        let spte = Spte::new(
            ProcessId(1),
            0x1000,
            true,
            SpteStatus::InStack { zero_bytes: 4096 },
            pagedir(),
        );
        assert!(!spte.is_pinned());
    }

    #[test]
    fn unpin_is_idempotent() {
        let spte = Spte::new(
            ProcessId(1),
            0x1000,
            true,
            SpteStatus::InFrame { frame: crate::mm::FrameId(0) },
            pagedir(),
        );
        spte.set_pinned(true);
        spte.unpin();
        assert!(!spte.is_pinned());
        spte.unpin();
        assert!(!spte.is_pinned());
    }

    #[test]
    fn unpin_on_non_resident_entry_is_a_no_op() {
        let spte = Spte::new(
            ProcessId(1),
            0x1000,
            true,
            SpteStatus::InSwap { swap_idx: crate::mm::SwapIndex(0) },
            pagedir(),
        );
        spte.set_pinned(true);
        spte.unpin();
        // Not InFrame, so unpin() must leave pin untouched.
        assert!(spte.is_pinned());
    }
}
