//! The shared frame table: one entry per physical frame this subsystem
//! manages, a free list, and the clock (second-chance) eviction scan that
//! reclaims a frame when the free list runs dry.

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{VmError, VmResult};
use crate::log_service::LogLevel;
use crate::mm::spte::SpteStatus;
use crate::mm::{FrameId, PAGE_SIZE};
use crate::print::log_and_record;
use crate::process::{PagingSystem, ProcessId};
use crate::vm_error;

/// The `(pid, upage)` pair an FTE carries instead of a raw back-pointer to
/// its SPTE, per the design notes' explicit re-architecture away from
/// pointer back-references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpteId {
    pub pid: ProcessId,
    pub upage: usize,
}

#[derive(Clone, Copy)]
struct ResidentEntry {
    frame_id: FrameId,
    spte: SpteId,
    /// Second-chance bit the clock scan gives a dirty frame before it is
    /// eligible for eviction on the following pass.
    clock_dirty: bool,
}

struct Inner {
    free_list: Vec<FrameId>,
    resident: Vec<ResidentEntry>,
    cursor: usize,
}

/// A physical frame's backing storage. Content lives behind its own lock
/// so a frame can be read out for a swap write without holding the frame
/// table's list lock.
struct Frame {
    data: Mutex<[u8; PAGE_SIZE]>,
}

/// Fixed-capacity table of simulated physical frames plus the free/resident
/// bookkeeping and clock cursor spec.md §4.2 describes.
pub struct FrameTable {
    frames: Box<[Frame]>,
    inner: Mutex<Inner>,
}

impl FrameTable {
    /// Build a table of `capacity` frames, all initially free.
    pub fn new(capacity: usize) -> Self {
        let frames = (0..capacity)
            .map(|_| Frame {
                data: Mutex::new([0u8; PAGE_SIZE]),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let free_list = (0..capacity).map(FrameId).collect();
        Self {
            frames,
            inner: Mutex::new(Inner {
                free_list,
                resident: Vec::new(),
                cursor: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Run `f` with read access to frame `id`'s contents.
    pub fn read_frame(&self, id: FrameId, f: impl FnOnce(&[u8; PAGE_SIZE])) {
        f(&self.frames[id.0].data.lock());
    }

    /// Run `f` with mutable access to frame `id`'s contents.
    pub fn write_frame(&self, id: FrameId, f: impl FnOnce(&mut [u8; PAGE_SIZE])) {
        f(&mut self.frames[id.0].data.lock());
    }

    /// `frame_alloc`: take a frame from the free list, evicting one via the
    /// clock scan if none is free. `owner` is recorded as the frame's FTE
    /// identifier once a frame is obtained.
    pub fn alloc(&self, owner: SpteId, system: &PagingSystem) -> VmResult<FrameId> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(frame_id) = inner.free_list.pop() {
                    inner.resident.push(ResidentEntry {
                        frame_id,
                        spte: owner,
                        clock_dirty: true,
                    });
                    log_and_record(LogLevel::Debug, "frame_table", "allocated frame from free list");
                    return Ok(frame_id);
                }
            }
            self.evict_one(system)?;
        }
    }

    /// `frame_free`: return `frame` to the free list unconditionally,
    /// dropping any resident-entry bookkeeping for it. Used by
    /// `Spt::destroy`, which has already torn down the owning mapping.
    pub fn free(&self, frame: FrameId) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.resident.iter().position(|e| e.frame_id == frame) {
            inner.resident.remove(pos);
        }
        inner.free_list.push(frame);
        log_and_record(LogLevel::Debug, "frame_table", "freed frame back to free list");
    }

    /// Run the clock scan once, evict its victim to swap, and return the
    /// freed frame to the free list. `Err(AllFramesPinned)` only once a full
    /// circuit of the resident list observes every entry pinned — the
    /// guarantee that forward progress keeps being made instead of looping
    /// forever.
    fn evict_one(&self, system: &PagingSystem) -> VmResult<()> {
        loop {
            let victim = {
                let mut inner = self.inner.lock();
                match Self::scan_for_victim(&mut inner, system) {
                    Some(v) => v,
                    None => {
                        log_and_record(
                            LogLevel::Warn,
                            "frame_table",
                            "clock scan found every resident frame pinned",
                        );
                        return Err(vm_error!(AllFramesPinned));
                    }
                }
            };

            let Some(process) = system.lookup_process(victim.spte.pid) else {
                // The owning process tore down its own SPT (and freed this
                // frame directly) before this scan observed it; retry.
                log_and_record(
                    LogLevel::Debug,
                    "frame_table",
                    &alloc::format!("{}, retrying scan", vm_error!(UnknownProcess { pid: victim.spte.pid.0 })),
                );
                continue;
            };
            let Some(spte) = process.spt.find(victim.spte.upage) else {
                continue;
            };

            // Drop the frame table's list lock before taking the SPTE's
            // load_lock, per the lock order in spec.md §5; `try_lock_state`
            // skips this candidate rather than blocking and risking an
            // inversion against a concurrent `load_page`.
            let Some(mut status) = spte.try_lock_state() else {
                continue;
            };
            if spte.is_pinned() {
                continue;
            }
            let SpteStatus::InFrame { frame } = *status else {
                // Already evicted or reloaded by a racing fault; retry.
                continue;
            };

            process.pagedir.lock().clear_page(victim.spte.upage);

            let mut contents = [0u8; PAGE_SIZE];
            self.read_frame(frame, |data| contents = *data);
            let swap_idx = system.swap.swap_out(&contents);
            *status = SpteStatus::InSwap { swap_idx };
            drop(status);

            self.free(frame);
            log_and_record(LogLevel::Info, "frame_table", "evicted frame to swap");
            return Ok(());
        }
    }

    /// The clock algorithm: skip pinned entries, give a dirty frame one
    /// second chance, otherwise evict the first not-recently-accessed frame
    /// found, clearing the accessed bit of anything passed over.
    ///
    /// A single circuit of the resident list is not enough: a frame that is
    /// dirty, accessed, and still holding its second chance needs one visit
    /// to clear the second chance, another to clear the accessed bit, and a
    /// third to finally be selected. So this runs circuit after circuit,
    /// stopping only once a whole circuit passes over the list without
    /// finding a single unpinned entry — at that point every resident frame
    /// really is pinned, and `None` means exactly that.
    fn scan_for_victim(inner: &mut Inner, system: &PagingSystem) -> Option<ResidentEntry> {
        let n = inner.resident.len();
        if n == 0 {
            return None;
        }
        loop {
            let mut saw_unpinned = false;
            for _ in 0..n {
                let i = inner.cursor % inner.resident.len();
                inner.cursor = (inner.cursor + 1) % inner.resident.len();
                let entry = inner.resident[i];

                let Some(process) = system.lookup_process(entry.spte.pid) else {
                    continue;
                };
                let Some(spte) = process.spt.find(entry.spte.upage) else {
                    continue;
                };
                if spte.is_pinned() {
                    continue;
                }
                saw_unpinned = true;

                let mut pagedir = process.pagedir.lock();
                let dirty = pagedir.is_dirty(entry.spte.upage);
                if dirty && inner.resident[i].clock_dirty {
                    inner.resident[i].clock_dirty = false;
                    continue;
                }
                if !pagedir.is_accessed(entry.spte.upage) {
                    return Some(entry);
                }
                pagedir.set_accessed(entry.spte.upage, false);
            }
            if !saw_unpinned {
                return None;
            }
        }
    }
}
