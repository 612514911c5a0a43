//! The MMU / page-directory interface this subsystem consumes.
//!
//! Installing and probing real hardware page tables is out of scope (the
//! surrounding kernel owns the architecture-specific page walker); this
//! crate only needs the six operations below, so they are expressed as a
//! trait with an in-memory mock standing in for the real `pagedir_*`
//! family during tests.

use alloc::collections::BTreeMap;

use crate::mm::FrameId;

/// Per-process hardware page directory, abstracted to the operations the
/// paging core actually calls.
pub trait PageDirectory: Send {
    /// Return the frame mapped at `upage`, if any.
    fn get_page(&self, upage: usize) -> Option<FrameId>;

    /// Install a mapping from `upage` to `frame`. Returns `false` if a
    /// mapping already existed (mirrors `pagedir_set_page`'s contract).
    fn set_page(&mut self, upage: usize, frame: FrameId, writable: bool) -> bool;

    /// Remove any mapping for `upage`. A no-op if none existed.
    fn clear_page(&mut self, upage: usize);

    /// Hardware accessed bit for `upage`. `false` if unmapped.
    fn is_accessed(&self, upage: usize) -> bool;

    /// Set the hardware accessed bit for `upage`.
    fn set_accessed(&mut self, upage: usize, value: bool);

    /// Hardware dirty bit for `upage`. `false` if unmapped.
    fn is_dirty(&self, upage: usize) -> bool;

    /// Set the hardware dirty bit for `upage`.
    fn set_dirty(&mut self, upage: usize, value: bool);
}

#[derive(Clone, Copy)]
struct Mapping {
    frame: FrameId,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// In-memory stand-in for a hardware page directory, used by tests and by
/// any host build of this crate.
#[derive(Default)]
pub struct MockPageDirectory {
    mappings: BTreeMap<usize, Mapping>,
}

impl MockPageDirectory {
    pub fn new() -> Self {
        Self {
            mappings: BTreeMap::new(),
        }
    }

    /// Test hook: mark a page dirty as if the CPU had just written through
    /// it, without going through the paging core.
    pub fn mark_dirty(&mut self, upage: usize) {
        if let Some(m) = self.mappings.get_mut(&upage) {
            m.dirty = true;
        }
    }
}

impl PageDirectory for MockPageDirectory {
    fn get_page(&self, upage: usize) -> Option<FrameId> {
        self.mappings.get(&upage).map(|m| m.frame)
    }

    fn set_page(&mut self, upage: usize, frame: FrameId, writable: bool) -> bool {
        if self.mappings.contains_key(&upage) {
            return false;
        }
        self.mappings.insert(
            upage,
            Mapping {
                frame,
                writable,
                accessed: true,
                dirty: false,
            },
        );
        true
    }

    fn clear_page(&mut self, upage: usize) {
        self.mappings.remove(&upage);
    }

    fn is_accessed(&self, upage: usize) -> bool {
        self.mappings.get(&upage).map(|m| m.accessed).unwrap_or(false)
    }

    fn set_accessed(&mut self, upage: usize, value: bool) {
        if let Some(m) = self.mappings.get_mut(&upage) {
            m.accessed = value;
        }
    }

    fn is_dirty(&self, upage: usize) -> bool {
        self.mappings.get(&upage).map(|m| m.dirty).unwrap_or(false)
    }

    fn set_dirty(&mut self, upage: usize, value: bool) {
        if let Some(m) = self.mappings.get_mut(&upage) {
            m.dirty = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let mut pd = MockPageDirectory::new();
        assert!(pd.set_page(0x1000, FrameId(3), true));
        assert_eq!(pd.get_page(0x1000), Some(FrameId(3)));
    }

    #[test]
    fn duplicate_set_page_fails() {
        let mut pd = MockPageDirectory::new();
        assert!(pd.set_page(0x1000, FrameId(0), true));
        assert!(!pd.set_page(0x1000, FrameId(1), true));
    }

    #[test]
    fn clear_removes_mapping() {
        let mut pd = MockPageDirectory::new();
        pd.set_page(0x1000, FrameId(0), true);
        pd.clear_page(0x1000);
        assert_eq!(pd.get_page(0x1000), None);
        assert!(!pd.is_accessed(0x1000));
    }

    #[test]
    fn accessed_bit_defaults_true_on_install_and_is_settable() {
        let mut pd = MockPageDirectory::new();
        pd.set_page(0x2000, FrameId(0), true);
        assert!(pd.is_accessed(0x2000));
        pd.set_accessed(0x2000, false);
        assert!(!pd.is_accessed(0x2000));
    }

    #[test]
    fn dirty_bit_defaults_false_and_mark_dirty_sets_it() {
        let mut pd = MockPageDirectory::new();
        pd.set_page(0x2000, FrameId(0), true);
        assert!(!pd.is_dirty(0x2000));
        pd.mark_dirty(0x2000);
        assert!(pd.is_dirty(0x2000));
    }
}
