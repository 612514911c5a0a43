//! Swap slot allocator: a bitmap of page-sized slots over a block device.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::mm::block::BlockDevice;
use crate::mm::{SwapIndex, PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};
use crate::print::log_and_record;
use crate::log_service::LogLevel;

/// A fixed-length bit vector, packed 64 bits per word, same layout style
/// used by the frame allocator's bitmap.
struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    fn new(len: usize) -> Self {
        let word_count = len.div_ceil(64);
        Self {
            words: alloc::vec![0u64; word_count],
            len,
        }
    }

    fn get(&self, i: usize) -> bool {
        debug_assert!(i < self.len);
        self.words[i / 64] & (1 << (i % 64)) != 0
    }

    fn set(&mut self, i: usize, value: bool) {
        debug_assert!(i < self.len);
        if value {
            self.words[i / 64] |= 1 << (i % 64);
        } else {
            self.words[i / 64] &= !(1 << (i % 64));
        }
    }

    /// Find the first clear bit, set it, and return its index — the
    /// "scan and flip" operation the swap allocator needs atomically.
    fn scan_and_flip(&mut self) -> Option<usize> {
        for i in 0..self.len {
            if !self.get(i) {
                self.set(i, true);
                return Some(i);
            }
        }
        None
    }
}

/// Owns the swap block device and the bitmap of occupied slots.
///
/// Slot `i` occupies sectors `[i * SECTORS_PER_PAGE, (i + 1) * SECTORS_PER_PAGE)`
/// on the device. All three operations take the allocator's single mutex;
/// per spec.md §4.1 the device is serialized anyway, so holding the mutex
/// across the I/O is not a concurrency hazard.
pub struct SwapAllocator {
    device: Arc<dyn BlockDevice>,
    bitmap: Mutex<Bitmap>,
}

impl SwapAllocator {
    /// Build the allocator over `device`, sized to however many whole
    /// page-sized slots the device holds.
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slot_count = (device.sector_count() as usize) / SECTORS_PER_PAGE;
        Self {
            device,
            bitmap: Mutex::new(Bitmap::new(slot_count)),
        }
    }

    /// Write `frame` out to a freshly allocated slot and return its index.
    ///
    /// Fatal (panics) if the bitmap is exhausted: spec.md §5/§7 treat swap
    /// exhaustion as an unrecoverable, system-wide condition.
    pub fn swap_out(&self, frame: &[u8; PAGE_SIZE]) -> SwapIndex {
        let idx = {
            let mut bitmap = self.bitmap.lock();
            bitmap
                .scan_and_flip()
                .expect("swap space exhausted: no free slot to evict a frame into")
        };
        let base_sector = (idx * SECTORS_PER_PAGE) as u64;
        for s in 0..SECTORS_PER_PAGE {
            let start = s * SECTOR_SIZE;
            self.device
                .write_sector(base_sector + s as u64, &frame[start..start + SECTOR_SIZE]);
        }
        log_and_record(LogLevel::Debug, "swap", "wrote frame to swap slot");
        SwapIndex(idx)
    }

    /// Read slot `idx` into `frame` and free the slot.
    pub fn swap_in(&self, idx: SwapIndex, frame: &mut [u8; PAGE_SIZE]) {
        let base_sector = (idx.0 * SECTORS_PER_PAGE) as u64;
        for s in 0..SECTORS_PER_PAGE {
            let start = s * SECTOR_SIZE;
            self.device
                .read_sector(base_sector + s as u64, &mut frame[start..start + SECTOR_SIZE]);
        }
        self.bitmap.lock().set(idx.0, false);
        log_and_record(LogLevel::Debug, "swap", "read frame back from swap slot");
    }

    /// Free slot `idx` without touching the device.
    ///
    /// The original implementation this allocator is modeled on sets the
    /// bit to the *occupied* value here instead of freeing it; this crate
    /// actually frees the slot, consistent with every other path through
    /// the allocator.
    pub fn swap_clear(&self, idx: SwapIndex) {
        self.bitmap.lock().set(idx.0, false);
    }

    #[cfg(test)]
    fn is_occupied(&self, idx: SwapIndex) -> bool {
        self.bitmap.lock().get(idx.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::block::RamBlockDevice;

    fn allocator(slots: usize) -> SwapAllocator {
        let device: Arc<dyn BlockDevice> =
            Arc::new(RamBlockDevice::new((slots * SECTORS_PER_PAGE) as u64));
        SwapAllocator::new(device)
    }

    #[test]
    fn swap_round_trip_preserves_bytes_and_frees_slot() {
        let swap = allocator(4);
        let mut frame = [0u8; PAGE_SIZE];
        for (i, b) in frame.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }

        let idx = swap.swap_out(&frame);
        assert!(swap.is_occupied(idx));

        let mut back = [0u8; PAGE_SIZE];
        swap.swap_in(idx, &mut back);
        assert_eq!(back, frame);
        assert!(!swap.is_occupied(idx));
    }

    #[test]
    fn swap_clear_frees_without_io() {
        let swap = allocator(4);
        let frame = [7u8; PAGE_SIZE];
        let idx = swap.swap_out(&frame);
        assert!(swap.is_occupied(idx));

        swap.swap_clear(idx);
        assert!(!swap.is_occupied(idx));
    }

    #[test]
    fn allocates_distinct_slots() {
        let swap = allocator(4);
        let frame = [0u8; PAGE_SIZE];
        let a = swap.swap_out(&frame);
        let b = swap.swap_out(&frame);
        assert_ne!(a, b);
    }

    #[test]
    #[should_panic(expected = "swap space exhausted")]
    fn exhaustion_panics() {
        let swap = allocator(1);
        let frame = [0u8; PAGE_SIZE];
        swap.swap_out(&frame);
        swap.swap_out(&frame);
    }
}
