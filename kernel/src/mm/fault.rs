//! The page-fault and syscall pointer-validation path: resolving a fault
//! to a load, growing the stack, and the `check_addr*` / `unpin_all_*`
//! family syscall argument validation uses before touching user memory.

use alloc::collections::BTreeMap;

use crate::error::{VmError, VmFault};
use crate::mm::frame_table::SpteId;
use crate::mm::spte::SpteStatus;
use crate::mm::{
    page_round_down, FileId, FrameId, MAX_STACK_SIZE, PAGE_SIZE, PHYS_BASE, STACK_THRESH,
};
use crate::log_service::LogLevel;
use crate::print::log_and_record;
use crate::process::Process;
use crate::vm_error;

/// An open file as far as this crate is concerned: the underlying
/// `FileId` plus the read/write cursor `seek`/`tell` report on.
struct OpenFile {
    file: FileId,
    position: u64,
}

/// Per-process open file descriptor table. A thin layer over `FileId`
/// that exists only so `filesize`/`seek`/`tell`/`close` have something
/// to validate against instead of trusting the caller's `fd`.
#[derive(Default)]
pub struct FileTable {
    open: BTreeMap<u32, OpenFile>,
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            open: BTreeMap::new(),
        }
    }

    pub fn open_file(&mut self, fd: u32, file: FileId) {
        self.open.insert(fd, OpenFile { file, position: 0 });
    }

    /// `filesize`: the source dereferences whatever the fd list lookup
    /// returns without checking it was found; this returns
    /// `UnknownFileDescriptor` instead.
    pub fn filesize(&self, fd: u32, len: impl Fn(FileId) -> u64) -> Result<u64, VmError> {
        let entry = self.open.get(&fd).ok_or(vm_error!(UnknownFileDescriptor { fd }))?;
        Ok(len(entry.file))
    }

    pub fn seek(&mut self, fd: u32, position: u64) -> Result<(), VmError> {
        let entry = self
            .open
            .get_mut(&fd)
            .ok_or(vm_error!(UnknownFileDescriptor { fd }))?;
        entry.position = position;
        Ok(())
    }

    pub fn tell(&self, fd: u32) -> Result<u64, VmError> {
        let entry = self.open.get(&fd).ok_or(vm_error!(UnknownFileDescriptor { fd }))?;
        Ok(entry.position)
    }

    /// `close`: a no-op (not an error) if `fd` is already closed or was
    /// never opened, matching every other fd-keyed operation's handling
    /// of a missing entry.
    pub fn close(&mut self, fd: u32) {
        self.open.remove(&fd);
    }
}

impl Process {
    /// `check_addr`: validate `addr` for read/write access, loading or
    /// growing the stack as needed, and leave the page pinned resident.
    /// The caller releases it the same way it would a one-byte buffer:
    /// `unpin_all_buffer(addr, 1)`.
    pub fn check_addr(&self, addr: usize, user_sp: usize) -> Result<(), VmFault> {
        self.validate_range(addr, 1, false, user_sp)
    }

    /// `check_addr_buffer`: validate every page touching `[addr, addr +
    /// size)`, rejecting a write into a read-only page. Leaves every
    /// touched page pinned; the caller must call `unpin_all_buffer` with
    /// the same `addr`/`size` once done with the buffer.
    pub fn check_addr_buffer(
        &self,
        addr: usize,
        size: usize,
        writing: bool,
        user_sp: usize,
    ) -> Result<(), VmFault> {
        self.validate_range(addr, size, writing, user_sp)
    }

    /// `check_addr_string`: validate and pin pages starting at `addr`
    /// until a NUL byte is found, bounded by `max_len`. Returns the
    /// string length (excluding the terminator) on success. Every byte
    /// is treated uniformly: no page is unpinned until the matching
    /// `unpin_all_string` call, normalizing the source's inconsistent
    /// pin-release flag between the first byte and the rest.
    pub fn check_addr_string(&self, addr: usize, max_len: usize, user_sp: usize) -> Result<usize, VmFault> {
        let mut len = 0;
        loop {
            if len >= max_len {
                return Err(VmFault::Terminate);
            }
            let byte_addr = addr + len;
            self.validate_range(byte_addr, 1, false, user_sp)?;
            let byte = self.read_byte(byte_addr);
            if byte == 0 {
                return Ok(len);
            }
            len += 1;
        }
    }

    /// `unpin_all_buffer`: unpin every page in `[addr, addr + size)`
    /// exactly once. The source unpins `addr + 1` on every loop
    /// iteration regardless of the loop variable; this walks the actual
    /// page range instead.
    pub fn unpin_all_buffer(&self, addr: usize, size: usize) {
        if size == 0 {
            return;
        }
        let mut upage = page_round_down(addr);
        let end = addr + size;
        while upage < end {
            self.spt.unpin(upage);
            upage += PAGE_SIZE;
        }
    }

    /// `unpin_all_string`: unpin every page spanned by a string of `len`
    /// bytes starting at `addr` (as returned by `check_addr_string`),
    /// plus its NUL terminator.
    pub fn unpin_all_string(&self, addr: usize, len: usize) {
        self.unpin_all_buffer(addr, len + 1);
    }

    /// The hardware page-fault entry point: resolve `fault_addr` against
    /// the SPT, loading it from its backing source or growing the stack.
    /// Unlike the syscall validation path, the fault is fully resolved
    /// before returning, so no pin is left for a caller to release.
    pub fn load_page(&self, fault_addr: usize, user_sp: usize) -> Result<(), VmFault> {
        let upage = page_round_down(fault_addr);
        if let Some(spte) = self.spt.find(upage) {
            self.load_existing(&spte)?;
            spte.unpin();
            return Ok(());
        }
        if Self::is_stack_growth(fault_addr, user_sp) {
            self.grow_stack(upage)?;
            if let Some(spte) = self.spt.find(upage) {
                spte.unpin();
            }
            return Ok(());
        }
        log_and_record(LogLevel::Warn, "fault", "invalid address, terminating process");
        Err(VmFault::Terminate)
    }

    fn validate_range(&self, addr: usize, size: usize, writing: bool, user_sp: usize) -> Result<(), VmFault> {
        if addr == 0 {
            log_and_record(
                LogLevel::Warn,
                "fault",
                &alloc::format!("{}", vm_error!(InvalidAddress { addr })),
            );
            return Err(VmFault::Terminate);
        }
        let end = addr.checked_add(size).ok_or(VmFault::Terminate)?;
        if end > PHYS_BASE {
            log_and_record(
                LogLevel::Warn,
                "fault",
                &alloc::format!("{}", vm_error!(InvalidAddress { addr })),
            );
            return Err(VmFault::Terminate);
        }

        let mut upage = page_round_down(addr);
        while upage < end {
            self.load_or_grow_and_pin(upage, user_sp)?;
            if writing {
                let spte = self.spt.find(upage).ok_or(VmFault::Terminate)?;
                if !spte.writable {
                    self.unpin_all_buffer(addr, size);
                    return Err(VmFault::Terminate);
                }
            }
            upage += PAGE_SIZE;
        }
        Ok(())
    }

    fn load_or_grow_and_pin(&self, upage: usize, user_sp: usize) -> Result<(), VmFault> {
        if let Some(spte) = self.spt.find(upage) {
            self.load_existing(&spte)?;
            return Ok(());
        }
        if Self::is_stack_growth(upage, user_sp) {
            return self.grow_stack(upage);
        }
        Err(VmFault::Terminate)
    }

    /// Bring an existing SPTE into a resident frame if it is not already
    /// one, pinning it for the duration of the load so the clock scan
    /// cannot select it mid-transition.
    fn load_existing(&self, spte: &alloc::sync::Arc<crate::mm::spte::Spte>) -> Result<(), VmFault> {
        let mut status = spte.lock_state();
        spte.set_pinned(true);
        let contents = match *status {
            SpteStatus::InFrame { .. } => return Ok(()),
            SpteStatus::InFile {
                file,
                ofs,
                read_bytes,
                zero_bytes,
            } => {
                let mut buf = [0u8; PAGE_SIZE];
                let got = {
                    let _guard = self.system.filesys_lock.lock();
                    self.system.fs.read_at(file, ofs, &mut buf[..read_bytes as usize])
                };
                if got != read_bytes as usize {
                    log_and_record(
                        LogLevel::Error,
                        "fault",
                        &alloc::format!("{}", vm_error!(ShortRead { expected: read_bytes, got })),
                    );
                    return Err(VmFault::Terminate);
                }
                debug_assert!(read_bytes as usize + zero_bytes as usize <= PAGE_SIZE);
                buf
            }
            SpteStatus::InStack { .. } => [0u8; PAGE_SIZE],
            SpteStatus::InSwap { swap_idx } => {
                let mut buf = [0u8; PAGE_SIZE];
                self.system.swap.swap_in(swap_idx, &mut buf);
                buf
            }
        };

        let frame = self.obtain_frame(spte.upage)?;
        self.system.frame_table.write_frame(frame, |data| *data = contents);
        if !self.pagedir.lock().set_page(spte.upage, frame, spte.writable) {
            self.system.frame_table.free(frame);
            log_and_record(
                LogLevel::Error,
                "fault",
                &alloc::format!("{}", vm_error!(MappingInstallFailed { upage: spte.upage })),
            );
            return Err(VmFault::Terminate);
        }
        *status = SpteStatus::InFrame { frame };
        log_and_record(LogLevel::Debug, "fault", "loaded page into frame");
        Ok(())
    }

    fn obtain_frame(&self, upage: usize) -> Result<FrameId, VmFault> {
        self.system
            .frame_table
            .alloc(SpteId { pid: self.pid, upage }, &self.system)
            .map_err(|_| VmFault::Terminate)
    }

    fn grow_stack(&self, upage: usize) -> Result<(), VmFault> {
        if !self.spt.add_stack(upage, PAGE_SIZE as u32, true) {
            // Another fault on the same page beat us to it; fine.
        }
        let spte = self.spt.find(upage).ok_or(VmFault::Terminate)?;
        log_and_record(LogLevel::Debug, "fault", "growing stack");
        self.load_existing(&spte)
    }

    fn is_stack_growth(addr: usize, user_sp: usize) -> bool {
        if addr >= PHYS_BASE || addr < PHYS_BASE.saturating_sub(MAX_STACK_SIZE) {
            return false;
        }
        addr.saturating_add(STACK_THRESH) >= user_sp
    }

    fn read_byte(&self, addr: usize) -> u8 {
        let upage = page_round_down(addr);
        let offset = addr - upage;
        let Some(spte) = self.spt.find(upage) else {
            return 0;
        };
        let SpteStatus::InFrame { frame } = spte.status() else {
            return 0;
        };
        let mut byte = 0u8;
        self.system.frame_table.read_frame(frame, |data| byte = data[offset]);
        byte
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
    use crate::mm::SECTORS_PER_PAGE;
    use crate::process::PagingSystem;
    use alloc::boxed::Box;
    use alloc::sync::Arc;

    fn process(frames: usize) -> Arc<Process> {
        let device: Arc<dyn crate::mm::block::BlockDevice> =
            Arc::new(RamBlockDevice::new(4 * SECTORS_PER_PAGE as u64));
        let system = PagingSystem::new(
            FrameTable::new(frames),
            SwapAllocator::new(device),
            Box::new(InMemoryFileSystem::new()),
        );
        Process::new(Box::new(MockPageDirectory::new()), system)
    }

    const USER_SP: usize = PHYS_BASE - PAGE_SIZE;

    #[test]
    fn load_page_resolves_stack_backed_entry() {
        let process = process(2);
        process.spt.add_stack(USER_SP, PAGE_SIZE as u32, true);
        process.load_page(USER_SP, USER_SP).expect("stack page should load");

        let spte = process.spt.find(USER_SP).unwrap();
        assert!(matches!(spte.status(), SpteStatus::InFrame { .. }));
        assert!(!spte.is_pinned(), "load_page must release its pin once resolved");
    }

    #[test]
    fn load_page_grows_stack_within_threshold() {
        let process = process(2);
        let fault_addr = USER_SP - 4;
        process.load_page(fault_addr, USER_SP).expect("within STACK_THRESH of sp");
        assert!(process.spt.find(fault_addr).is_some());
    }

    #[test]
    fn load_page_rejects_address_far_below_stack_pointer() {
        let process = process(2);
        let fault_addr = USER_SP - STACK_THRESH - PAGE_SIZE;
        let err = process.load_page(fault_addr, USER_SP).unwrap_err();
        assert_eq!(err, VmFault::Terminate);
    }

    /// Scenario 1: stack growth at the exact threshold edge.
    #[test]
    fn stack_growth_at_exact_threshold_creates_one_zeroed_writable_page() {
        let process = process(2);
        let user_sp = PHYS_BASE - 0x1000;
        let fault_addr = PHYS_BASE - 0x1000 - 32;

        process.load_page(fault_addr, user_sp).expect("exactly at STACK_THRESH must grow");

        let upage = page_round_down(fault_addr);
        let spte = process.spt.find(upage).expect("one new INSTACK spte");
        assert!(spte.writable);
        let SpteStatus::InFrame { frame } = spte.status() else {
            panic!("expected the grown page to be loaded");
        };
        process
            .system
            .frame_table
            .read_frame(frame, |data| assert_eq!(*data, [0u8; PAGE_SIZE]));
    }

    /// Scenario 2: one byte outside the stack-growth window terminates.
    #[test]
    fn stack_growth_one_byte_outside_window_terminates() {
        let process = process(2);
        let user_sp = PHYS_BASE - 0x1000;
        let fault_addr = PHYS_BASE - 0x1000 - 33;

        let err = process.load_page(fault_addr, user_sp).unwrap_err();
        assert_eq!(err, VmFault::Terminate);
    }

    #[test]
    fn load_page_on_already_resident_page_is_a_no_op() {
        let process = process(2);
        process.spt.add_stack(USER_SP, PAGE_SIZE as u32, true);
        process.load_page(USER_SP, USER_SP).expect("first load");
        let spte = process.spt.find(USER_SP).unwrap();
        let SpteStatus::InFrame { frame: first_frame } = spte.status() else {
            panic!("expected resident page");
        };

        process.load_page(USER_SP, USER_SP).expect("second load is a no-op");
        let SpteStatus::InFrame { frame: second_frame } = spte.status() else {
            panic!("must remain resident");
        };
        assert_eq!(first_frame, second_frame);
    }

    /// Scenario 4: with 4 frames and 5 file-backed pages, the first page
    /// loaded is evicted to swap under pressure, then reloaded from swap
    /// (not re-read from the file) on a later access.
    #[test]
    fn evicted_file_backed_page_reloads_from_swap_not_file() {
        let mut fs = InMemoryFileSystem::new();
        for page in 0..5u32 {
            fs.insert(page, alloc::vec![page as u8; PAGE_SIZE]);
        }
        let device: Arc<dyn crate::mm::block::BlockDevice> =
            Arc::new(RamBlockDevice::new(8 * SECTORS_PER_PAGE as u64));
        let system = PagingSystem::new(FrameTable::new(4), SwapAllocator::new(device), Box::new(fs));
        let process = Process::new(Box::new(MockPageDirectory::new()), system);

        let base = USER_SP - 5 * PAGE_SIZE;
        for page in 0..5u32 {
            let upage = base + page as usize * PAGE_SIZE;
            process
                .spt
                .add_file_backed(upage, page, 0, PAGE_SIZE as u32, 0, true);
            process.load_page(upage, USER_SP).expect("file-backed page loads");
            // Keep every earlier page looking cold so the clock scan picks
            // page 0 as its victim once the table is full.
            if page > 0 {
                process.pagedir.lock().set_accessed(base, false);
            }
        }

        let spte = process.spt.find(base).unwrap();
        assert!(
            matches!(spte.status(), SpteStatus::InSwap { .. }),
            "page 0 must have been evicted to make room for pages 1..4"
        );

        // Dirty the swapped copy so a reload-from-file (instead of
        // reload-from-swap) would be observably wrong.
        let SpteStatus::InSwap { swap_idx } = spte.status() else {
            unreachable!()
        };
        let mut dirtied = [0u8; PAGE_SIZE];
        process.system.swap.swap_in(swap_idx, &mut dirtied);
        dirtied[0] = 0xFF;
        let swap_idx_again = process.system.swap.swap_out(&dirtied);
        *spte.lock_state() = SpteStatus::InSwap { swap_idx: swap_idx_again };
        process.pagedir.lock().set_accessed(base, false);

        process.load_page(base, USER_SP).expect("reload from swap");
        let SpteStatus::InFrame { frame } = spte.status() else {
            panic!("expected page 0 to be resident again");
        };
        process.system.frame_table.read_frame(frame, |data| {
            assert_eq!(data[0], 0xFF, "reload must come from swap, not a fresh file read");
        });
    }

    /// A file-backed SPTE is allowed to zero-pad short of a full page
    /// (spec.md §3's `read_bytes + zero_bytes <= page_size`); loading one
    /// must succeed rather than trip a stricter-than-spec assertion.
    #[test]
    fn load_page_accepts_file_backed_page_shorter_than_a_full_page() {
        let mut fs = InMemoryFileSystem::new();
        fs.insert(0, alloc::vec![7u8; 10]);
        let device: Arc<dyn crate::mm::block::BlockDevice> =
            Arc::new(RamBlockDevice::new(4 * SECTORS_PER_PAGE as u64));
        let system = PagingSystem::new(FrameTable::new(2), SwapAllocator::new(device), Box::new(fs));
        let process = Process::new(Box::new(MockPageDirectory::new()), system);

        process
            .spt
            .add_file_backed(USER_SP, 0, 0, 10, PAGE_SIZE as u32 - 10, true);
        process.load_page(USER_SP, USER_SP).expect("short file-backed page still loads");

        let spte = process.spt.find(USER_SP).unwrap();
        let SpteStatus::InFrame { frame } = spte.status() else {
            panic!("expected page to be resident");
        };
        process.system.frame_table.read_frame(frame, |data| {
            assert_eq!(&data[..10], &[7u8; 10][..]);
            assert_eq!(data[10], 0, "bytes past read_bytes must be zeroed");
        });
    }

    #[test]
    fn load_page_rejects_address_above_phys_base() {
        let process = process(2);
        let err = process.load_page(PHYS_BASE, USER_SP).unwrap_err();
        assert_eq!(err, VmFault::Terminate);
    }

    #[test]
    fn check_addr_pins_until_released_as_a_one_byte_buffer() {
        let process = process(2);
        process.spt.add_stack(USER_SP, PAGE_SIZE as u32, true);
        process.check_addr(USER_SP, USER_SP).expect("valid stack address");

        let spte = process.spt.find(USER_SP).unwrap();
        assert!(spte.is_pinned(), "check_addr must leave the page pinned resident");

        process.unpin_all_buffer(USER_SP, 1);
        assert!(!spte.is_pinned());
    }

    #[test]
    fn check_addr_buffer_rejects_write_to_read_only_page() {
        let process = process(2);
        process.spt.add_stack(USER_SP, PAGE_SIZE as u32, false);
        let err = process
            .check_addr_buffer(USER_SP, 4, true, USER_SP)
            .unwrap_err();
        assert_eq!(err, VmFault::Terminate);

        let spte = process.spt.find(USER_SP).unwrap();
        assert!(!spte.is_pinned(), "rejected write must not leak a pin");
    }

    #[test]
    fn check_addr_buffer_pins_until_unpin_all_buffer() {
        let process = process(2);
        process.spt.add_stack(USER_SP, PAGE_SIZE as u32, true);
        process
            .check_addr_buffer(USER_SP, 4, false, USER_SP)
            .expect("valid stack buffer");
        let spte = process.spt.find(USER_SP).unwrap();
        assert!(spte.is_pinned());

        process.unpin_all_buffer(USER_SP, 4);
        assert!(!spte.is_pinned());
    }

    #[test]
    fn unpin_all_buffer_releases_every_spanned_page() {
        let process = process(4);
        process.spt.add_stack(USER_SP, PAGE_SIZE as u32, true);
        process.spt.add_stack(USER_SP + PAGE_SIZE, PAGE_SIZE as u32, true);

        process
            .check_addr_buffer(USER_SP, PAGE_SIZE + 8, false, USER_SP)
            .expect("spans two pages");
        let first = process.spt.find(USER_SP).unwrap();
        let second = process.spt.find(USER_SP + PAGE_SIZE).unwrap();
        assert!(first.is_pinned() && second.is_pinned());

        process.unpin_all_buffer(USER_SP, PAGE_SIZE + 8);
        assert!(!first.is_pinned() && !second.is_pinned());
    }

    #[test]
    fn check_addr_string_stops_at_nul_and_unpin_all_string_releases_it() {
        let process = process(2);
        process.spt.add_stack(USER_SP, PAGE_SIZE as u32, true);
        process
            .load_page(USER_SP, USER_SP)
            .expect("prime the page so we can write a string into it");

        let spte = process.spt.find(USER_SP).unwrap();
        let frame = match spte.status() {
            SpteStatus::InFrame { frame } => frame,
            _ => unreachable!(),
        };
        process.system.frame_table.write_frame(frame, |data| {
            data[..6].copy_from_slice(b"hello\0");
        });

        let len = process
            .check_addr_string(USER_SP, 64, USER_SP)
            .expect("nul-terminated string within bound");
        assert_eq!(len, 5);
        assert!(spte.is_pinned());

        process.unpin_all_string(USER_SP, len);
        assert!(!spte.is_pinned());
    }

    #[test]
    fn check_addr_string_rejects_unterminated_run_past_max_len() {
        let process = process(2);
        process.spt.add_stack(USER_SP, PAGE_SIZE as u32, true);
        process
            .load_page(USER_SP, USER_SP)
            .expect("prime the page");
        let spte = process.spt.find(USER_SP).unwrap();
        let frame = match spte.status() {
            SpteStatus::InFrame { frame } => frame,
            _ => unreachable!(),
        };
        process
            .system
            .frame_table
            .write_frame(frame, |data| *data = [b'x'; PAGE_SIZE]);

        let err = process.check_addr_string(USER_SP, 4, USER_SP).unwrap_err();
        assert_eq!(err, VmFault::Terminate);
    }

    #[test]
    fn file_table_rejects_unknown_descriptor() {
        let mut files = FileTable::new();
        assert_eq!(
            files.filesize(7, |_| 0),
            Err(VmError::UnknownFileDescriptor { fd: 7 })
        );
        assert_eq!(files.tell(7), Err(VmError::UnknownFileDescriptor { fd: 7 }));
        assert_eq!(
            files.seek(7, 0),
            Err(VmError::UnknownFileDescriptor { fd: 7 })
        );
        // close on an unknown fd is a no-op, not an error.
        files.close(7);
    }

    #[test]
    fn file_table_tracks_position_across_seek_and_tell() {
        let mut files = FileTable::new();
        files.open_file(3, 42);
        assert_eq!(files.filesize(3, |_| 100), Ok(100));
        files.seek(3, 10).unwrap();
        assert_eq!(files.tell(3), Ok(10));
        files.close(3);
        assert_eq!(files.tell(3), Err(VmError::UnknownFileDescriptor { fd: 3 }));
    }
}
