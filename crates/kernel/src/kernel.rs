//! The kernel context: physical pages, the kernel page table and the process table.
//!
//! One [`Kernel`] value is created at boot and every operation borrows it mutably. Process
//! lifecycle operations live here; trap handling and scheduling are in their own modules.

use alloc::{string::String, vec, vec::Vec};
use core::{fmt, ops::Range};

use pmm::{
    AllocError, FrameNumber, PageAllocator, PageFlags, PageTable, PhysicalAddress,
    PhysicalMemory, VirtualAddress,
};
use thiserror::Error;

use crate::{
    address_space::{AddressSpace, LoadError, UserAccess},
    interrupts::{InterruptVector, PageFaultError},
    layout::{
        CONSOLE_ADDR, MEMSIZE_VIRTUAL, NPAGES, PROC_START_ADDR, is_user_page, reserved_ranges,
    },
    process::{Pid, ProcessState, ProcessTable},
    program::{ImageError, ProgramImage, ProgramSource},
    registers::Registers,
};

/// Fatal errors. The system reports them and stops scheduling.
#[derive(Debug, Error)]
pub enum KernelPanic {
    #[error("Kernel page fault on {address} ({} {}, rip={rip:#x})!", .error.operation(), .error.problem())]
    KernelPageFault {
        address: VirtualAddress,
        error: PageFaultError,
        rip: u64,
    },
    #[error("Unhandled exception {vector} (rip={rip:#x})!")]
    UnhandledException { vector: InterruptVector, rip: u64 },
    #[error("Unhandled system call {code} (pid={pid}, rip={rip:#x})!")]
    UnhandledSyscall { code: u64, pid: Pid, rip: u64 },
    #[error("process {pid}: {message}")]
    UserPanic { pid: Pid, message: String },
    #[error("setting up process {pid}: {source}")]
    Setup {
        pid: Pid,
        #[source]
        source: SetupError,
    },
}

/// Errors from setting up a process from a program image.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("process slot {0} is not free")]
    SlotInUse(Pid),
    #[error("no program named {0:?}")]
    UnknownProgram(String),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    OutOfMemory(#[from] AllocError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ForkError {
    #[error("no free process slot")]
    NoFreeSlot,
    #[error("process {0} has no address space")]
    NoAddressSpace(Pid),
    #[error(transparent)]
    OutOfMemory(#[from] AllocError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PageAllocError {
    #[error("{0:#x} is not a page-aligned user address")]
    BadAddress(u64),
    #[error("process {0} has no address space")]
    NoAddressSpace(Pid),
    #[error(transparent)]
    OutOfMemory(#[from] AllocError),
}

/// A page whose reference count disagrees with the page tables that point at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefcountMismatch {
    pub page: PhysicalAddress,
    pub refcount: u16,
    pub references: usize,
}

impl fmt::Display for RefcountMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "page {} has refcount {} but {} references",
            self.page, self.refcount, self.references
        )
    }
}

pub struct Kernel {
    pub(crate) pages: PageAllocator,
    pub(crate) kernel_table: PageTable,
    pub(crate) processes: ProcessTable,
    pub(crate) current: Option<Pid>,
    pub(crate) ticks: u64,
    pub(crate) spins: u64,
    #[cfg(feature = "memviewer")]
    pub(crate) viewer: crate::memviewer::MemoryViewer,
}

impl Kernel {
    /// Takes over physical memory and builds the kernel page table.
    ///
    /// The first [`NPAGES`] pages are managed; `boot_reserved` lists firmware-owned ranges
    /// inside them. The kernel table identity maps every managed page except page 0:
    /// kernel-only below [`PROC_START_ADDR`], user-accessible above it and at the
    /// console. If `upper_half` names a top-level table, its kernel half is shared into
    /// the kernel table and, through it, into every process.
    pub fn new(
        memory: PhysicalMemory,
        boot_reserved: &[Range<PhysicalAddress>],
        upper_half: Option<PhysicalAddress>,
    ) -> Result<Self, AllocError> {
        let mut reserved: Vec<_> = reserved_ranges().into_iter().collect();
        reserved.extend(boot_reserved.iter().cloned());
        let mut pages = PageAllocator::with_managed_pages(memory, NPAGES, &reserved);

        let mut kernel_table = PageTable::new(&mut pages)?;
        if let Some(root) = upper_half {
            kernel_table.share_kernel_half(pages.memory_mut(), root);
        }
        for page in 1..NPAGES {
            let pa = FrameNumber::new(page).start();
            let va = VirtualAddress::new(pa.as_usize());
            let flags = if va == CONSOLE_ADDR || va >= PROC_START_ADDR {
                PageFlags::user_rw()
            } else {
                PageFlags::kernel_rw()
            };
            kernel_table.map(&mut pages, va, pa, flags)?;
        }

        log::info!(
            "kernel page table at {}, {} of {} pages free",
            kernel_table.root(),
            pages.free_count(),
            NPAGES
        );

        Ok(Self {
            pages,
            kernel_table,
            processes: ProcessTable::new(),
            current: None,
            ticks: 0,
            spins: 0,
            #[cfg(feature = "memviewer")]
            viewer: crate::memviewer::MemoryViewer::new(),
        })
    }

    pub fn pages(&self) -> &PageAllocator {
        &self.pages
    }

    pub fn kernel_table(&self) -> &PageTable {
        &self.kernel_table
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    /// The process that is running, or ran last.
    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn registers(&self, pid: Pid) -> &Registers {
        &self.processes.get(pid).registers
    }

    pub fn state(&self, pid: Pid) -> ProcessState {
        self.processes.get(pid).state
    }

    pub fn address_space(&self, pid: Pid) -> Option<&AddressSpace> {
        self.processes.get(pid).address_space.as_ref()
    }

    /// Returns the physical memory the kernel manages.
    pub fn memory_mut(&mut self) -> &mut PhysicalMemory {
        self.pages.memory_mut()
    }

    /// Loads `image` into the free slot `pid` and makes it runnable.
    pub fn setup(&mut self, pid: Pid, image: &ProgramImage<'_>) -> Result<(), SetupError> {
        if !self.processes.get(pid).is_free() {
            return Err(SetupError::SlotInUse(pid));
        }

        let mut space = AddressSpace::new(&mut self.pages, &self.kernel_table)?;
        let stack_top = match space.load_segments(&mut self.pages, image) {
            Ok(stack_top) => stack_top,
            Err(err) => {
                space.destroy(&mut self.pages);
                return Err(err.into());
            }
        };

        let process = self.processes.get_mut(pid);
        process.registers = Registers::user(image.entry, stack_top);
        process.address_space = Some(space);
        process.state = ProcessState::Runnable;
        log::info!("process {} set up, entry {}", pid, image.entry);
        Ok(())
    }

    /// Looks `name` up in `source` and sets it up as `pid`.
    pub fn setup_program(
        &mut self,
        pid: Pid,
        source: &impl ProgramSource,
        name: &str,
    ) -> Result<(), SetupError> {
        let image = source
            .program(name)
            .ok_or_else(|| SetupError::UnknownProgram(name.into()))?;
        self.setup(pid, &image)
    }

    /// Creates a copy of `parent` in the lowest free slot.
    ///
    /// The child resumes with the parent's registers except that it sees 0 in `rax`. On
    /// failure nothing about the parent or the process table has changed.
    pub fn fork(&mut self, parent: Pid) -> Result<Pid, ForkError> {
        let child = self.processes.find_free().ok_or(ForkError::NoFreeSlot)?;
        let space = self
            .processes
            .get(parent)
            .address_space
            .as_ref()
            .ok_or(ForkError::NoAddressSpace(parent))?
            .duplicate(&mut self.pages, &self.kernel_table)?;

        let mut registers = self.processes.get(parent).registers.clone();
        registers.set_return(0);

        let process = self.processes.get_mut(child);
        process.registers = registers;
        process.address_space = Some(space);
        process.state = ProcessState::Runnable;
        log::debug!("process {} forked into {}", parent, child);
        Ok(child)
    }

    /// Releases every page of `pid` and frees its slot.
    pub fn exit(&mut self, pid: Pid) {
        let process = self.processes.get_mut(pid);
        if let Some(space) = process.address_space.take() {
            space.destroy(&mut self.pages);
        }
        process.state = ProcessState::Free;
        process.registers = Registers::default();
        log::debug!("process {} exited, {} pages free", pid, self.pages.free_count());
    }

    /// Maps a fresh zeroed page at `addr` in `pid`, replacing any previous page there.
    pub fn page_alloc(&mut self, pid: Pid, addr: u64) -> Result<(), PageAllocError> {
        let va = VirtualAddress::try_new(addr as usize)
            .filter(|va| va.is_page_aligned() && *va >= PROC_START_ADDR && *va < MEMSIZE_VIRTUAL)
            .ok_or(PageAllocError::BadAddress(addr))?;
        let space = self
            .processes
            .get_mut(pid)
            .address_space
            .as_mut()
            .ok_or(PageAllocError::NoAddressSpace(pid))?;
        space.allocate_page(&mut self.pages, va)?;
        Ok(())
    }

    /// Recomputes every page's expected reference count from the page tables.
    ///
    /// Each table page of the kernel table and of every non-free process counts once,
    /// as does every user leaf in a process's user region.
    pub fn audit(&self) -> Result<(), RefcountMismatch> {
        let memory = self.pages.memory();
        let mut references = vec![0usize; NPAGES];
        let mut count = |pa: PhysicalAddress| {
            if let Some(slot) = references.get_mut(pa.frame_number().as_usize()) {
                *slot += 1;
            }
        };

        self.kernel_table
            .structure_pages(memory)
            .into_iter()
            .for_each(&mut count);
        for (_, process) in self.processes.iter() {
            let Some(space) = process.address_space.as_ref() else {
                continue;
            };
            space
                .table()
                .structure_pages(memory)
                .into_iter()
                .for_each(&mut count);
            space
                .table()
                .walk(PROC_START_ADDR..MEMSIZE_VIRTUAL)
                .iter(memory)
                .filter(|mapping| mapping.is_user() && is_user_page(mapping.va))
                .for_each(|mapping| count(mapping.pa));
        }

        for (page, frame) in self.pages.frames() {
            if frame.is_reserved() {
                continue;
            }
            let expected = references[page.frame_number().as_usize()];
            if usize::from(frame.refcount()) != expected {
                return Err(RefcountMismatch {
                    page,
                    refcount: frame.refcount(),
                    references: expected,
                });
            }
        }
        Ok(())
    }

    /// Reads a NUL-terminated string of at most `limit` bytes from user memory.
    pub(crate) fn read_user_string(
        &self,
        pid: Pid,
        va: u64,
        limit: usize,
    ) -> Result<String, UserAccess> {
        let mut bytes = Vec::new();
        if let Some(space) = self.address_space(pid) {
            let start = VirtualAddress::try_new(va as usize).ok_or(UserAccess {
                va,
                error: PageFaultError::new().with_user(true),
            })?;
            while bytes.len() < limit {
                let mut byte = [0u8; 1];
                space.read(self.pages.memory(), start + bytes.len(), &mut byte)?;
                if byte[0] == 0 {
                    break;
                }
                bytes.push(byte[0]);
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        layout::{MEMSIZE_PHYSICAL, PAGE_SIZE, STACK_PAGE},
        program::Segment,
    };

    pub(crate) const CODE: VirtualAddress = PROC_START_ADDR;
    pub(crate) const DATA: VirtualAddress = VirtualAddress::new(0x10_1000);

    pub(crate) fn pid(value: usize) -> Pid {
        Pid::new(value).expect("valid pid")
    }

    pub(crate) fn kernel() -> Kernel {
        Kernel::new(PhysicalMemory::emulated(MEMSIZE_PHYSICAL), &[], None).expect("kernel")
    }

    /// One read-only code page and one writable data page.
    pub(crate) fn image() -> ProgramImage<'static> {
        ProgramImage {
            entry: CODE,
            segments: vec![
                Segment {
                    va: CODE,
                    size: 16,
                    data: &[0xcd, 0x30, 0xeb, 0xfc],
                    writable: false,
                },
                Segment {
                    va: DATA,
                    size: PAGE_SIZE,
                    data: b"counter=0",
                    writable: true,
                },
            ],
        }
    }

    pub(crate) fn booted() -> Kernel {
        let mut kernel = kernel();
        kernel.setup(pid(1), &image()).expect("setup");
        kernel
    }

    fn read(kernel: &Kernel, pid: Pid, va: VirtualAddress, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        kernel
            .address_space(pid)
            .expect("space")
            .read(kernel.pages().memory(), va, &mut buf)
            .expect("readable");
        buf
    }

    fn write(kernel: &mut Kernel, pid: Pid, va: VirtualAddress, bytes: &[u8]) {
        let space = kernel.processes.get(pid).address_space.as_ref().expect("space");
        space
            .write(kernel.pages.memory_mut(), va, bytes)
            .expect("writable");
    }

    fn pa(kernel: &Kernel, pid: Pid, va: VirtualAddress) -> PhysicalAddress {
        kernel
            .address_space(pid)
            .and_then(|space| space.lookup(kernel.pages().memory(), va))
            .expect("mapped")
            .pa
    }

    #[test]
    fn kernel_table_identity_maps_physical_memory() {
        let kernel = kernel();
        let memory = kernel.pages().memory();
        let table = kernel.kernel_table();
        assert!(table.lookup(memory, VirtualAddress::new(0)).is_none());

        let console = table.lookup(memory, CONSOLE_ADDR).expect("console");
        assert_eq!(console.pa.as_usize(), CONSOLE_ADDR.as_usize());
        assert!(console.is_user());
        assert!(!table.lookup(memory, VirtualAddress::new(0x4_0000)).expect("kernel").is_user());
        assert!(table.lookup(memory, PROC_START_ADDR).expect("user").is_user());
        kernel.audit().expect("consistent");
    }

    #[test]
    fn setup_builds_a_runnable_process() {
        let kernel = booted();
        let regs = kernel.registers(pid(1));
        assert_eq!(kernel.state(pid(1)), ProcessState::Runnable);
        assert_eq!(regs.rip, CODE.as_usize() as u64);
        assert_eq!(regs.rsp, MEMSIZE_VIRTUAL.as_usize() as u64);
        assert!(regs.from_user_mode());
        assert_eq!(read(&kernel, pid(1), DATA, 10), b"counter=0\0");
        assert!(kernel.address_space(pid(1)).expect("space").lookup(kernel.pages().memory(), STACK_PAGE).is_some());
        kernel.audit().expect("consistent");
    }

    #[test]
    fn setup_requires_a_free_slot() {
        let mut kernel = booted();
        assert!(matches!(
            kernel.setup(pid(1), &image()),
            Err(SetupError::SlotInUse(p)) if p == pid(1)
        ));
    }

    #[test]
    fn setup_program_reports_unknown_names() {
        struct One;
        impl ProgramSource for One {
            fn program(&self, name: &str) -> Option<ProgramImage<'_>> {
                (name == "allocator").then(image)
            }
        }

        let mut kernel = kernel();
        kernel.setup_program(pid(1), &One, "allocator").expect("known program");
        assert!(matches!(
            kernel.setup_program(pid(2), &One, "missing"),
            Err(SetupError::UnknownProgram(name)) if name == "missing"
        ));
        assert_eq!(kernel.state(pid(2)), ProcessState::Free);
    }

    #[test]
    fn fork_copies_writable_and_shares_read_only_pages() {
        let mut kernel = booted();
        let child = kernel.fork(pid(1)).expect("fork");
        assert_eq!(child, pid(2));
        assert_eq!(kernel.registers(child).rax, 0);
        assert_eq!(kernel.state(child), ProcessState::Runnable);

        let code = pa(&kernel, pid(1), CODE);
        assert_eq!(pa(&kernel, child, CODE), code);
        assert_eq!(kernel.pages().refcount(code), 2);
        assert_eq!(read(&kernel, child, CODE, 4), read(&kernel, pid(1), CODE, 4));

        assert_ne!(pa(&kernel, child, DATA), pa(&kernel, pid(1), DATA));
        write(&mut kernel, child, DATA, b"counter=1");
        assert_eq!(read(&kernel, pid(1), DATA, 9), b"counter=0");
        write(&mut kernel, pid(1), DATA, b"counter=2");
        assert_eq!(read(&kernel, child, DATA, 9), b"counter=1");

        let stack = pa(&kernel, pid(1), STACK_PAGE);
        assert_ne!(pa(&kernel, child, STACK_PAGE), stack);
        kernel.audit().expect("consistent");
    }

    #[test]
    fn fork_fails_without_a_free_slot() {
        let mut kernel = booted();
        for _ in 2..crate::layout::NPROC {
            kernel.fork(pid(1)).expect("fork");
        }
        let free = kernel.pages().free_count();
        assert_eq!(kernel.fork(pid(1)), Err(ForkError::NoFreeSlot));
        assert_eq!(kernel.pages().free_count(), free);
        kernel.audit().expect("consistent");
    }

    #[test]
    fn failed_fork_leaves_no_trace() {
        let mut kernel = booted();
        let parent_code = pa(&kernel, pid(1), CODE);
        let snapshot: Vec<_> = kernel.pages().frames().map(|(_, f)| *f).collect();

        // Leave enough pages to start the child but not to finish copying it.
        let free = kernel.pages().free_count();
        let mut hoard = Vec::new();
        for _ in 0..free - 6 {
            hoard.push(kernel.pages.allocate().expect("page"));
        }

        assert_eq!(kernel.fork(pid(1)), Err(ForkError::OutOfMemory(AllocError::OutOfMemory)));
        assert_eq!(kernel.state(pid(2)), ProcessState::Free);
        assert!(kernel.address_space(pid(2)).is_none());

        for page in hoard {
            kernel.pages.release(page);
        }
        let after: Vec<_> = kernel.pages().frames().map(|(_, f)| *f).collect();
        assert_eq!(after, snapshot);
        assert_eq!(pa(&kernel, pid(1), CODE), parent_code);
        assert_eq!(read(&kernel, pid(1), DATA, 9), b"counter=0");
        kernel.audit().expect("consistent");
    }

    #[test]
    fn exit_reclaims_private_pages_and_drops_shared_references() {
        let mut kernel = booted();
        let before_fork = kernel.pages().free_count();
        let child = kernel.fork(pid(1)).expect("fork");
        let code = pa(&kernel, pid(1), CODE);
        let data = pa(&kernel, child, DATA);
        assert_eq!(kernel.pages().refcount(code), 2);

        kernel.exit(child);
        assert_eq!(kernel.state(child), ProcessState::Free);
        assert_eq!(kernel.pages().refcount(code), 1);
        assert_eq!(kernel.pages().refcount(data), 0);
        assert_eq!(kernel.pages().free_count(), before_fork);
        kernel.audit().expect("consistent");

        kernel.exit(pid(1));
        assert_eq!(kernel.pages().refcount(code), 0);
        kernel.audit().expect("consistent");
    }

    #[test]
    fn page_alloc_replaces_previous_page() {
        let mut kernel = booted();
        let va = VirtualAddress::new(0x20_0000);
        kernel.page_alloc(pid(1), va.as_usize() as u64).expect("first");
        let first = pa(&kernel, pid(1), va);
        write(&mut kernel, pid(1), va, b"dirty");

        kernel.page_alloc(pid(1), va.as_usize() as u64).expect("second");
        let second = pa(&kernel, pid(1), va);
        assert_ne!(first, second);
        assert_eq!(kernel.pages().refcount(first), 0);
        assert_eq!(kernel.pages().refcount(second), 1);
        assert_eq!(read(&kernel, pid(1), va, 5), [0; 5]);
        kernel.audit().expect("consistent");
    }

    #[test]
    fn page_alloc_validates_addresses() {
        let mut kernel = booted();
        for bad in [0x10_0001u64, 0xB8000, 0x30_0000, 0x8000_0000_0000] {
            assert_eq!(
                kernel.page_alloc(pid(1), bad),
                Err(PageAllocError::BadAddress(bad))
            );
        }
        kernel.audit().expect("consistent");
    }

    #[test]
    fn page_alloc_out_of_memory_has_no_effect() {
        let mut kernel = booted();
        let va = VirtualAddress::new(0x20_0000);
        kernel.page_alloc(pid(1), va.as_usize() as u64).expect("first");
        let first = pa(&kernel, pid(1), va);

        let mut hoard = Vec::new();
        while let Some(page) = kernel.pages.allocate() {
            hoard.push(page);
        }
        assert_eq!(
            kernel.page_alloc(pid(1), va.as_usize() as u64),
            Err(PageAllocError::OutOfMemory(AllocError::OutOfMemory))
        );
        assert_eq!(pa(&kernel, pid(1), va), first);
        for page in hoard {
            kernel.pages.release(page);
        }
        kernel.audit().expect("consistent");
    }

    #[test]
    fn audit_catches_leaked_references() {
        let mut kernel = booted();
        let code = pa(&kernel, pid(1), CODE);
        let leaked = kernel.pages.retain(code).expect("allocated");
        let mismatch = kernel.audit().expect_err("leak");
        assert_eq!(mismatch.page, code);
        assert_eq!(mismatch.refcount, 2);
        assert_eq!(mismatch.references, 1);
        kernel.pages.release(leaked);
    }
}
