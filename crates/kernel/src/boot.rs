//! Boot: limine requests, the kernel context and the first dispatch.

use alloc::vec::Vec;
use core::ops::Range;

use limine::{
    BaseRevision,
    memory_map::EntryType,
    request::{HhdmRequest, MemoryMapRequest, StackSizeRequest},
};
use pmm::{PhysicalAddress, PhysicalMemory};
use spin::{Mutex, Once};
use x86_64::registers::control::Cr3;

use crate::{
    arch,
    console::Console,
    kernel::{Kernel, KernelPanic},
    layout::{MEMSIZE_PHYSICAL, NPROC, unusable_ranges},
    modules::BootModules,
    process::Pid,
    serial,
};

#[used]
#[unsafe(link_section = ".requests")]
static BASE_REVISION: BaseRevision = BaseRevision::with_revision(4);

#[used]
#[unsafe(link_section = ".requests")]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static HIGHER_HALF_DIRECT_MAP: HhdmRequest = HhdmRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static STACK_SIZE: StackSizeRequest = StackSizeRequest::new().with_size(65536); // 64 KiB stack

static KERNEL: Once<Mutex<Kernel>> = Once::new();

/// The kernel context, once boot has finished.
pub fn kernel() -> Option<&'static Mutex<Kernel>> {
    KERNEL.get()
}

pub fn kernel_main() -> ! {
    assert!(BASE_REVISION.is_supported());

    let console = Console::init();
    serial::init(console);
    arch::init();

    let direct_offset = HIGHER_HALF_DIRECT_MAP
        .get_response()
        .expect("Higher-half direct map request should have been answered")
        .offset() as usize;
    let entries = MEMORY_MAP_REQUEST
        .get_response()
        .expect("Memory map request should have been answered")
        .entries();

    let usable: Vec<Range<usize>> = entries
        .iter()
        .filter(|entry| entry.entry_type == EntryType::USABLE)
        .map(|entry| entry.base as usize..(entry.base + entry.length) as usize)
        .collect();
    let top = entries
        .iter()
        .map(|entry| (entry.base + entry.length) as usize)
        .max()
        .unwrap_or(0)
        .max(MEMSIZE_PHYSICAL);
    let reserved = unusable_ranges(&usable, MEMSIZE_PHYSICAL);
    log::info!(
        "{} memory map entries, {} firmware ranges below {:#x}",
        entries.len(),
        reserved.len(),
        MEMSIZE_PHYSICAL
    );

    // SAFETY: limine maps all physical memory at the direct map offset.
    let memory = unsafe { PhysicalMemory::direct(direct_offset, top) };
    let boot_root = PhysicalAddress::new(Cr3::read().0.start_address().as_u64() as usize);
    let mut kernel =
        Kernel::new(memory, &reserved, Some(boot_root)).expect("kernel page table should fit");

    let modules = BootModules::get();
    for (index, module) in modules.iter().enumerate() {
        let Some(pid) = Pid::new(index + 1) else {
            log::warn!("only {} programs fit; ignoring {:?}", NPROC - 1, module.name);
            continue;
        };
        if let Err(source) = kernel.setup_program(pid, &modules, module.name) {
            fatal(kernel, KernelPanic::Setup { pid, source });
        }
    }

    let dispatch = kernel.start();
    let kernel = KERNEL.call_once(|| Mutex::new(kernel));
    arch::run(kernel.lock(), dispatch)
}

fn fatal(mut kernel: Kernel, panic: KernelPanic) -> ! {
    log::error!("{}", panic);
    kernel.show_panic(&panic);
    arch::halt()
}

pub fn handle_panic(info: &core::panic::PanicInfo) -> ! {
    if Console::default().has_output() {
        log::error!("kernel panic: {}", info.message());
        if let Some(location) = info.location() {
            log::error!(" at {}", location)
        }
    }
    arch::halt()
}
