use x86_64::{
    VirtAddr,
    instructions::tables::load_tss,
    registers::segmentation::{CS, DS, ES, SS, Segment},
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
};

mod interrupts;
mod pic;
mod platform;

pub use interrupts::run;
pub use platform::{Hardware, halt};

const TRAP_STACK_SIZE: usize = 4096 * 16;
const DOUBLE_FAULT_STACK_SIZE: usize = 4096 * 5;

#[repr(align(16))]
struct Stack<const N: usize>([u8; N]);

static mut TRAP_STACK: Stack<TRAP_STACK_SIZE> = Stack([0; TRAP_STACK_SIZE]);
static mut DOUBLE_FAULT_STACK: Stack<DOUBLE_FAULT_STACK_SIZE> = Stack([0; DOUBLE_FAULT_STACK_SIZE]);

static TSS: spin::Once<TaskStateSegment> = spin::Once::new();
static GDT: spin::Once<(GlobalDescriptorTable, Selectors)> = spin::Once::new();

/// The architecture-specific entry point.
#[unsafe(no_mangle)]
pub extern "C" fn kenter() -> ! {
    crate::boot::kernel_main()
}

fn tss() -> &'static TaskStateSegment {
    TSS.call_once(|| {
        let mut tss = TaskStateSegment::new();
        // Traps from user mode switch to this stack.
        tss.privilege_stack_table[0] =
            VirtAddr::from_ptr(&raw const TRAP_STACK) + TRAP_STACK_SIZE as u64;
        tss.interrupt_stack_table[interrupts::DOUBLE_FAULT_IST_INDEX as usize] =
            VirtAddr::from_ptr(&raw const DOUBLE_FAULT_STACK) + DOUBLE_FAULT_STACK_SIZE as u64;
        tss
    })
}

/// Builds the GDT. The selector values must match the ones in [`crate::registers`].
fn gdt() -> (&'static GlobalDescriptorTable, &'static Selectors) {
    let (gdt, selectors) = GDT.call_once(|| {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.append(Descriptor::kernel_code_segment());
        let data_selector = gdt.append(Descriptor::kernel_data_segment());
        gdt.append(Descriptor::user_data_segment());
        gdt.append(Descriptor::user_code_segment());
        let tss_selector = gdt.append(Descriptor::tss_segment(tss()));
        let selectors = Selectors {
            code_selector,
            data_selector,
            tss_selector,
        };
        (gdt, selectors)
    });
    (gdt, selectors)
}

struct Selectors {
    code_selector: SegmentSelector,
    data_selector: SegmentSelector,
    tss_selector: SegmentSelector,
}

/// Loads the GDT, TSS and IDT, and starts the timer. Interrupts stay disabled in the
/// kernel; they are enabled only through the flags of a resumed process.
pub fn init() {
    x86_64::instructions::interrupts::disable();

    let (gdt, selectors) = gdt();
    gdt.load();
    unsafe {
        CS::set_reg(selectors.code_selector);
        SS::set_reg(selectors.data_selector);
        DS::set_reg(selectors.data_selector);
        ES::set_reg(selectors.data_selector);
        load_tss(selectors.tss_selector);
    }
    interrupts::idt().load();

    pic::remap();
    pic::start_timer(crate::layout::HZ);
    log::debug!("traps routed, timer at {} Hz", crate::layout::HZ);
}
