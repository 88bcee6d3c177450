//! Trap entry and exit.
//!
//! Every vector has a 16-byte stub in `vireo_trap_stubs`. A stub pushes a zero error
//! code when the CPU does not push one, then the vector number, and jumps to the common
//! path, which pushes the general-purpose registers so that the stack holds a
//! [`Registers`] frame. The frame is handed to [`Kernel::trap`](crate::Kernel::trap) and
//! the CPU leaves through [`resume`], never by returning.

use core::arch::{asm, global_asm};

use pmm::PhysicalAddress;
use spin::MutexGuard;
use x86_64::{
    PhysAddr, PrivilegeLevel, VirtAddr,
    registers::control::{Cr3, Cr3Flags},
    structures::{idt::InterruptDescriptorTable, paging::PhysFrame},
};

use super::{Hardware, halt};
use crate::{
    kernel::{Kernel, KernelPanic},
    registers::Registers,
    trap::Dispatch,
};

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;
const STUB_SIZE: u64 = 16;

static IDT: spin::Once<InterruptDescriptorTable> = spin::Once::new();

global_asm!(
    r#"
    .section .text.traps, "ax"
    .global vireo_trap_stubs
    .balign 16
vireo_trap_stubs:
    .set vector, 0
    .rept 256
    .balign 16
    .if vector == 8 || (vector >= 10 && vector <= 14) || vector == 17 || vector == 21 || vector == 29 || vector == 30
    .else
    pushq $0
    .endif
    pushq $vector
    jmp vireo_trap_common
    .set vector, vector + 1
    .endr

vireo_trap_common:
    pushq %r15
    pushq %r14
    pushq %r13
    pushq %r12
    pushq %r11
    pushq %r10
    pushq %r9
    pushq %r8
    pushq %rdi
    pushq %rsi
    pushq %rbp
    pushq %rbx
    pushq %rdx
    pushq %rcx
    pushq %rax
    cld
    movq %rsp, %rdi
    call vireo_trap_entry
    ud2
    "#,
    options(att_syntax)
);

unsafe extern "C" {
    static vireo_trap_stubs: u8;
}

fn stub(vector: u8) -> VirtAddr {
    VirtAddr::from_ptr(&raw const vireo_trap_stubs) + STUB_SIZE * u64::from(vector)
}

macro_rules! route {
    ($idt:ident, $($field:ident = $vector:literal),* $(,)?) => {
        $(
            unsafe {
                $idt.$field.set_handler_addr(stub($vector));
            }
        )*
    };
}

pub fn idt() -> &'static InterruptDescriptorTable {
    IDT.call_once(|| {
        let mut idt = InterruptDescriptorTable::new();
        route! {
            idt,
            divide_error = 0,
            debug = 1,
            non_maskable_interrupt = 2,
            breakpoint = 3,
            overflow = 4,
            bound_range_exceeded = 5,
            invalid_opcode = 6,
            device_not_available = 7,
            invalid_tss = 10,
            segment_not_present = 11,
            stack_segment_fault = 12,
            general_protection_fault = 13,
            page_fault = 14,
            x87_floating_point = 16,
            alignment_check = 17,
            machine_check = 18,
            simd_floating_point = 19,
            virtualization = 20,
            cp_protection_exception = 21,
            hv_injection_exception = 28,
            vmm_communication_exception = 29,
            security_exception = 30,
        }
        unsafe {
            idt.double_fault
                .set_handler_addr(stub(8))
                .set_stack_index(DOUBLE_FAULT_IST_INDEX);
        }
        for vector in 32..=u8::MAX {
            let options = unsafe { idt[vector].set_handler_addr(stub(vector)) };
            if vector == crate::interrupts::InterruptVector::SYSCALL.value() {
                options.set_privilege_level(PrivilegeLevel::Ring3);
            }
        }
        idt
    })
}

#[unsafe(no_mangle)]
extern "C" fn vireo_trap_entry(regs: &mut Registers) -> ! {
    let Some(kernel) = crate::boot::kernel() else {
        log::error!("trap {} before the kernel was ready (rip={:#x})", regs.vector, regs.rip);
        halt();
    };
    let mut kernel = kernel.lock();
    match kernel.trap(&mut Hardware, regs) {
        Ok(dispatch) => run(kernel, dispatch),
        Err(panic) => fatal(kernel, panic),
    }
}

/// Acts on a dispatch decision: resumes a process, or idles until one is runnable.
pub fn run(mut kernel: MutexGuard<'_, Kernel>, mut dispatch: Dispatch) -> ! {
    loop {
        match dispatch {
            Dispatch::Run(pid) => {
                let Some(space) = kernel.address_space(pid) else {
                    log::error!("process {} is runnable without an address space", pid);
                    halt();
                };
                let root = space.table().root();
                let regs = kernel.registers(pid).clone();
                drop(kernel);
                // SAFETY: the registers were saved from, or built for, this address space.
                unsafe { resume(root, &regs) }
            }
            Dispatch::Idle => {
                core::hint::spin_loop();
                dispatch = kernel.idle(&mut Hardware);
            }
        }
    }
}

/// Reports a fatal error and stops scheduling.
pub fn fatal(mut kernel: MutexGuard<'_, Kernel>, panic: KernelPanic) -> ! {
    log::error!("{}", panic);
    kernel.show_panic(&panic);
    drop(kernel);
    halt()
}

/// Switches to `root` and returns to the process described by `regs`.
///
/// # Safety
///
/// `regs` must describe a valid user context for the address space at `root`.
unsafe fn resume(root: PhysicalAddress, regs: &Registers) -> ! {
    let frame = PhysFrame::containing_address(PhysAddr::new(root.as_usize() as u64));
    unsafe {
        Cr3::write(frame, Cr3Flags::empty());
        asm!(
            "mov rsp, {regs}",
            "pop rax",
            "pop rcx",
            "pop rdx",
            "pop rbx",
            "pop rbp",
            "pop rsi",
            "pop rdi",
            "pop r8",
            "pop r9",
            "pop r10",
            "pop r11",
            "pop r12",
            "pop r13",
            "pop r14",
            "pop r15",
            // Skip the vector and error code.
            "add rsp, 16",
            "iretq",
            regs = in(reg) regs as *const Registers,
            options(noreturn),
        )
    }
}
