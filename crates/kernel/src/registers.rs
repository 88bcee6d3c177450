//! The saved register file of a process.

use pmm::VirtualAddress;

/// Kernel code segment selector (GDT slot 1).
pub const KERNEL_CODE_SELECTOR: u64 = 0x08;
/// User data segment selector (GDT slot 3, RPL 3).
pub const USER_DATA_SELECTOR: u64 = 0x18 | 3;
/// User code segment selector (GDT slot 4, RPL 3).
pub const USER_CODE_SELECTOR: u64 = 0x20 | 3;

/// Interrupt enable flag in RFLAGS.
pub const RFLAGS_IF: u64 = 1 << 9;

/// CPU state captured at a trap and restored when the process resumes.
///
/// The layout matches what the trap entry stubs push, lowest address first, so the
/// structure can be read straight off the trap stack.
#[repr(C)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registers {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    /// Interrupt vector, pushed by the entry stub.
    pub vector: u64,
    /// Error code, pushed by the CPU or zero.
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl Registers {
    /// Initial registers of a user process.
    pub fn user(entry: VirtualAddress, stack_top: VirtualAddress) -> Self {
        Self {
            rip: entry.as_usize() as u64,
            rsp: stack_top.as_usize() as u64,
            cs: USER_CODE_SELECTOR,
            ss: USER_DATA_SELECTOR,
            rflags: RFLAGS_IF,
            ..Self::default()
        }
    }

    /// Returns true if the trap was taken while running user code.
    pub fn from_user_mode(&self) -> bool {
        self.cs & 3 == 3
    }

    /// Stores a syscall result. Negative results are stored two's complement.
    pub fn set_return(&mut self, value: i64) {
        self.rax = value as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_matches_trap_stack_layout() {
        assert_eq!(core::mem::size_of::<Registers>(), 22 * 8);
        assert_eq!(core::mem::offset_of!(Registers, vector), 15 * 8);
        assert_eq!(core::mem::offset_of!(Registers, rip), 17 * 8);
    }

    #[test]
    fn user_registers_run_in_ring_3_with_interrupts() {
        let regs = Registers::user(VirtualAddress::new(0x10_0000), VirtualAddress::new(0x30_0000));
        assert!(regs.from_user_mode());
        assert_eq!(regs.rflags & RFLAGS_IF, RFLAGS_IF);
        assert_eq!(regs.rsp, 0x30_0000);
    }

    #[test]
    fn negative_return_is_twos_complement() {
        let mut regs = Registers::default();
        regs.set_return(-1);
        assert_eq!(regs.rax, u64::MAX);
    }
}
