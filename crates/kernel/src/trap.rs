//! Trap dispatch: exceptions, the timer interrupt and system calls.
//!
//! The architecture layer saves the trapped registers, calls [`Kernel::trap`] with them,
//! and then acts on the returned [`Dispatch`]. Nothing in here touches hardware directly;
//! the few device interactions go through [`Platform`].

use alloc::format;
use pmm::VirtualAddress;

use crate::{
    address_space::UserAccess,
    interrupts::{InterruptVector, PageFaultError},
    kernel::{Kernel, KernelPanic},
    process::{Pid, ProcessState},
    registers::Registers,
    screen::{ALERT, Screen},
    syscall::{Syscall, UnknownSyscall},
};

/// Longest panic message read from a process, terminator excluded.
pub const PANIC_MESSAGE_LIMIT: usize = 240;

/// Device operations the trap handler needs.
pub trait Platform {
    /// Signals end of interrupt for the timer.
    fn acknowledge_timer(&mut self);

    /// Polls the keyboard for input the kernel acts on.
    fn check_keyboard(&mut self);

    /// The faulting address of the page fault being handled.
    fn fault_address(&self) -> VirtualAddress;
}

/// What the CPU should do once a trap has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Resume this process with its saved registers.
    Run(Pid),
    /// No process is runnable.
    Idle,
}

impl Kernel {
    /// Handles one trap.
    ///
    /// Traps from user mode first save `regs` into the current process. Errors are
    /// fatal: the caller reports them and stops.
    pub fn trap(
        &mut self,
        platform: &mut impl Platform,
        regs: &Registers,
    ) -> Result<Dispatch, KernelPanic> {
        let vector = InterruptVector::from(regs.vector);
        let fault = PageFaultError::from_bits(regs.error_code);
        let kernel_fault = vector == InterruptVector::PAGE_FAULT && !fault.user();

        if regs.from_user_mode() {
            if let Some(pid) = self.current {
                self.processes.get_mut(pid).registers = regs.clone();
            }
        }
        if !kernel_fault {
            self.show_memory();
        }
        platform.check_keyboard();

        match vector {
            InterruptVector::TIMER => {
                platform.acknowledge_timer();
                self.ticks += 1;
                Ok(self.schedule())
            }
            InterruptVector::PAGE_FAULT => {
                let va = platform.fault_address();
                if kernel_fault {
                    return Err(KernelPanic::KernelPageFault {
                        address: va,
                        error: fault,
                        rip: regs.rip,
                    });
                }
                let pid = self.running(regs)?;
                let access = UserAccess {
                    va: va.as_usize() as u64,
                    error: fault,
                };
                self.user_fault(pid, access, regs.rip);
                Ok(self.resume_or_schedule(pid))
            }
            InterruptVector::SYSCALL => {
                let pid = self.running(regs)?;
                self.syscall(pid, regs)
            }
            _ => Err(KernelPanic::UnhandledException {
                vector,
                rip: regs.rip,
            }),
        }
    }

    fn running(&self, regs: &Registers) -> Result<Pid, KernelPanic> {
        self.current
            .filter(|_| regs.from_user_mode())
            .ok_or(KernelPanic::UnhandledException {
                vector: InterruptVector::from(regs.vector),
                rip: regs.rip,
            })
    }

    fn syscall(&mut self, pid: Pid, regs: &Registers) -> Result<Dispatch, KernelPanic> {
        let call = match Syscall::try_from(regs.rax) {
            Ok(call) => call,
            Err(UnknownSyscall(code)) => {
                return Err(KernelPanic::UnhandledSyscall {
                    code,
                    pid,
                    rip: regs.rip,
                });
            }
        };
        log::trace!("pid {}: {}({:#x})", pid, call, regs.rdi);

        let result = match call {
            Syscall::Panic => {
                return match self.read_user_string(pid, regs.rdi, PANIC_MESSAGE_LIMIT) {
                    Ok(message) => Err(KernelPanic::UserPanic { pid, message }),
                    Err(access) => {
                        self.user_fault(pid, access, regs.rip);
                        Ok(self.schedule())
                    }
                };
            }
            Syscall::GetPid => pid.as_usize() as i64,
            Syscall::Yield => {
                self.set_return(pid, 0);
                return Ok(self.schedule());
            }
            Syscall::PageAlloc => match self.page_alloc(pid, regs.rdi) {
                Ok(()) => 0,
                Err(err) => {
                    log::debug!("pid {}: page_alloc({:#x}) failed: {}", pid, regs.rdi, err);
                    -1
                }
            },
            Syscall::Fork => match self.fork(pid) {
                Ok(child) => child.as_usize() as i64,
                Err(err) => {
                    log::debug!("pid {}: fork failed: {}", pid, err);
                    -1
                }
            },
            Syscall::Exit => {
                self.exit(pid);
                return Ok(self.schedule());
            }
        };

        self.set_return(pid, result);
        Ok(self.resume_or_schedule(pid))
    }

    fn set_return(&mut self, pid: Pid, value: i64) {
        self.processes.get_mut(pid).registers.set_return(value);
    }

    /// Stops `pid` after an access its page table does not allow.
    ///
    /// The process is never scheduled again; the rest of the system keeps running.
    pub fn user_fault(&mut self, pid: Pid, access: UserAccess, rip: u64) {
        let notice = format!(
            "PAGE FAULT on {:#x} (pid {}, {} {}, rip={:#x})!",
            access.va,
            pid,
            access.error.operation(),
            access.error.problem(),
            rip
        );
        log::warn!("{}", notice);
        Screen::new(self.pages.memory_mut()).notice(&notice, ALERT);
        self.processes.get_mut(pid).state = ProcessState::Faulted;
    }

    /// Draws a fatal error on the console's notice row.
    pub fn show_panic(&mut self, panic: &KernelPanic) {
        let text = match panic {
            KernelPanic::UserPanic { message, .. } => format!("PANIC: {}", message),
            other => format!("PANIC: {}", other),
        };
        Screen::new(self.pages.memory_mut()).notice(&text, ALERT);
    }

    fn resume_or_schedule(&mut self, pid: Pid) -> Dispatch {
        if self.processes.get(pid).is_runnable() {
            Dispatch::Run(pid)
        } else {
            self.schedule()
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        kernel::tests::{CODE, DATA, booted, pid},
        layout::{NPROC, STACK_PAGE},
        registers::KERNEL_CODE_SELECTOR,
        screen::NOTICE_ROW,
    };
    use alloc::vec::Vec;

    /// Records device calls instead of touching hardware.
    #[derive(Default)]
    pub(crate) struct RecordingPlatform {
        pub acknowledged: usize,
        pub polled: usize,
        pub fault: Option<VirtualAddress>,
    }

    impl Platform for RecordingPlatform {
        fn acknowledge_timer(&mut self) {
            self.acknowledged += 1;
        }

        fn check_keyboard(&mut self) {
            self.polled += 1;
        }

        fn fault_address(&self) -> VirtualAddress {
            self.fault.unwrap_or(VirtualAddress::new(0))
        }
    }

    /// The registers of `pid` as they would be pushed when it traps with `vector`.
    pub(crate) fn trapped(kernel: &Kernel, pid: Pid, vector: InterruptVector) -> Registers {
        let mut regs = kernel.registers(pid).clone();
        regs.vector = u64::from(vector.value());
        regs
    }

    pub(crate) fn syscall(kernel: &Kernel, pid: Pid, call: u64, arg: u64) -> Registers {
        let mut regs = trapped(kernel, pid, InterruptVector::SYSCALL);
        regs.rax = call;
        regs.rdi = arg;
        regs
    }

    fn started() -> (Kernel, RecordingPlatform) {
        let mut kernel = booted();
        assert_eq!(kernel.start(), Dispatch::Run(pid(1)));
        (kernel, RecordingPlatform::default())
    }

    fn notice(kernel: &mut Kernel) -> alloc::string::String {
        Screen::new(kernel.memory_mut()).row_text(NOTICE_ROW)
    }

    #[test]
    fn getpid_returns_the_callers_pid() {
        let (mut kernel, mut platform) = started();
        let regs = syscall(&kernel, pid(1), Syscall::GetPid as u64, 0);
        assert_eq!(kernel.trap(&mut platform, &regs).expect("trap"), Dispatch::Run(pid(1)));
        assert_eq!(kernel.registers(pid(1)).rax, 1);
        assert_eq!(platform.polled, 1);
    }

    #[test]
    fn fork_returns_child_pid_and_zero_in_child() {
        let (mut kernel, mut platform) = started();
        let regs = syscall(&kernel, pid(1), Syscall::Fork as u64, 0);
        assert_eq!(kernel.trap(&mut platform, &regs).expect("trap"), Dispatch::Run(pid(1)));
        assert_eq!(kernel.registers(pid(1)).rax, 2);
        assert_eq!(kernel.registers(pid(2)).rax, 0);
        assert_eq!(kernel.registers(pid(2)).rip, kernel.registers(pid(1)).rip);
        kernel.audit().expect("consistent");
    }

    #[test]
    fn forked_child_sees_its_own_pid() {
        let (mut kernel, mut platform) = started();
        let regs = syscall(&kernel, pid(1), Syscall::Fork as u64, 0);
        kernel.trap(&mut platform, &regs).expect("trap");
        let child = kernel.registers(pid(1)).rax;

        let regs = syscall(&kernel, pid(1), Syscall::Yield as u64, 0);
        assert_eq!(kernel.trap(&mut platform, &regs).expect("trap"), Dispatch::Run(pid(2)));
        assert_eq!(kernel.registers(pid(2)).rax, 0);

        let regs = syscall(&kernel, pid(2), Syscall::GetPid as u64, 0);
        assert_eq!(kernel.trap(&mut platform, &regs).expect("trap"), Dispatch::Run(pid(2)));
        assert_eq!(kernel.registers(pid(2)).rax, child);
        assert_eq!(child, 2);
    }

    #[test]
    fn fork_without_a_free_slot_returns_minus_one() {
        let (mut kernel, mut platform) = started();
        for _ in 2..NPROC {
            kernel.fork(pid(1)).expect("fork");
        }
        let regs = syscall(&kernel, pid(1), Syscall::Fork as u64, 0);
        kernel.trap(&mut platform, &regs).expect("trap");
        assert_eq!(kernel.registers(pid(1)).rax as i64, -1);
        kernel.audit().expect("consistent");
    }

    #[test]
    fn page_alloc_reports_success_and_failure() {
        let (mut kernel, mut platform) = started();
        for (addr, expected) in [(0x20_0000u64, 0i64), (0x20_0000, 0), (0x20_0010, -1), (0x40_0000, -1)] {
            let regs = syscall(&kernel, pid(1), Syscall::PageAlloc as u64, addr);
            assert_eq!(kernel.trap(&mut platform, &regs).expect("trap"), Dispatch::Run(pid(1)));
            assert_eq!(kernel.registers(pid(1)).rax as i64, expected, "page_alloc({addr:#x})");
        }
        kernel.audit().expect("consistent");
    }

    #[test]
    fn yield_returns_zero_and_switches() {
        let (mut kernel, mut platform) = started();
        kernel.fork(pid(1)).expect("fork");
        let regs = syscall(&kernel, pid(1), Syscall::Yield as u64, 0);
        assert_eq!(kernel.trap(&mut platform, &regs).expect("trap"), Dispatch::Run(pid(2)));
        assert_eq!(kernel.registers(pid(1)).rax, 0);
        assert_eq!(kernel.current(), Some(pid(2)));
    }

    #[test]
    fn exit_frees_the_slot_and_schedules_another() {
        let (mut kernel, mut platform) = started();
        let free = kernel.pages().free_count();
        kernel.fork(pid(1)).expect("fork");
        let regs = syscall(&kernel, pid(1), Syscall::Exit as u64, 0);
        assert_eq!(kernel.trap(&mut platform, &regs).expect("trap"), Dispatch::Run(pid(2)));
        assert_eq!(kernel.state(pid(1)), ProcessState::Free);

        let regs = syscall(&kernel, pid(2), Syscall::Exit as u64, 0);
        assert_eq!(kernel.trap(&mut platform, &regs).expect("trap"), Dispatch::Idle);
        assert!(kernel.pages().free_count() > free);
        kernel.audit().expect("consistent");
    }

    #[test]
    fn timer_counts_ticks_and_rotates() {
        let (mut kernel, mut platform) = started();
        kernel.fork(pid(1)).expect("fork");
        let mut order = Vec::new();
        for _ in 0..4 {
            let running = kernel.current().expect("running");
            let regs = trapped(&kernel, running, InterruptVector::TIMER);
            match kernel.trap(&mut platform, &regs).expect("trap") {
                Dispatch::Run(next) => order.push(next.as_usize()),
                Dispatch::Idle => panic!("processes are runnable"),
            }
        }
        assert_eq!(order, [2, 1, 2, 1]);
        assert_eq!(kernel.ticks(), 4);
        assert_eq!(platform.acknowledged, 4);
    }

    #[test]
    fn trap_saves_user_registers() {
        let (mut kernel, mut platform) = started();
        let mut regs = trapped(&kernel, pid(1), InterruptVector::TIMER);
        regs.rbx = 0xfeed;
        regs.rip += 2;
        kernel.trap(&mut platform, &regs).expect("trap");
        assert_eq!(kernel.registers(pid(1)).rbx, 0xfeed);
        assert_eq!(kernel.registers(pid(1)).rip, regs.rip);
    }

    #[test]
    fn user_page_fault_stops_only_that_process() {
        let (mut kernel, mut platform) = started();
        kernel.fork(pid(1)).expect("fork");
        platform.fault = Some(CODE);
        let mut regs = trapped(&kernel, pid(1), InterruptVector::PAGE_FAULT);
        regs.error_code = PageFaultError::new()
            .with_present(true)
            .with_write(true)
            .with_user(true)
            .into_bits();

        assert_eq!(kernel.trap(&mut platform, &regs).expect("trap"), Dispatch::Run(pid(2)));
        assert_eq!(kernel.state(pid(1)), ProcessState::Faulted);
        assert!(notice(&mut kernel).starts_with("PAGE FAULT on 0x100000 (pid 1, write protection problem"));

        // A faulted process keeps its memory but is never scheduled again.
        assert!(kernel.address_space(pid(1)).is_some());
        kernel.audit().expect("consistent");
        for _ in 0..3 {
            let regs = trapped(&kernel, pid(2), InterruptVector::TIMER);
            assert_eq!(kernel.trap(&mut platform, &regs).expect("trap"), Dispatch::Run(pid(2)));
        }
    }

    #[test]
    fn kernel_page_fault_is_fatal() {
        let (mut kernel, mut platform) = started();
        platform.fault = Some(DATA);
        let mut regs = trapped(&kernel, pid(1), InterruptVector::PAGE_FAULT);
        regs.cs = KERNEL_CODE_SELECTOR;
        regs.rip = 0xffff_ffff_8000_1234;
        regs.error_code = PageFaultError::new().with_write(false).into_bits();

        let saved = kernel.registers(pid(1)).clone();
        let err = kernel.trap(&mut platform, &regs).expect_err("fatal");
        assert!(matches!(err, KernelPanic::KernelPageFault { address, .. } if address == DATA));
        assert_eq!(
            alloc::string::ToString::to_string(&err),
            "Kernel page fault on 0x101000 (read missing page, rip=0xffffffff80001234)!"
        );
        assert_eq!(kernel.registers(pid(1)), &saved);
    }

    #[test]
    fn unknown_syscall_is_fatal() {
        let (mut kernel, mut platform) = started();
        let regs = syscall(&kernel, pid(1), 99, 0);
        assert!(matches!(
            kernel.trap(&mut platform, &regs),
            Err(KernelPanic::UnhandledSyscall { code: 99, pid: p, .. }) if p == pid(1)
        ));
    }

    #[test]
    fn unexpected_exception_is_fatal() {
        let (mut kernel, mut platform) = started();
        let regs = trapped(&kernel, pid(1), InterruptVector::GENERAL_PROTECTION_FAULT);
        assert!(matches!(
            kernel.trap(&mut platform, &regs),
            Err(KernelPanic::UnhandledException { vector, .. })
                if vector == InterruptVector::GENERAL_PROTECTION_FAULT
        ));
    }

    #[test]
    fn panic_syscall_reads_the_message() {
        let (mut kernel, mut platform) = started();
        let space = kernel.processes.get(pid(1)).address_space.as_ref().expect("space");
        space
            .write(kernel.pages.memory_mut(), STACK_PAGE, b"out of cheese\0garbage")
            .expect("writable");

        let regs = syscall(&kernel, pid(1), Syscall::Panic as u64, STACK_PAGE.as_usize() as u64);
        let err = kernel.trap(&mut platform, &regs).expect_err("panic");
        assert!(matches!(&err, KernelPanic::UserPanic { message, .. } if message == "out of cheese"));
        kernel.show_panic(&err);
        assert_eq!(notice(&mut kernel).trim_end(), "PANIC: out of cheese");
    }

    #[test]
    fn panic_message_is_truncated() {
        let (mut kernel, mut platform) = started();
        let space = kernel.processes.get(pid(1)).address_space.as_ref().expect("space");
        space
            .write(kernel.pages.memory_mut(), STACK_PAGE, &[b'x'; 300])
            .expect("writable");

        let regs = syscall(&kernel, pid(1), Syscall::Panic as u64, STACK_PAGE.as_usize() as u64);
        match kernel.trap(&mut platform, &regs) {
            Err(KernelPanic::UserPanic { message, .. }) => {
                assert_eq!(message.len(), PANIC_MESSAGE_LIMIT)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn panic_with_a_bad_pointer_faults_the_caller() {
        let (mut kernel, mut platform) = started();
        let regs = syscall(&kernel, pid(1), Syscall::Panic as u64, 0x4_0000);
        assert_eq!(kernel.trap(&mut platform, &regs).expect("trap"), Dispatch::Idle);
        assert_eq!(kernel.state(pid(1)), ProcessState::Faulted);
    }

    #[test]
    fn panic_with_a_non_canonical_pointer_reports_it() {
        let (mut kernel, mut platform) = started();
        let regs = syscall(&kernel, pid(1), Syscall::Panic as u64, 0x8000_0000_0000);
        assert_eq!(kernel.trap(&mut platform, &regs).expect("trap"), Dispatch::Idle);
        assert_eq!(kernel.state(pid(1)), ProcessState::Faulted);
        assert!(notice(&mut kernel).starts_with("PAGE FAULT on 0x800000000000 (pid 1, read"));
    }
}
