//! Round-robin scheduling over the process table.

use crate::{
    kernel::Kernel,
    process::Pid,
    trap::{Dispatch, Platform},
};

/// Idle polls between memory viewer refreshes.
const IDLE_REFRESH_INTERVAL: u64 = 4096;

impl Kernel {
    /// Chooses the process to run first. Pid 1 goes first if it is runnable.
    pub fn start(&mut self) -> Dispatch {
        self.pick(Pid::FIRST)
    }

    /// Picks the next runnable process after the current one, in cyclic pid order.
    ///
    /// The current process is considered last, so a lone runnable process keeps the CPU.
    pub fn schedule(&mut self) -> Dispatch {
        let start = self.current.map_or(Pid::FIRST, Pid::next);
        self.pick(start)
    }

    fn pick(&mut self, start: Pid) -> Dispatch {
        match self.processes.next_runnable(start) {
            Some(pid) => {
                self.current = Some(pid);
                Dispatch::Run(pid)
            }
            None => Dispatch::Idle,
        }
    }

    /// One poll of the idle loop, entered when nothing was runnable.
    ///
    /// Nothing can become runnable without a trap from a running process, so an idle
    /// system stays idle; the loop only keeps the keyboard and the display alive.
    pub fn idle(&mut self, platform: &mut impl Platform) -> Dispatch {
        if let dispatch @ Dispatch::Run(_) = self.schedule() {
            return dispatch;
        }
        platform.check_keyboard();
        self.spins += 1;
        if self.spins % IDLE_REFRESH_INTERVAL == 0 {
            self.show_memory();
        }
        Dispatch::Idle
    }

    /// Redraws the memory viewer, if it is built in.
    pub(crate) fn show_memory(&mut self) {
        #[cfg(feature = "memviewer")]
        {
            let mut viewer = core::mem::take(&mut self.viewer);
            viewer.refresh(self);
            self.viewer = viewer;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        interrupts::InterruptVector,
        kernel::tests::{booted, pid},
        process::ProcessState,
        trap::tests::{RecordingPlatform, trapped},
    };
    use alloc::vec::Vec;

    #[test]
    fn start_prefers_pid_one() {
        let mut kernel = booted();
        kernel.fork(pid(1)).expect("fork");
        assert_eq!(kernel.start(), Dispatch::Run(pid(1)));
    }

    #[test]
    fn start_with_nothing_runnable_is_idle() {
        let mut kernel = crate::kernel::tests::kernel();
        assert_eq!(kernel.start(), Dispatch::Idle);
        assert_eq!(kernel.current(), None);
    }

    #[test]
    fn every_runnable_process_runs_once_per_round() {
        let mut kernel = booted();
        for _ in 0..4 {
            kernel.fork(pid(1)).expect("fork");
        }
        kernel.start();
        let mut order = Vec::new();
        for _ in 0..10 {
            match kernel.schedule() {
                Dispatch::Run(next) => order.push(next.as_usize()),
                Dispatch::Idle => panic!("processes are runnable"),
            }
        }
        assert_eq!(order, [2, 3, 4, 5, 1, 2, 3, 4, 5, 1]);
    }

    #[test]
    fn schedule_skips_free_and_faulted_slots() {
        let mut kernel = booted();
        for _ in 0..3 {
            kernel.fork(pid(1)).expect("fork");
        }
        kernel.exit(pid(2));
        kernel.processes.get_mut(pid(3)).state = ProcessState::Faulted;
        kernel.start();
        assert_eq!(kernel.schedule(), Dispatch::Run(pid(4)));
        assert_eq!(kernel.schedule(), Dispatch::Run(pid(1)));
        assert_eq!(kernel.schedule(), Dispatch::Run(pid(4)));
    }

    #[test]
    fn lone_process_keeps_running() {
        let mut kernel = booted();
        kernel.start();
        assert_eq!(kernel.schedule(), Dispatch::Run(pid(1)));
        assert_eq!(kernel.schedule(), Dispatch::Run(pid(1)));
    }

    #[test]
    fn idle_polls_the_keyboard_until_something_runs() {
        let mut kernel = booted();
        let mut platform = RecordingPlatform::default();
        kernel.start();
        kernel.exit(pid(1));
        for _ in 0..10 {
            assert_eq!(kernel.idle(&mut platform), Dispatch::Idle);
        }
        assert_eq!(platform.polled, 10);

        kernel.setup(pid(3), &crate::kernel::tests::image()).expect("setup");
        assert_eq!(kernel.idle(&mut platform), Dispatch::Run(pid(3)));
    }

    #[test]
    fn timer_shares_the_cpu_evenly() {
        let mut kernel = booted();
        for _ in 2..crate::layout::NPROC {
            kernel.fork(pid(1)).expect("fork");
        }
        let mut platform = RecordingPlatform::default();
        let mut runs = [0usize; crate::layout::NPROC];
        let mut running = match kernel.start() {
            Dispatch::Run(pid) => pid,
            Dispatch::Idle => panic!("processes are runnable"),
        };
        for _ in 0..(crate::layout::NPROC - 1) * 3 {
            runs[running.as_usize()] += 1;
            let regs = trapped(&kernel, running, InterruptVector::TIMER);
            running = match kernel.trap(&mut platform, &regs).expect("trap") {
                Dispatch::Run(pid) => pid,
                Dispatch::Idle => panic!("processes are runnable"),
            };
        }
        assert!(runs[1..].iter().all(|&count| count == 3), "{runs:?}");
    }
}
