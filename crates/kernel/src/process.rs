//! Process descriptors and the fixed-size process table.

use core::fmt;

use crate::{address_space::AddressSpace, layout::NPROC, registers::Registers};

/// A process id, equal to the index of the process's slot in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(usize);

impl Pid {
    /// The first process started at boot.
    pub const FIRST: Self = Self(1);

    /// Creates a pid for a usable slot (1..NPROC).
    pub const fn new(value: usize) -> Option<Self> {
        if value >= 1 && value < NPROC {
            Some(Self(value))
        } else {
            None
        }
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// The next slot in round-robin order, wrapping past the end and skipping slot 0.
    pub const fn next(self) -> Self {
        if self.0 + 1 >= NPROC {
            Self(1)
        } else {
            Self(self.0 + 1)
        }
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling state of a slot. A running process is simply the current RUNNABLE one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessState {
    #[default]
    Free,
    Runnable,
    /// Stopped by an unrecoverable user fault and never scheduled again.
    Faulted,
}

/// One process table slot.
#[derive(Default)]
pub struct Process {
    pub state: ProcessState,
    pub registers: Registers,
    /// Present exactly when the slot is not free.
    pub address_space: Option<AddressSpace>,
}

impl Process {
    pub fn is_free(&self) -> bool {
        self.state == ProcessState::Free
    }

    pub fn is_runnable(&self) -> bool {
        self.state == ProcessState::Runnable
    }
}

/// All process slots. Slot 0 exists but is never used.
pub struct ProcessTable {
    slots: [Process; NPROC],
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Process::default()),
        }
    }

    pub fn get(&self, pid: Pid) -> &Process {
        &self.slots[pid.as_usize()]
    }

    pub fn get_mut(&mut self, pid: Pid) -> &mut Process {
        &mut self.slots[pid.as_usize()]
    }

    /// Returns the lowest free pid.
    pub fn find_free(&self) -> Option<Pid> {
        self.iter()
            .find(|(_, process)| process.is_free())
            .map(|(pid, _)| pid)
    }

    /// Iterates over the usable slots in pid order.
    pub fn iter(&self) -> impl Iterator<Item = (Pid, &Process)> {
        self.slots
            .iter()
            .enumerate()
            .skip(1)
            .map(|(index, process)| (Pid(index), process))
    }

    /// Finds the first runnable process at or after `start` in cyclic pid order.
    pub fn next_runnable(&self, start: Pid) -> Option<Pid> {
        let mut pid = start;
        for _ in 1..NPROC {
            if self.get(pid).is_runnable() {
                return Some(pid);
            }
            pid = pid.next();
        }
        None
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
