//! Interrupt vectors and the page-fault error code.

use bitfield_struct::bitfield;

#[macro_export]
macro_rules! interrupt_vectors {
    (
        $storage: ty,
        $(
            $name:ident = $value:expr,
        )*
    ) => {
        /// Represents an interrupt vector.
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct InterruptVector($storage);

        impl InterruptVector {
            $(
                pub const $name: Self = Self($value);
            )*

            /// Creates a new interrupt vector from a raw value.
            pub const fn new(value: $storage) -> Self {
                Self(value)
            }

            /// Returns the raw value of the interrupt vector.
            pub const fn value(&self) -> $storage {
                self.0
            }

            /// Returns the name of the interrupt vector, if known.
            pub fn name(&self) -> Option<&'static str> {
                match self.0 {
                    $(
                        $value => Some(stringify!($name)),
                    )*
                    _ => None,
                }
            }
        }

        impl core::fmt::Debug for InterruptVector {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                if let Some(name) = self.name() {
                    write!(f, "InterruptVector::{}({})", name, self.0)
                } else {
                    write!(f, "InterruptVector({})", self.0)
                }
            }
        }

        impl core::fmt::Display for InterruptVector {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                if let Some(name) = self.name() {
                    write!(f, "{}", name)
                } else {
                    write!(f, "{}", self.0)
                }
            }
        }
    }
}

crate::interrupt_vectors! {
    u8,
    DIVIDE_ERROR = 0,
    DEBUG = 1,
    NON_MASKABLE_INTERRUPT = 2,
    BREAKPOINT = 3,
    OVERFLOW = 4,
    BOUND_RANGE_EXCEEDED = 5,
    INVALID_OPCODE = 6,
    DEVICE_NOT_AVAILABLE = 7,
    DOUBLE_FAULT = 8,
    INVALID_TSS = 10,
    SEGMENT_NOT_PRESENT = 11,
    STACK_SEGMENT_FAULT = 12,
    GENERAL_PROTECTION_FAULT = 13,
    PAGE_FAULT = 14,
    X87_FLOATING_POINT_EXCEPTION = 16,
    ALIGNMENT_CHECK = 17,
    MACHINE_CHECK = 18,
    SIMD_FLOATING_POINT_EXCEPTION = 19,
    TIMER = 32,
    SYSCALL = 48,
}

impl From<u64> for InterruptVector {
    fn from(value: u64) -> Self {
        Self::new(value as u8)
    }
}

/// Page-fault error code pushed by the CPU (Intel SDM Vol. 3A, 6.15).
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool,
    /// 0 = read, 1 = write.
    pub write: bool,
    /// 0 = supervisor, 1 = user mode.
    pub user: bool,
    /// A reserved bit was set in a paging structure.
    pub reserved_bit: bool,
    /// The access was an instruction fetch.
    pub instruction_fetch: bool,
    #[bits(59)]
    __: u64,
}

impl PageFaultError {
    /// Describes the faulting access the way the console notice prints it.
    pub fn operation(&self) -> &'static str {
        if self.write() { "write" } else { "read" }
    }

    /// Describes why the access faulted.
    pub fn problem(&self) -> &'static str {
        if self.present() {
            "protection problem"
        } else {
            "missing page"
        }
    }
}
