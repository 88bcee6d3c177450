#[cfg(target_arch = "x86_64")]
pub(crate) mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use x86_64::*;

/// Stops the CPU for good.
pub fn park() -> ! {
    use core::arch::asm;

    loop {
        unsafe {
            #[cfg(target_arch = "x86_64")]
            asm!("cli; hlt");
        }
    }
}
