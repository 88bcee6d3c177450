//! The [`Platform`] the kernel runs on: the PIC, CR2 and the PS/2 keyboard.

use core::sync::atomic::{AtomicBool, Ordering};

use pmm::VirtualAddress;
use x86_64::{instructions::port::Port, registers::control::Cr2};

use super::pic;
use crate::trap::Platform;

const KEYBOARD_STATUS: u16 = 0x64;
const KEYBOARD_DATA: u16 = 0x60;
const OUTPUT_FULL: u8 = 0x01;

const SCANCODE_CTRL: u8 = 0x1D;
const SCANCODE_C: u8 = 0x2E;
const RELEASED: u8 = 0x80;

/// QEMU's isa-debug-exit device.
const DEBUG_EXIT_PORT: u16 = 0xF4;

static CTRL_HELD: AtomicBool = AtomicBool::new(false);

pub struct Hardware;

impl Platform for Hardware {
    fn acknowledge_timer(&mut self) {
        pic::end_of_interrupt();
    }

    fn check_keyboard(&mut self) {
        // SAFETY: the PS/2 controller ports are only read here.
        let scancode = unsafe {
            if Port::<u8>::new(KEYBOARD_STATUS).read() & OUTPUT_FULL == 0 {
                return;
            }
            Port::<u8>::new(KEYBOARD_DATA).read()
        };

        match scancode {
            SCANCODE_CTRL => CTRL_HELD.store(true, Ordering::Relaxed),
            code if code == SCANCODE_CTRL | RELEASED => CTRL_HELD.store(false, Ordering::Relaxed),
            SCANCODE_C if CTRL_HELD.load(Ordering::Relaxed) => power_off(),
            _ => {}
        }
    }

    fn fault_address(&self) -> VirtualAddress {
        VirtualAddress::try_new(Cr2::read_raw() as usize).unwrap_or(VirtualAddress::new(0))
    }
}

fn power_off() -> ! {
    log::info!("Ctrl-C pressed, exiting");
    // SAFETY: writing the debug exit port ends a QEMU run; elsewhere it does nothing.
    unsafe { Port::<u32>::new(DEBUG_EXIT_PORT).write(0) };
    crate::arch::park()
}

/// Stops scheduling for good but keeps answering Ctrl-C.
pub fn halt() -> ! {
    let mut hardware = Hardware;
    loop {
        hardware.check_keyboard();
        core::hint::spin_loop();
    }
}
