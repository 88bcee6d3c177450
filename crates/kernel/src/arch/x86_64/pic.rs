//! The legacy 8259 interrupt controllers and the 8253 interval timer.

use x86_64::instructions::port::Port;

use crate::interrupts::InterruptVector;

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

/// Initialization, cascade mode, ICW4 follows.
const ICW1_INIT: u8 = 0x11;
const ICW4_8086: u8 = 0x01;
const END_OF_INTERRUPT: u8 = 0x20;

const PIT_FREQUENCY: u32 = 1_193_182;
const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
/// Channel 0, lobyte/hibyte, rate generator.
const PIT_RATE_GENERATOR: u8 = 0x34;

fn outb(port: u16, value: u8) {
    // SAFETY: only called with the PIC and PIT ports, which the kernel owns.
    unsafe { Port::new(port).write(value) }
}

/// Moves IRQs 0-15 to vectors 32-47 and masks everything except the timer.
pub fn remap() {
    let offset = InterruptVector::TIMER.value();
    outb(PIC1_CMD, ICW1_INIT);
    outb(PIC2_CMD, ICW1_INIT);
    outb(PIC1_DATA, offset);
    outb(PIC2_DATA, offset + 8);
    // The slave hangs off IRQ2.
    outb(PIC1_DATA, 1 << 2);
    outb(PIC2_DATA, 2);
    outb(PIC1_DATA, ICW4_8086);
    outb(PIC2_DATA, ICW4_8086);

    outb(PIC1_DATA, 0xFE);
    outb(PIC2_DATA, 0xFF);
}

/// Programs the timer to interrupt `hz` times per second.
pub fn start_timer(hz: u64) {
    let divisor = (PIT_FREQUENCY / hz as u32).clamp(1, u32::from(u16::MAX)) as u16;
    let [low, high] = divisor.to_le_bytes();
    outb(PIT_COMMAND, PIT_RATE_GENERATOR);
    outb(PIT_CHANNEL0, low);
    outb(PIT_CHANNEL0, high);
}

pub fn end_of_interrupt() {
    outb(PIC1_CMD, END_OF_INTERRUPT);
}
