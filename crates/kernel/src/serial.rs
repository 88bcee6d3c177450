//! COM1 as a log sink.

use core::fmt::Write;

use crate::console::Console;

pub struct SerialWriter {
    port: uart_16550::SerialPort,
}

impl Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.port.write_str(s)
    }
}

// cSpell:ignore uart
pub fn init(console: &Console) {
    // SAFETY: 0x3F8 is the standard COM1 base and nothing else drives it.
    let mut port = unsafe { uart_16550::SerialPort::new(0x3F8) };
    port.init();
    console.attach(SerialWriter { port });
}
