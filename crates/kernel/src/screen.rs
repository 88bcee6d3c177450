//! The CGA text console: 80x25 cells of one character byte and one attribute byte.
//!
//! The console lives in an ordinary physical page at [`CONSOLE_PHYS`], so the kernel
//! draws on it through [`PhysicalMemory`] like any other page.

use pmm::PhysicalMemory;

use crate::layout::CONSOLE_PHYS;

pub const COLUMNS: usize = 80;
pub const ROWS: usize = 25;

/// The row used for fault notices and panic messages.
pub const NOTICE_ROW: usize = ROWS - 1;

/// Light grey on black.
pub const NORMAL: u8 = 0x07;
/// Bright red on black.
pub const ALERT: u8 = 0x0C;

/// Packs a character and its attribute into one console cell.
pub const fn cell(ch: u8, attr: u8) -> u16 {
    ch as u16 | (attr as u16) << 8
}

pub struct Screen<'a> {
    page: &'a mut [u8],
}

impl<'a> Screen<'a> {
    pub fn new(memory: &'a mut PhysicalMemory) -> Self {
        Self {
            page: memory.page_mut(CONSOLE_PHYS),
        }
    }

    /// Writes one cell. Positions off the screen are ignored.
    pub fn put(&mut self, row: usize, column: usize, value: u16) {
        if row < ROWS && column < COLUMNS {
            let offset = (row * COLUMNS + column) * 2;
            self.page[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        }
    }

    pub fn get(&self, row: usize, column: usize) -> u16 {
        let offset = (row * COLUMNS + column) * 2;
        u16::from_le_bytes([self.page[offset], self.page[offset + 1]])
    }

    /// Prints `text` starting at `column`, clipped at the end of the row. Characters the
    /// console cannot show become `?`. Returns the column after the last cell written.
    pub fn print(&mut self, row: usize, column: usize, text: &str, attr: u8) -> usize {
        let mut at = column;
        for ch in text.chars().take(COLUMNS.saturating_sub(column)) {
            let byte = if ch.is_ascii() && !ch.is_ascii_control() {
                ch as u8
            } else {
                b'?'
            };
            self.put(row, at, cell(byte, attr));
            at += 1;
        }
        at
    }

    /// Fills a row with blanks.
    pub fn clear_row(&mut self, row: usize) {
        for column in 0..COLUMNS {
            self.put(row, column, cell(b' ', NORMAL));
        }
    }

    /// Replaces the notice row with `text`.
    pub fn notice(&mut self, text: &str, attr: u8) {
        self.clear_row(NOTICE_ROW);
        self.print(NOTICE_ROW, 0, text, attr);
    }

    /// Reads a row back as text, without attributes.
    pub fn row_text(&self, row: usize) -> alloc::string::String {
        (0..COLUMNS)
            .map(|column| (self.get(row, column) & 0xFF) as u8 as char)
            .collect()
    }
}
