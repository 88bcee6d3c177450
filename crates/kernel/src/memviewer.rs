//! A live picture of physical memory and of one process's address space, drawn on the
//! console above the notice rows.
//!
//! Each page is one cell. Rows 1 to 8 show all managed physical pages, 64 to a row,
//! marked by owner. Rows 11 to 22 show the virtual pages of one process, marked by the
//! owner of the physical page behind them. The process shown rotates every half second.

use alloc::{format, vec, vec::Vec};

use pmm::{PAGE_SIZE, PhysicalAddress, VirtualAddress};

use crate::{
    kernel::Kernel,
    layout::{HZ, KERNEL_STACK_TOP, KERNEL_START_ADDR, MEMSIZE_VIRTUAL, NPAGES, NPROC},
    process::{Pid, ProcessTable},
    screen::{NORMAL, Screen, cell},
};

const PAGES_PER_ROW: usize = 64;
const MAP_COLUMN: usize = 12;
const PHYSICAL_ROW: usize = 0;
const VIRTUAL_ROW: usize = 10;
/// First row the viewer leaves to processes.
const LAST_ROW: usize = 23;

const HEADING: u8 = 0x0F;
const KERNEL: u8 = 0x0D;
const UNREFERENCED: u8 = 0x4F;
const KERNEL_ONLY: u8 = 0x08;
/// Background added to pages referenced more than once.
const SHARED: u8 = 0x30;

const PROCESS_COLORS: [u8; 8] = [0x0C, 0x0A, 0x09, 0x0E, 0x0B, 0x0D, 0x06, 0x02];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Free,
    Reserved,
    Kernel,
    Process(Pid),
    /// Allocated, but no page table refers to it.
    Unreferenced,
}

#[derive(Debug, Default)]
pub struct MemoryViewer {
    last_ticks: Option<u64>,
    showing: usize,
}

impl MemoryViewer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Redraws the picture.
    pub fn refresh(&mut self, kernel: &mut Kernel) {
        if self
            .last_ticks
            .is_none_or(|last| kernel.ticks.saturating_sub(last) >= HZ / 2)
        {
            self.last_ticks = Some(kernel.ticks);
            self.showing = (self.showing + 1) % NPROC;
        }
        let shown = self.choose(&kernel.processes);

        let (physical, virtual_map) = {
            let kernel: &Kernel = kernel;
            let owners = owners(kernel);
            let physical: Vec<u16> = (0..NPAGES)
                .map(|page| {
                    let pa = PhysicalAddress::new(page * PAGE_SIZE);
                    physical_cell(owners[page], kernel.pages.refcount(pa))
                })
                .collect();
            (physical, shown.map(|pid| virtual_cells(kernel, &owners, pid)))
        };

        let mut screen = Screen::new(kernel.pages.memory_mut());
        for row in PHYSICAL_ROW..LAST_ROW {
            screen.clear_row(row);
        }
        screen.print(PHYSICAL_ROW, 32, "PHYSICAL MEMORY", HEADING);
        draw_map(&mut screen, PHYSICAL_ROW + 1, &physical);

        match (shown, virtual_map) {
            (Some(pid), Some(cells)) => {
                let heading = format!("VIRTUAL ADDRESS SPACE FOR {}", pid);
                screen.print(VIRTUAL_ROW, 26, &heading, HEADING);
                draw_map(&mut screen, VIRTUAL_ROW + 1, &cells);
            }
            _ => {
                screen.print(VIRTUAL_ROW, 29, "VIRTUAL ADDRESS SPACE", HEADING);
                screen.print(VIRTUAL_ROW + 1, 26, "[All processes have exited]", HEADING);
            }
        }
    }

    /// Settles on the first non-free process at or after the one due to be shown.
    fn choose(&mut self, processes: &ProcessTable) -> Option<Pid> {
        for _ in 0..NPROC {
            if let Some(pid) = Pid::new(self.showing) {
                if !processes.get(pid).is_free() {
                    return Some(pid);
                }
            }
            self.showing = (self.showing + 1) % NPROC;
        }
        None
    }
}

fn owners(kernel: &Kernel) -> Vec<Owner> {
    let memory = kernel.pages.memory();
    let mut owners: Vec<Owner> = kernel
        .pages
        .frames()
        .map(|(pa, frame)| {
            let kernel_image = (KERNEL_START_ADDR..KERNEL_STACK_TOP).contains(&pa.as_usize());
            match (frame.is_reserved(), frame.is_free()) {
                (true, _) if kernel_image => Owner::Kernel,
                (true, _) => Owner::Reserved,
                (false, true) => Owner::Free,
                (false, false) => Owner::Unreferenced,
            }
        })
        .collect();

    let mut claim = |pa: PhysicalAddress, owner: Owner| {
        if let Some(slot) = owners.get_mut(pa.frame_number().as_usize()) {
            if *slot == Owner::Unreferenced {
                *slot = owner;
            }
        }
    };
    for pa in kernel.kernel_table.structure_pages(memory) {
        claim(pa, Owner::Kernel);
    }
    for (pid, process) in kernel.processes.iter() {
        let Some(space) = process.address_space.as_ref() else {
            continue;
        };
        for pa in space.table().structure_pages(memory) {
            claim(pa, Owner::Process(pid));
        }
        let user = space.table().walk(crate::layout::PROC_START_ADDR..MEMSIZE_VIRTUAL);
        for mapping in user.iter(memory).filter(|mapping| mapping.is_user()) {
            claim(mapping.pa, Owner::Process(pid));
        }
    }
    owners
}

fn glyph(owner: Owner) -> (u8, u8) {
    match owner {
        Owner::Free => (b'.', NORMAL),
        Owner::Reserved => (b'R', NORMAL),
        Owner::Kernel => (b'K', KERNEL),
        Owner::Process(pid) => {
            let digit = b"0123456789ABCDEF"[pid.as_usize() % 16];
            (digit, PROCESS_COLORS[pid.as_usize() % PROCESS_COLORS.len()])
        }
        Owner::Unreferenced => (b'?', UNREFERENCED),
    }
}

fn physical_cell(owner: Owner, refcount: u16) -> u16 {
    let (ch, attr) = glyph(owner);
    if refcount > 1 {
        cell(ch, attr | SHARED)
    } else {
        cell(ch, attr)
    }
}

fn virtual_cells(kernel: &Kernel, owners: &[Owner], pid: Pid) -> Vec<u16> {
    let pages = MEMSIZE_VIRTUAL.as_usize() / PAGE_SIZE;
    let mut cells = vec![cell(b' ', NORMAL); pages];
    let Some(space) = kernel.processes.get(pid).address_space.as_ref() else {
        return cells;
    };

    let memory = kernel.pages.memory();
    let walk = space.table().walk(VirtualAddress::new(0)..MEMSIZE_VIRTUAL);
    for mapping in walk.iter(memory) {
        let owner = owners
            .get(mapping.pa.frame_number().as_usize())
            .copied()
            .unwrap_or(Owner::Reserved);
        let value = if mapping.is_user() {
            physical_cell(owner, kernel.pages.refcount(mapping.pa))
        } else {
            cell(glyph(owner).0, KERNEL_ONLY)
        };
        cells[mapping.va.page_number().as_usize()] = value;
    }
    cells
}

fn draw_map(screen: &mut Screen<'_>, first_row: usize, cells: &[u16]) {
    for (index, chunk) in cells.chunks(PAGES_PER_ROW).enumerate() {
        let row = first_row + index;
        let label = format!("0x{:06X}", index * PAGES_PER_ROW * PAGE_SIZE);
        screen.print(row, 3, &label, NORMAL);
        for (column, value) in chunk.iter().enumerate() {
            screen.put(row, MAP_COLUMN + column, *value);
        }
    }
}
