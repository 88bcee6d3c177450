//! Program images: the segments and entry point a process starts from.

use alloc::vec::Vec;

use elf::{
    ElfBytes,
    abi::{PF_W, PT_LOAD},
    endian::LittleEndian,
    parse::ParseError,
};
use pmm::VirtualAddress;
use thiserror::Error;

/// One loadable piece of a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment<'a> {
    /// First virtual address covered.
    pub va: VirtualAddress,
    /// Bytes of address space covered. Bytes past `data` are zero.
    pub size: usize,
    /// Initialized bytes, copied to `va`.
    pub data: &'a [u8],
    pub writable: bool,
}

impl Segment<'_> {
    /// Returns the first address past the segment, or `None` if it wraps.
    pub fn end(&self) -> Option<usize> {
        self.va.as_usize().checked_add(self.size)
    }
}

/// A program ready to be loaded into an address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramImage<'a> {
    pub entry: VirtualAddress,
    pub segments: Vec<Segment<'a>>,
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("malformed ELF image: {0:?}")]
    Malformed(ParseError),
    #[error("ELF image has no program headers")]
    NoProgramHeaders,
    #[error("address {0:#x} is not canonical")]
    BadAddress(u64),
}

impl From<ParseError> for ImageError {
    fn from(err: ParseError) -> Self {
        ImageError::Malformed(err)
    }
}

impl<'a> ProgramImage<'a> {
    /// Reads the loadable segments of a little-endian ELF64 executable.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ImageError> {
        let file = ElfBytes::<LittleEndian>::minimal_parse(bytes)?;
        let entry = address(file.ehdr.e_entry)?;
        let headers = file.segments().ok_or(ImageError::NoProgramHeaders)?;

        let mut segments = Vec::new();
        for header in headers.iter().filter(|header| header.p_type == PT_LOAD) {
            let data = file.segment_data(&header)?;
            segments.push(Segment {
                va: address(header.p_vaddr)?,
                size: header.p_memsz as usize,
                data,
                writable: header.p_flags & PF_W != 0,
            });
        }

        Ok(Self { entry, segments })
    }
}

fn address(value: u64) -> Result<VirtualAddress, ImageError> {
    VirtualAddress::try_new(value as usize).ok_or(ImageError::BadAddress(value))
}

/// Somewhere programs can be looked up by name.
pub trait ProgramSource {
    fn program(&self, name: &str) -> Option<ProgramImage<'_>>;
}
