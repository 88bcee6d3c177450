//! Programs delivered as limine boot modules.

use core::ffi::CStr;

use limine::{file::File, request::ModuleRequest};

use crate::program::{ProgramImage, ProgramSource};

#[used]
#[unsafe(link_section = ".requests")]
static MODULE: ModuleRequest = ModuleRequest::new();

/// A boot module, named by its limine module string.
pub struct Module {
    pub name: &'static str,
    pub bytes: &'static [u8],
}

impl Module {
    fn from_file(file: &'static File) -> Self {
        // SAFETY: limine maps every module in the higher-half direct map for the whole
        // lifetime of the kernel.
        let bytes = unsafe { core::slice::from_raw_parts(file.addr(), file.size() as usize) };
        Self {
            name: name_of(file.string()),
            bytes,
        }
    }
}

fn name_of(string: &'static CStr) -> &'static str {
    string.to_str().unwrap_or("")
}

/// Every module limine loaded, in configuration order.
pub struct BootModules {
    files: &'static [&'static File],
}

impl BootModules {
    pub fn get() -> Self {
        let files = MODULE
            .get_response()
            .map_or(&[][..], |response| response.modules());
        Self { files }
    }

    pub fn iter(&self) -> impl Iterator<Item = Module> + '_ {
        self.files.iter().map(|file| Module::from_file(file))
    }
}

impl ProgramSource for BootModules {
    fn program(&self, name: &str) -> Option<ProgramImage<'_>> {
        let module = self.iter().find(|module| module.name == name)?;
        match ProgramImage::parse(module.bytes) {
            Ok(image) => Some(image),
            Err(err) => {
                log::warn!("module {:?} is not a usable program: {}", name, err);
                None
            }
        }
    }
}
