#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    vireo_kernel::handle_panic(info)
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("vireo boots through limine on bare-metal x86_64 (target_os = \"none\")");
    std::process::exit(1);
}
