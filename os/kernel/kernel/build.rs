use kernel_info::memory;
use std::error::Error;
use std::{env, path::PathBuf};

fn main() -> Result<(), Box<dyn Error>> {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR")?);
    let ld = manifest_dir.join("kernel.ld");
    println!("cargo:rerun-if-changed={}", ld.display());
    println!("cargo:rerun-if-changed=build.rs");

    // Hosted builds (unit tests) link normally.
    if env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("none") {
        return Ok(());
    }

    let kernel_base = memory::KERNEL_BASE;
    let phys_load = memory::PHYS_LOAD;
    if kernel_base & ((1u64 << 21) - 1) != 0 {
        return Err(format!("KERNEL_BASE must be 2 MiB aligned (got {kernel_base:#x})").into());
    }
    if phys_load & 0xfff != 0 {
        return Err(format!("PHYS_LOAD must be 4 KiB aligned (got {phys_load:#x})").into());
    }

    println!("cargo:rustc-link-arg-bins=-T{}", ld.display());
    println!("cargo:rustc-link-arg-bins=--defsym=KERNEL_BASE={kernel_base:#x}");
    println!("cargo:rustc-link-arg-bins=--defsym=PHYS_LOAD={phys_load:#x}");
    Ok(())
}
