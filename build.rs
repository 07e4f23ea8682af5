//! Build script for gds-io.
//!
//! Bakes the default backend policy into the binary. The policy applied at
//! run time comes from `GDS_IO_POLICY`; when that variable is unset or holds
//! an unknown value, the value captured here is used instead.
//!
//! ```text
//! GDS_IO_DEFAULT_POLICY=OFF cargo build --release
//! ```

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=GDS_IO_DEFAULT_POLICY");

    let policy = std::env::var("GDS_IO_DEFAULT_POLICY").unwrap_or_else(|_| "GDS".to_string());
    println!("cargo:rustc-env=GDS_IO_DEFAULT_POLICY={policy}");
}
