use std::env;

fn main() {
    println!("cargo:rerun-if-changed=src/ffi.rs");
    println!("cargo:rerun-if-changed=src/promise.rs");
    println!("cargo:rerun-if-changed=cbindgen.toml");

    let crate_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    match cbindgen::generate(crate_dir) {
        Ok(bindings) => {
            bindings.write_to_file("include/async_bridge.h");
        }
        Err(e) => println!("cargo:warning=failed to generate async_bridge.h: {e}"),
    }
}
