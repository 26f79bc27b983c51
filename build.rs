fn main() {
    let crate_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
    let config = cbindgen::Config::from_file("cbindgen.toml").unwrap_or_else(|_| {
        let mut config = cbindgen::Config::default();
        config.language = cbindgen::Language::C;
        config.include_guard = Some("DEPTHCAM_H".into());
        config
    });

    println!("cargo:rerun-if-changed=src/ffi.rs");

    if let Ok(bindings) = cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .generate()
    {
        let _ = std::fs::create_dir_all(format!("{}/include", crate_dir));
        bindings.write_to_file(format!("{}/include/depthcam.h", crate_dir));
    }
}
