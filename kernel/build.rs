fn main() {
    // The linker script only applies to the freestanding kernel image; host
    // builds (unit tests) link normally.
    let target = std::env::var("TARGET").unwrap_or_default();
    if target.ends_with("-none") {
        println!(
            "cargo:rustc-link-search=native={}",
            concat!(env!("CARGO_MANIFEST_DIR"), "/../build")
        );
        println!("cargo:rustc-link-arg=-Tlinker.ld");
    }
    println!("cargo:rerun-if-changed=../build/linker.ld");
}
