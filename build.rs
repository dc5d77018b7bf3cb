fn main() {
    // ── macOS: embed Info.plist so CoreBluetooth lets the CLI use the radio ──
    //
    // A bare command-line binary has no app bundle, and CBCentralManager stays
    // "unauthorized" unless the executable carries an Info.plist with
    // NSBluetoothAlwaysUsageDescription.  The linker's `-sectcreate` flag
    // places the plist in the `__TEXT,__info_plist` section, which macOS reads
    // the same way it reads a bundle's Info.plist.
    //
    // `CARGO_CFG_TARGET_OS` is the target, not the host, so cross builds from
    // Linux pick this up as well.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("macos") {
        let dir = std::env::var("CARGO_MANIFEST_DIR")
            .expect("CARGO_MANIFEST_DIR must be set by Cargo");
        let plist = format!("{dir}/Info.plist");

        // One linker argument per line:
        //   ld … -sectcreate __TEXT __info_plist <dir>/Info.plist …
        for arg in ["-sectcreate", "__TEXT", "__info_plist", plist.as_str()] {
            println!("cargo:rustc-link-arg-bins={arg}");
        }
        println!("cargo:rerun-if-changed=Info.plist");
    }
}
