fn main() {
    // ── macOS: Bluetooth usage description ───────────────────────────────────
    //
    // CoreBluetooth keeps the central manager in the "unauthorized" state for
    // any process without NSBluetoothAlwaysUsageDescription in its Info.plist,
    // so scans find nothing.  A plain binary has no bundle, so the plist is
    // linked into the `__TEXT,__info_plist` section instead, which the OS
    // reads the same way.
    //
    // `CARGO_CFG_TARGET_OS` is the target OS, so cross builds work as well.
    println!("cargo:rerun-if-changed=build.rs");

    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos") {
        return;
    }

    let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        println!("cargo:warning=CARGO_MANIFEST_DIR unset; Info.plist not embedded");
        return;
    };
    let plist = format!("{dir}/Info.plist");

    for arg in ["-sectcreate", "__TEXT", "__info_plist", plist.as_str()] {
        println!("cargo:rustc-link-arg={arg}");
    }
    println!("cargo:rerun-if-changed=Info.plist");
}
