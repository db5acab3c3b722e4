fn main() {
    println!("cargo:rerun-if-changed=partitions.csv");

    // Host builds (tests, fuzzing) run without the ESP-IDF toolchain.
    #[cfg(feature = "espidf")]
    embuild::espidf::sysenv::output();
}
