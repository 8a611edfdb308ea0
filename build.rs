fn main() {
    // Device builds need the ESP-IDF sysenv (linker args, cfgs).
    // Host builds of the library and tests have nothing to generate.
    #[cfg(feature = "espidf")]
    embuild::espidf::sysenv::output();
}
