#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Ok(settings) = genesys_config::load_toml(data) {
        let _ = settings.validate();
    }
});
