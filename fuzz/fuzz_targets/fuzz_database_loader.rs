#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Device tables come from user-supplied files; parsing and validation
    // must reject bad input with an error, never a panic.
    if let Ok(db) = genesys_config::load_database(data) {
        let _ = db.validate();
        for model in &db.models {
            let _ = model.lowest_dpi();
        }
    }
});
