#![no_main]
use libfuzzer_sys::fuzz_target;
use pump_dl::http::{parse_url, resolve_output_path};
use std::path::Path;

fuzz_target!(|data: &str| {
    // parse_url() should never panic on arbitrary UTF-8 strings
    let Ok(url) = parse_url(data) else {
        return;
    };

    // A derived output path must stay inside the download directory
    let dir = Path::new("/downloads");
    if let Ok(path) = resolve_output_path(&url, None, dir) {
        assert!(path.starts_with(dir));
        assert!(path.components().all(|c| c != std::path::Component::ParentDir));
    }
});
