use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub fn root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
        .join("tests")
        .join("fixtures")
}

pub fn path(relative: impl AsRef<Path>) -> PathBuf {
    root().join(relative.as_ref())
}

pub fn read(relative: impl AsRef<Path>) -> io::Result<String> {
    fs::read_to_string(path(relative))
}

/// Raw bytes of a contact payload, as it would arrive from the broker.
pub fn contact(name: &str) -> Vec<u8> {
    read_or_panic(Path::new("contacts").join(name)).into_bytes()
}

pub fn config(name: &str) -> String {
    read_or_panic(Path::new("config").join(name))
}

fn read_or_panic(relative: impl AsRef<Path>) -> String {
    let relative = relative.as_ref();
    read(relative).unwrap_or_else(|error| {
        panic!(
            "failed to read fixture {}: {error}",
            relative.to_string_lossy()
        )
    })
}
