//! Shared fixtures for integration tests — writes a fake provider CLI
//! script to a temp dir and marks it executable, following the dummy-codex
//! pattern of reading one request line per step and echoing a canned
//! response (order-driven, not content-matched).

use std::path::PathBuf;

#[cfg(unix)]
pub fn write_fake_binary(dir: &std::path::Path, name: &str, script: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, script).expect("write fake provider binary");
    let mut perms = std::fs::metadata(&path).expect("stat fake provider binary").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod fake provider binary");
    path
}
