use rand::Rng;
use std::io::Write;
use std::path::Path;

/// Write `contents` to `path` atomically.
///
/// The bytes go to a randomly named sibling file which is synced and then
/// renamed over `path`, so readers never observe a partial file. The
/// temporary file is removed if any step fails.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let suffix: u64 = rand::rng().random();
    let temp_path = path.with_extension(format!("tmp.{:016x}", suffix));

    let result = (|| {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&temp_path, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    result
}
