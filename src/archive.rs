//! Zip extraction of function code archives.

use std::{fs::File, path::Path};

use anyhow::{Context, Result};
use tracing::debug;

/// Extract the zip archive at `archive` into `target`.
///
/// Blocking; call from `spawn_blocking` in async code. Entries whose path
/// would escape `target` are rejected by the zip reader.
pub fn unzip(archive: &Path, target: &Path) -> Result<()> {
    let file = File::open(archive)
        .with_context(|| format!("Failed to open archive: {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file)
        .with_context(|| format!("Not a zip archive: {}", archive.display()))?;
    let entries = zip.len();
    zip.extract(target)
        .with_context(|| format!("Failed to extract archive into {}", target.display()))?;
    debug!(entries, target = %target.display(), "Extracted code archive");
    Ok(())
}

#[cfg(test)]
pub(crate) fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    use std::io::Write;

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, contents) in files {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(contents).unwrap();
    }
    writer.finish().unwrap().into_inner()
}
