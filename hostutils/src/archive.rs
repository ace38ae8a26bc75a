use std::fs::File;
use std::path::Path;

use anyhow::{Context, Error};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};

use crate::files::create_dirs;

/// Extract a `.tar.gz` archive into `dest`, which is created if missing.
/// Entries escaping the destination are rejected by the unpacker.
pub fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<(), Error> {
    create_dirs(dest)?;
    let file = File::open(archive).context(format!("Failed to open {}", archive.display()))?;
    tar::Archive::new(GzDecoder::new(file))
        .unpack(dest)
        .context(format!(
            "Failed to extract {} into {}",
            archive.display(),
            dest.display()
        ))
}

/// Pack the contents of `dir` (not the directory itself) into a `.tar.gz`
/// archive at `archive`.
pub fn create_tar_gz(dir: &Path, archive: &Path) -> Result<(), Error> {
    if let Some(parent) = archive.parent() {
        create_dirs(parent)?;
    }
    let file = File::create(archive).context(format!("Failed to create {}", archive.display()))?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder
        .append_dir_all(".", dir)
        .context(format!("Failed to archive {}", dir.display()))?;
    builder
        .into_inner()
        .context("Failed to finish archive")?
        .finish()
        .context("Failed to flush archive")?;
    Ok(())
}
