//! Gzip-compressed tar archives of exported trees.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use ghost_core::{GhostError, Result};
use std::path::Path;
use tar::Archive;
use tracing::debug;

/// Pack `files` (relative to `dir`) into a `.tgz` buffer.
///
/// Entries keep their relative paths; files that vanished since listing are
/// reported as errors rather than skipped.
pub async fn create_archive(dir: &Path, files: &[String]) -> Result<Vec<u8>> {
    let dir = dir.to_path_buf();
    let files = files.to_vec();

    tokio::task::spawn_blocking(move || build_archive(&dir, &files))
        .await
        .map_err(|e| GhostError::archive(format!("Archive task panicked: {}", e)))?
}

fn build_archive(dir: &Path, files: &[String]) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut tar = tar::Builder::new(encoder);

    for file in files {
        let physical = dir.join(file);
        let content = std::fs::read(&physical).map_err(|e| {
            GhostError::archive(format!("Could not read {}: {}", physical.display(), e))
        })?;

        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
        header.set_cksum();

        tar.append_data(&mut header, file, content.as_slice())
            .map_err(|e| GhostError::archive(format!("Could not add {}: {}", file, e)))?;
    }

    let encoder = tar
        .into_inner()
        .map_err(|e| GhostError::archive(format!("Could not finish archive: {}", e)))?;
    let bytes = encoder
        .finish()
        .map_err(|e| GhostError::archive(format!("Could not compress archive: {}", e)))?;

    debug!("Packed {} files into {} bytes", files.len(), bytes.len());
    Ok(bytes)
}

/// Unpack a `.tgz` buffer into `dest`, returning the extracted file paths
/// relative to it.
pub async fn extract_archive(bytes: Vec<u8>, dest: &Path) -> Result<Vec<String>> {
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || unpack_archive(&bytes, &dest))
        .await
        .map_err(|e| GhostError::archive(format!("Extract task panicked: {}", e)))?
}

fn unpack_archive(bytes: &[u8], dest: &Path) -> Result<Vec<String>> {
    std::fs::create_dir_all(dest)?;

    let mut archive = Archive::new(GzDecoder::new(bytes));
    let entries = archive
        .entries()
        .map_err(|e| GhostError::archive(format!("Invalid archive: {}", e)))?;

    let mut extracted = Vec::new();
    for entry in entries {
        let mut entry = entry.map_err(|e| GhostError::archive(format!("Invalid entry: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| GhostError::archive(format!("Invalid entry path: {}", e)))?
            .to_string_lossy()
            .replace('\\', "/");
        let is_file = entry.header().entry_type().is_file();

        // `unpack_in` refuses entries that would escape `dest`.
        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| GhostError::archive(format!("Could not extract {}: {}", path, e)))?;
        if unpacked && is_file {
            extracted.push(path);
        }
    }

    extracted.sort();
    debug!("Extracted {} files into {}", extracted.len(), dest.display());
    Ok(extracted)
}
