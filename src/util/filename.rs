//! Engine directory file naming conventions.

use std::path::{Path, PathBuf};

/// File types in the engine directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Lock file to prevent concurrent access.
    Lock,
    /// A single sorted run (one part).
    Segment,
    /// Descriptor listing the parts of a multi-part segment.
    MultiPart,
    /// Layout log.
    Manifest,
    /// Temporary file.
    Temp,
}

/// Generate the lock file path.
pub fn lock_file_path(dir: &Path) -> PathBuf {
    dir.join("LOCK")
}

/// Generate the manifest file path.
pub fn manifest_file_path(dir: &Path) -> PathBuf {
    dir.join("MANIFEST")
}

/// Generate the path the manifest is rewritten to before being renamed.
pub fn manifest_temp_path(dir: &Path) -> PathBuf {
    dir.join("MANIFEST.tmp")
}

/// Generate a segment (part) file path.
pub fn segment_file_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:06}.seg", id))
}

/// Generate a multi-part descriptor file path.
pub fn multi_part_file_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:06}.mps", id))
}

/// Generate a temporary file path.
pub fn temp_file_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:06}.tmp", id))
}

/// Parse a file name and return its type and number.
///
/// Returns `None` if the file name doesn't match any known pattern.
pub fn parse_file_name(name: &str) -> Option<(FileType, u64)> {
    if name == "LOCK" {
        return Some((FileType::Lock, 0));
    }
    if name == "MANIFEST" {
        return Some((FileType::Manifest, 0));
    }
    if name == "MANIFEST.tmp" {
        return Some((FileType::Temp, 0));
    }

    // Numbered files: NNNNNN.ext
    if let Some(dot_pos) = name.rfind('.') {
        let (num_str, ext) = name.split_at(dot_pos);
        let ext = &ext[1..];

        if let Ok(number) = num_str.parse::<u64>() {
            let file_type = match ext {
                "seg" => FileType::Segment,
                "mps" => FileType::MultiPart,
                "tmp" => FileType::Temp,
                _ => return None,
            };
            return Some((file_type, number));
        }
    }

    None
}

/// List all engine files in the directory with their type and number.
pub fn list_files(dir: &Path) -> std::io::Result<Vec<(FileType, u64, PathBuf)>> {
    let mut files = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if let Some((ft, number)) = parse_file_name(&name) {
            files.push((ft, number, entry.path()));
        }
    }

    files.sort_by_key(|(_, number, _)| *number);
    Ok(files)
}

/// Find the maximum file number in the directory.
pub fn find_max_file_number(dir: &Path) -> std::io::Result<u64> {
    Ok(list_files(dir)?
        .into_iter()
        .map(|(_, number, _)| number)
        .max()
        .unwrap_or(0))
}

/// Delete a file, ignoring "not found" errors.
pub fn delete_file(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Create directory if it doesn't exist.
pub fn create_dir_if_missing(path: &Path) -> std::io::Result<()> {
    match std::fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// Sync a directory to ensure renames and deletes are durable.
pub fn sync_dir(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

/// Write `data` to `temp`, sync it and rename it over `target`.
pub fn write_file_atomic(temp: &Path, target: &Path, data: &[u8]) -> std::io::Result<()> {
    std::fs::write(temp, data)?;

    let file = std::fs::File::open(temp)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(temp, target)?;
    if let Some(parent) = target.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}
