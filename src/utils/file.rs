use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use glob::Pattern;


/// True when `dir` exists and holds at least one entry.
pub fn dir_is_non_empty(dir: &Path) -> bool {
    match fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_some(),
        Err(_) => false,
    }
}


/// Entries directly inside `dir` whose file name matches a glob `pattern`, sorted by name.
///
/// # Arguments
///
/// * `dir` - Directory to list; a missing directory yields nothing.
/// * `pattern` - Shell-style pattern applied to the file name only.
///
/// # Returns
/// Sorted paths of matching entries.
pub fn matching_entries(dir: &Path, pattern: &str) -> io::Result<Vec<PathBuf>> {
    let pattern = Pattern::new(pattern)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut matches = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if pattern.matches(&name.to_string_lossy()) {
            matches.push(entry.path());
        }
    }
    matches.sort();
    Ok(matches)
}


/// Subdirectories of `dir`, sorted by name. A missing directory yields nothing.
pub fn subdirectories(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}


pub fn ensure_parent(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}


/// Copies `src` to `dest` through a temporary sibling so `dest` only appears when complete.
pub fn copy_atomically(src: &Path, dest: &Path) -> io::Result<()> {
    ensure_parent(dest)?;
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::Builder::new()
        .prefix(".copy")
        .suffix(".partial")
        .tempfile_in(parent)?;
    fs::copy(src, tmp.path())?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}
