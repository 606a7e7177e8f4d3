// src/utils/discovery.rs: work item discovery from the input directory

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::Serialize;

use crate::config::defs::{PipelineError, CONVERTED_READ_EXTS, RECOGNIZED_EXTS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    RawReads,
    Converted,
}

/// One read file carried through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub id: String,
    pub path: PathBuf,
    pub kind: InputKind,
}


/// Strips every recognized extension from a file name, longest match first.
///
/// # Arguments
///
/// * `file_name` - Bare file name, e.g. `sample1.fastq.gz`.
///
/// # Returns
/// Option of (identifier, kind). The kind comes from the outermost extension.
/// None when no recognized extension is present or nothing is left after stripping.
pub fn strip_recognized_extensions(file_name: &str) -> Option<(String, InputKind)> {
    let mut stem = file_name;
    let mut kind = None;

    loop {
        let lower = stem.to_ascii_lowercase();
        let hit = RECOGNIZED_EXTS
            .iter()
            .find(|ext| lower.len() > ext.len() + 1 && lower.ends_with(&format!(".{}", ext)));
        match hit {
            Some(ext) => {
                if kind.is_none() {
                    kind = Some(if CONVERTED_READ_EXTS.contains(ext) {
                        InputKind::Converted
                    } else {
                        InputKind::RawReads
                    });
                }
                stem = &stem[..stem.len() - ext.len() - 1];
            }
            None => break,
        }
    }

    match kind {
        Some(kind) if !stem.is_empty() => Some((stem.to_string(), kind)),
        _ => None,
    }
}


/// Scans `in_dir` (not recursively) for read files.
///
/// # Arguments
///
/// * `in_dir` - Input directory.
///
/// # Returns
/// Work items sorted by identifier, or `NoInputFound` when nothing matches.
pub fn discover_work_items(in_dir: &Path) -> Result<Vec<WorkItem>, PipelineError> {
    if !in_dir.is_dir() {
        return Err(PipelineError::InputDirMissing(in_dir.to_path_buf()));
    }

    let mut candidates = Vec::new();
    for entry in fs::read_dir(in_dir)? {
        let entry = entry?;
        if !entry.path().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        match strip_recognized_extensions(&name) {
            Some((id, kind)) => candidates.push(WorkItem {
                id,
                path: entry.path(),
                kind,
            }),
            None => debug!("Ignoring {}: no recognized read extension", name),
        }
    }
    candidates.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.path.cmp(&b.path)));

    let mut seen = HashSet::new();
    let mut items = Vec::with_capacity(candidates.len());
    for item in candidates {
        if seen.insert(item.id.clone()) {
            items.push(item);
        } else {
            warn!(
                "Skipping {}: identifier '{}' is already used by another input file",
                item.path.display(),
                item.id
            );
        }
    }

    if items.is_empty() {
        return Err(PipelineError::NoInputFound(in_dir.to_path_buf()));
    }
    Ok(items)
}
