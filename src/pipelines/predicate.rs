//! Artifact path templates and the filesystem checks that decide whether a stage reruns.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::utils::file::{dir_is_non_empty, matching_entries};

/// Values substituted into a [`PathTemplate`].
#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub out: &'a Path,
    pub id: Option<&'a str>,
    pub cluster: Option<&'a str>,
}

/// Output-root-relative path with `{id}` and `{cluster}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate(String);

impl PathTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        PathTemplate(template.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Placeholders without a value are left verbatim so a misuse shows up in the path.
    pub fn render(&self, vars: TemplateVars<'_>) -> PathBuf {
        let mut rendered = self.0.clone();
        if let Some(id) = vars.id {
            rendered = rendered.replace("{id}", id);
        }
        if let Some(cluster) = vars.cluster {
            rendered = rendered.replace("{cluster}", cluster);
        }
        vars.out.join(rendered)
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a stage detects that it already ran. Every variant is a pure filesystem check.
#[derive(Debug, Clone)]
pub enum CompletionPredicate {
    FileExists(PathTemplate),
    DirNonEmpty(PathTemplate),
    /// At least `count` entries of `dir` match `pattern`.
    FileCount {
        dir: PathTemplate,
        pattern: &'static str,
        count: usize,
    },
    AnyMatch {
        dir: PathTemplate,
        pattern: &'static str,
    },
}

impl CompletionPredicate {
    pub fn is_satisfied(&self, vars: TemplateVars<'_>) -> bool {
        match self {
            CompletionPredicate::FileExists(path) => path.render(vars).is_file(),
            CompletionPredicate::DirNonEmpty(dir) => dir_is_non_empty(&dir.render(vars)),
            CompletionPredicate::FileCount { dir, pattern, count } => {
                matching_entries(&dir.render(vars), pattern)
                    .map(|found| found.len() >= *count)
                    .unwrap_or(false)
            }
            CompletionPredicate::AnyMatch { dir, pattern } => {
                matching_entries(&dir.render(vars), pattern)
                    .map(|found| !found.is_empty())
                    .unwrap_or(false)
            }
        }
    }

    pub fn describe(&self, vars: TemplateVars<'_>) -> String {
        match self {
            CompletionPredicate::FileExists(path) => format!("{} exists", path.render(vars).display()),
            CompletionPredicate::DirNonEmpty(dir) => format!("{} is non-empty", dir.render(vars).display()),
            CompletionPredicate::FileCount { dir, pattern, count } => {
                format!("{} holds {} files matching {}", dir.render(vars).display(), count, pattern)
            }
            CompletionPredicate::AnyMatch { dir, pattern } => {
                format!("{} holds a file matching {}", dir.render(vars).display(), pattern)
            }
        }
    }
}
