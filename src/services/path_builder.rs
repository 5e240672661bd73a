//! Computes the in-archive path for each descriptor.
//!
//! Names are sanitized first, deduplicated second, and only then prefixed with
//! the project and folder components.

use crate::models::descriptor::FileDescriptor;
use std::collections::HashMap;

/// Characters stripped from file, project and download names.
pub const FORBIDDEN_NAME_CHARS: [char; 10] = ['#', '<', '>', ':', '"', '/', '\\', '|', '?', '*'];

pub const FALLBACK_FILE_NAME: &str = "file";
pub const FALLBACK_PROJECT_NAME: &str = "Project";

/// What a name is compared against when looking for duplicates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DedupScope {
    /// Sanitized file name only, regardless of project or folder.
    #[default]
    BaseName,
    /// Full archive path, so equal names in different folders stay unsuffixed.
    FullPath,
}

/// Request-scoped record of names handed out so far.
#[derive(Debug, Default)]
pub struct ArchiveNameRegistry {
    scope: DedupScope,
    counts: HashMap<String, usize>,
}

impl ArchiveNameRegistry {
    pub fn new(scope: DedupScope) -> Self {
        Self {
            scope,
            counts: HashMap::new(),
        }
    }

    /// Reserve `key`. Returns `None` on first use, otherwise the suffix number
    /// to apply, bumping the counter for the next duplicate.
    fn claim(&mut self, key: &str) -> Option<usize> {
        match self.counts.get_mut(key) {
            Some(count) => {
                let n = *count;
                *count += 1;
                Some(n)
            }
            None => {
                self.counts.insert(key.to_string(), 1);
                None
            }
        }
    }
}

/// Remove every [`FORBIDDEN_NAME_CHARS`] character from `raw`.
pub fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| !FORBIDDEN_NAME_CHARS.contains(c))
        .collect()
}

/// Like [`sanitize_name`] but substitutes `fallback` for an empty result.
pub fn sanitize_or(raw: &str, fallback: &str) -> String {
    let clean = sanitize_name(raw);
    if clean.is_empty() {
        fallback.to_string()
    } else {
        clean
    }
}

/// Build the archive path for `descriptor`, recording its name in `registry`.
pub fn build_path(descriptor: &FileDescriptor, registry: &mut ArchiveNameRegistry) -> String {
    let name = sanitize_or(&descriptor.file_name, FALLBACK_FILE_NAME);
    let prefix = entry_prefix(descriptor);

    let key = match registry.scope {
        DedupScope::BaseName => base_name(&name).to_string(),
        DedupScope::FullPath => format!("{}{}", prefix, name),
    };
    let name = match registry.claim(&key) {
        Some(n) => with_counter(&name, n),
        None => name,
    };

    prefix + &name
}

/// `"{projectID}.{projectName}/"` for grouped files, then the folder.
fn entry_prefix(descriptor: &FileDescriptor) -> String {
    let mut prefix = String::new();
    if descriptor.project_id > 0 {
        let project = sanitize_or(&descriptor.project_name, FALLBACK_PROJECT_NAME);
        prefix.push_str(&format!("{}.{}/", descriptor.project_id, project));
    }

    // Empty, `.` and `..` segments would yield `//` or escape the root.
    for segment in descriptor
        .folder
        .split('/')
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
    {
        prefix.push_str(segment);
        prefix.push('/');
    }
    prefix
}

fn base_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// `"report.pdf"` with n = 2 becomes `"report (2).pdf"`.
fn with_counter(name: &str, n: usize) -> String {
    let base = base_name(name);
    let (stem, extension) = match base.rfind('.') {
        Some(idx) => base.split_at(idx),
        None => (base, ""),
    };
    format!("{} ({}){}", stem, n, extension)
}
