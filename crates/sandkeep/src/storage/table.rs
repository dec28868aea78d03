//! Mount table inspection.
//!
//! Whether the bucket is attached is decided from the kernel's mount table,
//! never from the mount tool's error text.

use std::path::{Path, PathBuf};

/// One line of `/proc/self/mounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
}

/// Read access to the current mount table.
pub trait MountTable: Send + Sync {
    /// All current mounts.
    fn entries(&self) -> std::io::Result<Vec<MountEntry>>;

    /// Whether `path` is itself a mount point.
    fn is_mount_point(&self, path: &Path) -> std::io::Result<bool> {
        let wanted = normalize(path);
        Ok(self
            .entries()?
            .iter()
            .any(|entry| normalize(&entry.target) == wanted))
    }
}

/// Mount table backed by `/proc/self/mounts`.
#[derive(Debug, Clone)]
pub struct ProcMountTable {
    path: PathBuf,
}

impl Default for ProcMountTable {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/proc/self/mounts"),
        }
    }
}

impl ProcMountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a mount table from a different file (tests, chroots).
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MountTable for ProcMountTable {
    fn entries(&self) -> std::io::Result<Vec<MountEntry>> {
        let text = std::fs::read_to_string(&self.path)?;
        Ok(parse_mounts(&text))
    }
}

/// Parse the `/proc/mounts` format.
///
/// Fields are whitespace separated; spaces, tabs, newlines and backslashes
/// inside paths are octal-escaped (`\040`, `\011`, `\012`, `\134`).
pub fn parse_mounts(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fstype = fields.next()?;
            Some(MountEntry {
                source: unescape(source),
                target: PathBuf::from(unescape(target)),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let octal = &bytes[i + 1..i + 4];
            if octal.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = octal.iter().fold(0u16, |acc, b| acc * 8 + u16::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn normalize(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    let trimmed = text.trim_end_matches('/');
    if trimmed.is_empty() {
        PathBuf::from("/")
    } else {
        PathBuf::from(trimmed)
    }
}
