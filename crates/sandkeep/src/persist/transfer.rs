//! One-directional, recursive file transfer.
//!
//! Both backends ignore modification times: the remote mount does not keep
//! them, so files are compared by content (or always re-sent). Neither
//! backend deletes anything at the destination.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use glob::Pattern;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::error::{TransferError, TransferResult};

/// Which transfer implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferBackend {
    /// External `rsync` binary.
    #[default]
    Rsync,
    /// In-process copy.
    Builtin,
}

/// Outcome of a successful transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReport {
    /// Files written at the destination.
    pub entries: u64,
}

/// Copies a directory tree from `source` into `destination`.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    async fn transfer(&self, source: &Path, destination: &Path) -> TransferResult<TransferReport>;
}

/// Transfer via `rsync -r --no-times`.
#[derive(Debug, Clone)]
pub struct RsyncTransfer {
    binary: String,
    checksum: bool,
    exclude: Vec<String>,
    timeout: Duration,
}

/// rsync exit code for "some source files vanished before they could be
/// transferred". Expected while the gateway is writing.
const RSYNC_VANISHED: i32 = 24;

impl RsyncTransfer {
    pub fn new(
        binary: impl Into<String>,
        checksum: bool,
        exclude: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            binary: binary.into(),
            checksum,
            exclude,
            timeout,
        }
    }

    /// Build the rsync argument list.
    pub fn build_args(&self, source: &Path, destination: &Path) -> Vec<String> {
        let mut args = vec![
            "-r".to_string(),
            "--no-times".to_string(),
            "--out-format=%n".to_string(),
        ];
        if self.checksum {
            args.push("--checksum".to_string());
        }
        for pattern in &self.exclude {
            args.push(format!("--exclude={pattern}"));
        }
        // Trailing slashes copy directory contents rather than the directory.
        args.push(format!("{}/", source.display()));
        args.push(format!("{}/", destination.display()));
        args
    }
}

#[async_trait]
impl FileTransfer for RsyncTransfer {
    async fn transfer(&self, source: &Path, destination: &Path) -> TransferResult<TransferReport> {
        if !source.is_dir() {
            return Err(TransferError::SourceMissing(source.to_path_buf()));
        }
        tokio::fs::create_dir_all(destination).await?;

        let args = self.build_args(source, destination);
        debug!("{} {:?}", self.binary, args);

        let child = Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => TransferError::BinaryMissing(self.binary.clone()),
                _ => TransferError::Io(e),
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| TransferError::TimedOut(self.timeout))??;

        match output.status.code() {
            Some(0) => {}
            Some(RSYNC_VANISHED) => {
                warn!(
                    "Some files vanished during transfer {} -> {}",
                    source.display(),
                    destination.display()
                );
            }
            _ => {
                return Err(TransferError::CommandFailed {
                    status: output.status.to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(TransferReport {
            entries: count_transferred_files(&stdout),
        })
    }
}

/// Count file lines in rsync `--out-format=%n` output (directories end in '/').
fn count_transferred_files(stdout: &str) -> u64 {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.ends_with('/'))
        .count() as u64
}

/// In-process transfer that copies files whose content differs.
#[derive(Debug, Clone)]
pub struct BuiltinTransfer {
    exclude: Vec<Pattern>,
}

impl BuiltinTransfer {
    pub fn new(exclude: &[String]) -> TransferResult<Self> {
        let exclude = exclude
            .iter()
            .map(|p| Pattern::new(p).map_err(|_| TransferError::InvalidPattern(p.clone())))
            .collect::<TransferResult<Vec<_>>>()?;
        Ok(Self { exclude })
    }
}

#[async_trait]
impl FileTransfer for BuiltinTransfer {
    async fn transfer(&self, source: &Path, destination: &Path) -> TransferResult<TransferReport> {
        let exclude = self.exclude.clone();
        let source = source.to_path_buf();
        let destination = destination.to_path_buf();

        tokio::task::spawn_blocking(move || copy_tree(&source, &destination, &exclude))
            .await
            .map_err(|e| TransferError::Io(std::io::Error::other(e)))?
    }
}

fn copy_tree(source: &Path, destination: &Path, exclude: &[Pattern]) -> TransferResult<TransferReport> {
    if !source.is_dir() {
        return Err(TransferError::SourceMissing(source.to_path_buf()));
    }
    fs::create_dir_all(destination)?;

    let is_excluded = |name: &std::ffi::OsStr| {
        let name = name.to_string_lossy();
        exclude.iter().any(|p| p.matches(&name))
    };

    let mut report = TransferReport::default();
    let walker = WalkDir::new(source)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_excluded(e.file_name()));

    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(std::io::Error::other)?;
        let target: PathBuf = destination.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            if !same_content(entry.path(), &target)? {
                fs::copy(entry.path(), &target)?;
                report.entries += 1;
            }
        } else {
            debug!("Skipping non-regular file {}", entry.path().display());
        }
    }

    info!(
        "Copied {} file(s) {} -> {}",
        report.entries,
        source.display(),
        destination.display()
    );
    Ok(report)
}

fn same_content(a: &Path, b: &Path) -> std::io::Result<bool> {
    let meta_b = match fs::metadata(b) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if !meta_b.is_file() || fs::metadata(a)?.len() != meta_b.len() {
        return Ok(false);
    }
    Ok(file_digest(a)? == file_digest(b)?)
}

fn file_digest(path: &Path) -> std::io::Result<[u8; 32]> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, body: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, body).unwrap();
    }

    #[test]
    fn test_rsync_args_are_timestamp_agnostic() {
        let rsync = RsyncTransfer::new(
            "rsync",
            true,
            vec!["*.lock".to_string(), ".last-sync".to_string()],
            Duration::from_secs(60),
        );
        let args = rsync.build_args(Path::new("/root/.clawdbot"), Path::new("/data/moltbot/clawdbot"));

        assert!(args.contains(&"-r".to_string()));
        assert!(args.contains(&"--no-times".to_string()));
        assert!(args.contains(&"--checksum".to_string()));
        assert!(args.contains(&"--exclude=*.lock".to_string()));
        assert!(args.contains(&"--exclude=.last-sync".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--delete")));
        assert!(!args.iter().any(|a| a == "-a" || a == "--times"));
        assert_eq!(args[args.len() - 2], "/root/.clawdbot/");
        assert_eq!(args[args.len() - 1], "/data/moltbot/clawdbot/");
    }

    #[test]
    fn test_count_transferred_files() {
        let out = "./\nagents/\nagents/main.json\nclawdbot.json\n\n";
        assert_eq!(count_transferred_files(out), 2);
    }

    #[tokio::test]
    async fn test_builtin_copies_tree_and_skips_excluded() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(&src.path().join("clawdbot.json"), "{}");
        write(&src.path().join("agents/main/session.json"), "[]");
        write(&src.path().join("gateway.lock"), "123");
        write(&src.path().join(".last-sync"), "{}");

        let transfer =
            BuiltinTransfer::new(&["*.lock".to_string(), ".last-sync".to_string()]).unwrap();
        let report = transfer.transfer(src.path(), dst.path()).await.unwrap();

        assert_eq!(report.entries, 2);
        assert!(dst.path().join("clawdbot.json").exists());
        assert!(dst.path().join("agents/main/session.json").exists());
        assert!(!dst.path().join("gateway.lock").exists());
        assert!(!dst.path().join(".last-sync").exists());
    }

    #[tokio::test]
    async fn test_builtin_skips_identical_and_never_deletes() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(&src.path().join("a.json"), "same");
        write(&src.path().join("b.json"), "new");
        write(&dst.path().join("a.json"), "same");
        write(&dst.path().join("b.json"), "old");
        write(&dst.path().join("remote-only.json"), "keep");

        let transfer = BuiltinTransfer::new(&[]).unwrap();
        let report = transfer.transfer(src.path(), dst.path()).await.unwrap();

        assert_eq!(report.entries, 1);
        assert_eq!(fs::read_to_string(dst.path().join("b.json")).unwrap(), "new");
        assert!(dst.path().join("remote-only.json").exists());
    }

    #[tokio::test]
    async fn test_builtin_missing_source() {
        let dst = tempfile::tempdir().unwrap();
        let transfer = BuiltinTransfer::new(&[]).unwrap();
        let err = transfer
            .transfer(&dst.path().join("nope"), dst.path())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::SourceMissing(_)));
    }

    #[test]
    fn test_invalid_pattern() {
        let err = BuiltinTransfer::new(&["[".to_string()]).unwrap_err();
        assert!(matches!(err, TransferError::InvalidPattern(_)));
    }
}
