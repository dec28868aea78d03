//! Bucket mount tool integration.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::error::{MountError, MountResult};
use crate::config::StorageConfig;
use crate::secrets::SecretSource;

/// What to mount and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    pub bucket: String,
    pub mount_path: PathBuf,
    pub endpoint: Option<String>,
}

impl MountRequest {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            bucket: config.bucket.clone(),
            mount_path: PathBuf::from(&config.mount_path),
            endpoint: config.resolved_endpoint(),
        }
    }
}

/// Attaches a remote bucket to a local path.
///
/// Implementations perform exactly one attempt per call; deciding whether a
/// mount is needed is the caller's job.
#[async_trait]
pub trait BucketMounter: Send + Sync {
    async fn mount(&self, request: &MountRequest) -> MountResult<()>;
}

/// Mounts S3-compatible buckets (R2, MinIO, S3) with s3fs-fuse.
pub struct S3fsMounter {
    binary: String,
    options: Vec<String>,
    access_key_env: String,
    secret_key_env: String,
    passwd_file: PathBuf,
    timeout: Duration,
    secrets: Arc<dyn SecretSource>,
}

impl std::fmt::Debug for S3fsMounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3fsMounter")
            .field("binary", &self.binary)
            .field("options", &self.options)
            .field("passwd_file", &self.passwd_file)
            .finish()
    }
}

impl S3fsMounter {
    pub fn new(config: &StorageConfig, secrets: Arc<dyn SecretSource>) -> Self {
        Self {
            binary: config.mount_binary.clone(),
            options: config.mount_options.clone(),
            access_key_env: config.access_key_env.clone(),
            secret_key_env: config.secret_key_env.clone(),
            passwd_file: PathBuf::from(&config.passwd_file),
            timeout: config.mount_timeout(),
            secrets,
        }
    }

    fn credentials(&self) -> MountResult<(String, String)> {
        let access = self
            .secrets
            .get(&self.access_key_env)
            .ok_or_else(|| MountError::CredentialsMissing(self.access_key_env.clone()))?;
        let secret = self
            .secrets
            .get(&self.secret_key_env)
            .ok_or_else(|| MountError::CredentialsMissing(self.secret_key_env.clone()))?;
        Ok((access, secret))
    }

    /// Write the `ACCESS:SECRET` file s3fs reads, readable by owner only.
    async fn write_passwd_file(&self, access: &str, secret: &str) -> MountResult<()> {
        if let Some(parent) = self.passwd_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.passwd_file, format!("{access}:{secret}\n")).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&self.passwd_file, perms).await?;
        }
        Ok(())
    }

    /// Build the s3fs argument list.
    pub fn build_args(&self, request: &MountRequest) -> Vec<String> {
        let mut args = vec![
            request.bucket.clone(),
            request.mount_path.to_string_lossy().to_string(),
            "-o".to_string(),
            format!("passwd_file={}", self.passwd_file.display()),
        ];
        if let Some(ref endpoint) = request.endpoint {
            args.push("-o".to_string());
            args.push(format!("url={endpoint}"));
        }
        for option in &self.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args
    }
}

#[async_trait]
impl BucketMounter for S3fsMounter {
    async fn mount(&self, request: &MountRequest) -> MountResult<()> {
        if !rustix::process::geteuid().is_root() {
            return Err(MountError::InsufficientPrivileges);
        }

        let (access, secret) = self.credentials()?;
        self.write_passwd_file(&access, &secret).await?;

        let args = self.build_args(request);
        info!(
            "Mounting bucket {} at {} via {}",
            request.bucket,
            request.mount_path.display(),
            self.binary
        );
        debug!("{} {:?}", self.binary, args);

        let child = Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => MountError::BinaryMissing(self.binary.clone()),
                _ => MountError::Io(e),
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| MountError::TimedOut(self.timeout))??;

        if !output.status.success() {
            return Err(MountError::CommandFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

/// Whether a directory has no entries. Missing directories count as empty.
pub fn is_empty_dir(path: &Path) -> std::io::Result<bool> {
    match std::fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e),
    }
}
