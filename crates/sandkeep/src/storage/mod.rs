//! Remote bucket mount management.
//!
//! The bucket is attached with a FUSE mount tool (s3fs by default). Whether it
//! is attached is always read back from the mount table. Once mounted, the
//! mount path belongs to the remote side: nothing in this crate removes it or
//! recursively overwrites it.

mod error;
mod manager;
mod mounter;
mod table;

pub use error::{MountError, MountResult};
pub use manager::{MountManager, MountSnapshot, MountStatus};
pub use mounter::{BucketMounter, MountRequest, S3fsMounter, is_empty_dir};
pub use table::{MountEntry, MountTable, ProcMountTable, parse_mounts};
