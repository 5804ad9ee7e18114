//! Single-file deployments — places received files under the storage root.
//!
//! Transfer information on the `deploy_single_file` channel:
//! `[target path: string][append: bool]`. The target is relative to the
//! node's storage root.

use std::fs::{File, OpenOptions};
use std::path::{Component, Path, PathBuf};

use fleet_core::{BufferError, TransferBuffer, TransferBufferMut};
use fleet_transfer::{CompletedTransfer, TransferCallback};

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("invalid deployment information: {0}")]
    Information(#[from] BufferError),

    #[error("target path {0:?} must be relative and stay inside the storage root")]
    UnsafeTarget(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployTarget {
    pub path: String,
    /// Append to an existing file instead of replacing it.
    pub append: bool,
}

impl DeployTarget {
    pub fn new(path: impl Into<String>, append: bool) -> Self {
        Self {
            path: path.into(),
            append,
        }
    }

    pub fn encode(&self) -> TransferBufferMut {
        let mut out = TransferBufferMut::with_capacity(self.path.len() + 6);
        out.write_string(&self.path).write_bool(self.append);
        out
    }

    pub fn decode(info: &mut TransferBuffer) -> Result<Self, BufferError> {
        let path = info.read_string()?;
        let append = info.read_bool()?;
        Ok(Self { path, append })
    }
}

/// Check that `target` is a plain relative path.
pub fn validate_target(target: &str) -> Result<&Path, DeployError> {
    let path = Path::new(target);
    let plain = !target.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !plain {
        return Err(DeployError::UnsafeTarget(target.to_string()));
    }
    Ok(path)
}

pub fn resolve_target(root: &Path, target: &str) -> Result<PathBuf, DeployError> {
    Ok(root.join(validate_target(target)?))
}

/// Moves completed `deploy_single_file` transfers into place.
pub struct FileDeployer {
    storage_root: PathBuf,
}

impl FileDeployer {
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
        }
    }

    pub fn deploy(&self, transfer: CompletedTransfer) -> Result<PathBuf, DeployError> {
        let target = DeployTarget::decode(&mut transfer.descriptor.information_buffer())?;
        let dest = resolve_target(&self.storage_root, &target.path)?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if target.append {
            let mut out = OpenOptions::new().create(true).append(true).open(&dest)?;
            let mut received = File::open(&transfer.path)?;
            std::io::copy(&mut received, &mut out)?;
            out.sync_all()?;
        } else {
            transfer.persist(&dest)?;
        }
        Ok(dest)
    }
}

impl TransferCallback for FileDeployer {
    fn on_complete(&self, transfer: CompletedTransfer) {
        let session = transfer.descriptor.session_id();
        let size = transfer.size;
        let digest = transfer.digest_hex();
        match self.deploy(transfer) {
            Ok(dest) => tracing::info!(
                session = %session,
                path = %dest.display(),
                bytes = size,
                digest,
                "file deployed"
            ),
            Err(e) => tracing::warn!(session = %session, error = %e, "file deployment failed"),
        }
    }
}
