//! Clone a backing image that already lives on this node.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::EncryptionMode;
use crate::storage::copy::{idle_timeout_copy, ProgressUpdater};

/// Produces a copy of an existing local backing image. The encrypt/decrypt
/// variants are owned by an external crypto engine; this seam is where it
/// plugs in.
#[async_trait]
pub trait CloneBackend: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn clone_to(
        &self,
        src_image: &str,
        src_uuid: &str,
        dst_path: &Path,
        encryption: EncryptionMode,
        credential: &HashMap<String, String>,
        updater: Arc<dyn ProgressUpdater>,
        cancel: CancellationToken,
    ) -> Result<u64>;
}

/// Plain-copy clone backend resolving sources under the node's data
/// directory. Encrypt/decrypt requests are refused until a crypto engine is
/// wired in.
pub struct LocalCloneBackend {
    data_dir: PathBuf,
}

impl LocalCloneBackend {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }
}

#[async_trait]
impl CloneBackend for LocalCloneBackend {
    async fn clone_to(
        &self,
        src_image: &str,
        src_uuid: &str,
        dst_path: &Path,
        encryption: EncryptionMode,
        credential: &HashMap<String, String>,
        updater: Arc<dyn ProgressUpdater>,
        cancel: CancellationToken,
    ) -> Result<u64> {
        if encryption != EncryptionMode::Ignore {
            return Err(AppError::SourceError(format!(
                "no encryption engine is configured for an {encryption} clone"
            )));
        }
        // Credentials belong to the crypto engine; the plain copy has no use
        // for them.
        let _ = credential;

        let src_path = crate::storage::backing_image_path(&self.data_dir, src_image, src_uuid);
        let mut src = fs::File::open(&src_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::SourceError(format!(
                    "source backing image {src_image}-{src_uuid} not found on this disk"
                ))
            } else {
                AppError::Io(e)
            }
        })?;

        if let Some(parent) = dst_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut dst = fs::File::create(dst_path).await?;

        let written = idle_timeout_copy(&mut src, &mut dst, &*updater, false, &cancel).await?;

        dst.set_len(written).await?;
        dst.sync_all().await?;
        Ok(written)
    }
}
