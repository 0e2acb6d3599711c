//! File-level plumbing: sparse allocation, checksums, and the idle-timeout
//! copy pump shared by every byte-moving path.

pub mod checksum;
pub mod copy;

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::error::Result;

/// Directory layout convention: each backing image lives at
/// `<data_dir>/<name>-<uuid>/backing`.
pub fn backing_image_path(data_dir: &Path, name: &str, uuid: &str) -> PathBuf {
    data_dir.join(format!("{name}-{uuid}")).join("backing")
}

/// Create the destination file (and its parent directories) preallocated to
/// `size` bytes. The allocation is a plain length extension, so filesystems
/// with hole support keep the file fully sparse until real bytes land.
pub async fn allocate_sparse(path: &Path, size: u64) -> Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let file = fs::File::create(path).await?;
    if size > 0 {
        file.set_len(size).await?;
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_backing_image_path_convention() {
        let path = backing_image_path(Path::new("/data"), "parrot", "6846a0b2");
        assert_eq!(path, PathBuf::from("/data/parrot-6846a0b2/backing"));
    }

    #[tokio::test]
    async fn test_allocate_sparse_creates_parents_and_length() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("img-uuid1").join("backing");

        let file = allocate_sparse(&path, 8192).await.unwrap();
        drop(file);

        let meta = fs::metadata(&path).await.unwrap();
        assert_eq!(meta.len(), 8192);
    }

    #[tokio::test]
    async fn test_allocate_sparse_zero_size() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("backing");

        allocate_sparse(&path, 0).await.unwrap();
        assert_eq!(fs::metadata(&path).await.unwrap().len(), 0);
    }
}
