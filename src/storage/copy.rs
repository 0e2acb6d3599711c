//! Reader→writer pump with idle-timeout cancellation and zero-block skipping.

use std::io::SeekFrom;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};

/// Copy buffer size; also the granularity of zero-block detection.
pub const COPY_BUFFER_SIZE: usize = 1 << 12;

/// Idle window: the copy is abandoned if no bytes move within it.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Receives a byte count after every successful write or seek-forward.
///
/// Updates arrive in strictly increasing byte-offset order on the single
/// pump task; implementations only need interior mutability, not locking
/// against concurrent updates for the same file.
pub trait ProgressUpdater: Send + Sync {
    fn update_progress(&self, moved: u64);
}

/// Copy `src` into `dst`, reporting progress after every write.
///
/// When `write_zero` is false, buffers that are entirely zero advance the
/// writer with a seek instead of a write, preserving holes in sparse files.
/// A source that produces no bytes within [`IDLE_TIMEOUT`] fails the copy;
/// `cancel` aborts it immediately.
///
/// Returns the number of bytes moved (written plus skipped). The destination
/// is not truncated; callers that skipped trailing zeros must extend the
/// file to the returned length themselves.
pub async fn idle_timeout_copy<R, W>(
    src: &mut R,
    dst: &mut W,
    updater: &dyn ProgressUpdater,
    write_zero: bool,
    cancel: &CancellationToken,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + AsyncSeek + Unpin + ?Sized,
{
    copy_with_idle_window(src, dst, updater, write_zero, cancel, IDLE_TIMEOUT).await
}

async fn copy_with_idle_window<R, W>(
    src: &mut R,
    dst: &mut W,
    updater: &dyn ProgressUpdater,
    write_zero: bool,
    cancel: &CancellationToken,
    window: Duration,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + AsyncSeek + Unpin + ?Sized,
{
    let mut buf = [0u8; COPY_BUFFER_SIZE];
    let mut copied: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled("copy interrupted".to_string()));
        }

        let n = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(AppError::Cancelled("copy interrupted".to_string()));
            }
            read = tokio::time::timeout(window, src.read(&mut buf)) => match read {
                Err(_) => {
                    return Err(AppError::IdleTimeout(format!(
                        "no data moved within {}s",
                        window.as_secs()
                    )));
                }
                Ok(r) => r?,
            },
        };

        if n == 0 {
            break;
        }

        if !write_zero && buf[..n].iter().all(|&b| b == 0) {
            dst.seek(SeekFrom::Current(n as i64)).await?;
        } else {
            dst.write_all(&buf[..n]).await?;
        }

        copied += n as u64;
        updater.update_progress(n as u64);
    }

    dst.flush().await?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};

    #[derive(Debug, PartialEq)]
    enum Op {
        Write(usize),
        Seek(u64),
    }

    /// Writer that records every write/seek so sparse behavior is observable.
    #[derive(Default)]
    struct RecordingWriter {
        ops: Vec<Op>,
        pos: u64,
    }

    impl AsyncWrite for RecordingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            let this = self.get_mut();
            this.ops.push(Op::Write(buf.len()));
            this.pos += buf.len() as u64;
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncSeek for RecordingWriter {
        fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
            let this = self.get_mut();
            if let SeekFrom::Current(delta) = position {
                this.ops.push(Op::Seek(delta as u64));
                this.pos += delta as u64;
            }
            Ok(())
        }

        fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
            Poll::Ready(Ok(self.pos))
        }
    }

    #[derive(Default)]
    struct RecordingUpdater {
        moved: Mutex<Vec<u64>>,
    }

    impl ProgressUpdater for RecordingUpdater {
        fn update_progress(&self, moved: u64) {
            self.moved.lock().unwrap().push(moved);
        }
    }

    #[tokio::test]
    async fn test_zero_blocks_become_seeks() {
        let mut data = vec![0xABu8; COPY_BUFFER_SIZE];
        data.extend(vec![0u8; COPY_BUFFER_SIZE]);
        data.extend(vec![0xCDu8; 100]);

        let mut src = data.as_slice();
        let mut dst = RecordingWriter::default();
        let updater = RecordingUpdater::default();
        let cancel = CancellationToken::new();

        let copied = idle_timeout_copy(&mut src, &mut dst, &updater, false, &cancel)
            .await
            .unwrap();

        assert_eq!(copied, data.len() as u64);
        assert_eq!(
            dst.ops,
            vec![
                Op::Write(COPY_BUFFER_SIZE),
                Op::Seek(COPY_BUFFER_SIZE as u64),
                Op::Write(100),
            ]
        );
    }

    #[tokio::test]
    async fn test_short_zero_tail_is_skipped() {
        let mut data = vec![0xAAu8; COPY_BUFFER_SIZE];
        data.extend(vec![0u8; 50]);

        let mut src = data.as_slice();
        let mut dst = RecordingWriter::default();
        let cancel = CancellationToken::new();

        let copied =
            idle_timeout_copy(&mut src, &mut dst, &RecordingUpdater::default(), false, &cancel)
                .await
                .unwrap();

        assert_eq!(copied, (COPY_BUFFER_SIZE + 50) as u64);
        assert_eq!(dst.ops, vec![Op::Write(COPY_BUFFER_SIZE), Op::Seek(50)]);
    }

    #[tokio::test]
    async fn test_write_zero_mode_writes_everything() {
        let data = vec![0u8; COPY_BUFFER_SIZE * 2];

        let mut src = data.as_slice();
        let mut dst = RecordingWriter::default();
        let cancel = CancellationToken::new();

        let copied =
            idle_timeout_copy(&mut src, &mut dst, &RecordingUpdater::default(), true, &cancel)
                .await
                .unwrap();

        assert_eq!(copied, data.len() as u64);
        assert_eq!(
            dst.ops,
            vec![Op::Write(COPY_BUFFER_SIZE), Op::Write(COPY_BUFFER_SIZE)]
        );
    }

    #[tokio::test]
    async fn test_progress_updates_sum_to_copied() {
        let data = vec![0x11u8; COPY_BUFFER_SIZE * 3 + 7];

        let mut src = data.as_slice();
        let mut dst = RecordingWriter::default();
        let updater = RecordingUpdater::default();
        let cancel = CancellationToken::new();

        let copied = idle_timeout_copy(&mut src, &mut dst, &updater, false, &cancel)
            .await
            .unwrap();

        let moved = updater.moved.lock().unwrap();
        assert_eq!(moved.iter().sum::<u64>(), copied);
        assert!(moved.iter().all(|&m| m > 0));
    }

    #[tokio::test]
    async fn test_stalled_source_hits_idle_timeout() {
        // Reader side of a duplex pipe nobody writes to.
        let (_tx, mut src) = tokio::io::duplex(64);
        let mut dst = RecordingWriter::default();
        let cancel = CancellationToken::new();

        let err = copy_with_idle_window(
            &mut src,
            &mut dst,
            &RecordingUpdater::default(),
            false,
            &cancel,
            Duration::from_millis(30),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AppError::IdleTimeout(_)));
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts_copy() {
        let data = vec![0x22u8; 16];
        let mut src = data.as_slice();
        let mut dst = RecordingWriter::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = idle_timeout_copy(
            &mut src,
            &mut dst,
            &RecordingUpdater::default(),
            false,
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AppError::Cancelled(_)));
        assert!(dst.ops.is_empty());
    }

    #[tokio::test]
    async fn test_sparse_copy_into_real_file_keeps_length_promise() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("backing");

        let mut data = vec![0x42u8; COPY_BUFFER_SIZE];
        data.extend(vec![0u8; COPY_BUFFER_SIZE]);

        let mut src = data.as_slice();
        let mut dst = tokio::fs::File::create(&path).await.unwrap();
        let cancel = CancellationToken::new();

        let copied =
            idle_timeout_copy(&mut src, &mut dst, &RecordingUpdater::default(), false, &cancel)
                .await
                .unwrap();
        dst.set_len(copied).await.unwrap();
        dst.sync_all().await.unwrap();

        let content = tokio::fs::read(&path).await.unwrap();
        assert_eq!(content, data);
    }
}
