use crate::error::Result;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// ビルドキャッシュとビルドストアの排他ロック
///
/// コンテナビルドの間だけ保持します。別プロセスが保持中なら解放まで待ちます。
pub struct CacheLock {
    lock_file: File,
}

impl CacheLock {
    pub fn acquire(lock_path: &Path) -> Result<Self> {
        let file = open_lock_file(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { lock_file: file })
    }

    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>> {
        let file = open_lock_file(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(e) if is_contended(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// ランタイムを塞がないよう、ブロッキングスレッドで取得する
    pub async fn acquire_async(lock_path: PathBuf) -> Result<Self> {
        if let Some(lock) = Self::try_acquire(&lock_path)? {
            return Ok(lock);
        }
        tracing::info!(lock = %lock_path.display(), "Waiting for another build to release the cache");
        tokio::task::spawn_blocking(move || Self::acquire(&lock_path))
            .await
            .map_err(std::io::Error::other)?
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock_file);
    }
}

/// 他のプロセスが保持しているために取れなかったか
fn is_contended(error: &std::io::Error) -> bool {
    error.raw_os_error().is_some()
        && error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn open_lock_file(lock_path: &Path) -> Result<File> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("nested/build.lock");

        {
            let _lock = CacheLock::acquire(&lock_path).unwrap();
            assert!(lock_path.exists());
            assert!(CacheLock::try_acquire(&lock_path).unwrap().is_none());
        }

        assert!(CacheLock::try_acquire(&lock_path).unwrap().is_some());
    }

    #[test]
    fn test_only_contention_means_lock_is_busy() {
        assert!(is_contended(&fs2::lock_contended_error()));
        assert!(!is_contended(&std::io::Error::other("bad file descriptor")));
        assert!(!is_contended(&std::io::Error::from(
            std::io::ErrorKind::PermissionDenied
        )));
    }

    #[tokio::test]
    async fn test_acquire_async_waits_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("build.lock");

        let first = CacheLock::acquire(&lock_path).unwrap();
        let waiter = tokio::spawn(CacheLock::acquire_async(lock_path.clone()));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let second = waiter.await.unwrap();
        assert!(second.is_ok());
    }
}
