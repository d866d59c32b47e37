use crate::CRATE_NAME;
use fs4::tokio::AsyncFileExt;
use std::path::Path;
use tokio::fs::File;
use tracing::{error, info};

async fn renewal_lock(state_directory: &Path) -> std::io::Result<File> {
    let lock_file = state_directory.join("renew.lock");
    let lock_file = File::create(lock_file).await?;
    if lock_file.try_lock_exclusive()? {
        Ok(lock_file)
    } else {
        info!(
            "Another {CRATE_NAME} process is currently renewing certificates. Waiting for the other process to finish..."
        );
        tokio::task::spawn_blocking(move || {
            lock_file.lock_exclusive()?;
            Ok(lock_file)
        })
        .await?
    }
}

/// Exclusive process-wide lock around a renewal pass. Two processes renewing
/// the same state directory would race on store slots and record files.
#[must_use]
#[clippy::has_significant_drop]
pub struct RenewalLock {
    lock_file: File,
}

impl RenewalLock {
    pub async fn exclusive_lock(state_directory: &Path) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(state_directory).await?;
        let lock_file = renewal_lock(state_directory).await?;
        Ok(Self { lock_file })
    }
}

impl Drop for RenewalLock {
    fn drop(&mut self) {
        if let Err(e) = self.lock_file.unlock() {
            error!("Failed to release renewal lock: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_is_exclusive_within_a_process() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RenewalLock::exclusive_lock(dir.path()).await.unwrap();
        // A second lock attempt on the same file must not succeed immediately
        let contended = File::create(dir.path().join("renew.lock")).await.unwrap();
        assert!(!contended.try_lock_exclusive().unwrap());
        drop(lock);
        assert!(contended.try_lock_exclusive().unwrap());
    }
}
