//! File-level operations: download to / upload from a local path with
//! existence policies and optional verification retries.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::session::ControlSession;
use crate::ftp::transfer::ProgressHandler;
use crate::ftp::types::*;
use crate::ftp::verify::{Verification, VerifyOptions};
use std::path::Path;
use tokio::fs;

impl ControlSession {
    // ─── DOWNLOAD ────────────────────────────────────────────────

    /// Download `remote_path` to `local_path`.
    pub async fn download_file(
        &mut self,
        local_path: &Path,
        remote_path: &str,
        exists: LocalExists,
        verify: Option<Verification<'_>>,
        progress: Option<&ProgressHandler>,
    ) -> FtpResult<TransferStatus> {
        let progress = progress.map(|p| p.clone().with_local_path(local_path.display().to_string()));
        let attempts = verify.map_or(1, |v| v.attempts(self.config().retry_attempts));
        let mut mode = exists;

        for attempt in 1..=attempts {
            let status = self
                .download_file_once(local_path, remote_path, mode, progress.as_ref())
                .await?;
            let Some(v) = verify else {
                return Ok(status);
            };
            if status != TransferStatus::Success {
                return Ok(status);
            }
            if v.verifier.verify(self, local_path, remote_path).await? {
                log::debug!("FTP: {} verified", remote_path);
                return Ok(TransferStatus::Success);
            }
            log::warn!(
                "FTP: verification of {} failed (attempt {}/{})",
                remote_path,
                attempt,
                attempts
            );
            mode = LocalExists::Overwrite;
        }

        // Only reachable with a verifier.
        let options = verify.map(|v| v.options).unwrap_or_default();
        if options.contains(VerifyOptions::DELETE) {
            if let Err(e) = fs::remove_file(local_path).await {
                log::warn!("FTP: could not delete unverified {}: {}", local_path.display(), e);
            }
        }
        if options.contains(VerifyOptions::THROW) {
            return Err(FtpError::verification(format!(
                "Downloaded file {} failed verification",
                local_path.display()
            )));
        }
        Ok(TransferStatus::Failed)
    }

    async fn download_file_once(
        &mut self,
        local_path: &Path,
        remote_path: &str,
        exists: LocalExists,
        progress: Option<&ProgressHandler>,
    ) -> FtpResult<TransferStatus> {
        let local_len = match fs::metadata(local_path).await {
            Ok(meta) if meta.is_file() => Some(meta.len()),
            _ => None,
        };

        let mut restart = 0;
        let mut length = LengthHint::Unknown;
        match (exists, local_len) {
            (LocalExists::Skip, Some(_)) => {
                log::info!("FTP: skipping download, {} exists", local_path.display());
                return Ok(TransferStatus::Skipped);
            }
            (LocalExists::Resume, Some(len)) => {
                let remote_len = self.file_size(remote_path).await?;
                if remote_len == Some(len) {
                    log::info!("FTP: skipping download, {} is complete", local_path.display());
                    return Ok(TransferStatus::Skipped);
                }
                if let Some(remote) = remote_len {
                    length = LengthHint::Known(remote);
                }
                restart = len;
            }
            _ => {}
        }

        if let Some(parent) = local_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut file = if restart > 0 {
            fs::OpenOptions::new().append(true).open(local_path).await?
        } else {
            fs::File::create(local_path).await?
        };
        let created = local_len.is_none();

        let result = self
            .download_stream(&mut file, remote_path, restart, length, progress)
            .await;
        drop(file);

        match result {
            Ok(true) => Ok(TransferStatus::Success),
            Ok(false) => {
                if created {
                    remove_partial(local_path).await;
                }
                Ok(TransferStatus::Failed)
            }
            Err(e) => {
                if created {
                    remove_partial(local_path).await;
                }
                Err(e)
            }
        }
    }

    // ─── UPLOAD ──────────────────────────────────────────────────

    /// Upload `local_path` to `remote_path`.
    pub async fn upload_file(
        &mut self,
        local_path: &Path,
        remote_path: &str,
        exists: RemoteExists,
        create_remote_dir: bool,
        verify: Option<Verification<'_>>,
        progress: Option<&ProgressHandler>,
    ) -> FtpResult<TransferStatus> {
        let progress = progress.map(|p| p.clone().with_local_path(local_path.display().to_string()));
        let attempts = verify.map_or(1, |v| v.attempts(self.config().retry_attempts));
        let mut file = fs::File::open(local_path)
            .await
            .map_err(|e| FtpError::io(format!("Cannot open {}: {}", local_path.display(), e)))?;
        let mut mode = exists;

        for attempt in 1..=attempts {
            let status = self
                .upload_stream(&mut file, remote_path, mode, create_remote_dir, progress.as_ref())
                .await?;
            let Some(v) = verify else {
                return Ok(status);
            };
            if status != TransferStatus::Success {
                return Ok(status);
            }
            if v.verifier.verify(self, local_path, remote_path).await? {
                log::debug!("FTP: {} verified", remote_path);
                return Ok(TransferStatus::Success);
            }
            log::warn!(
                "FTP: verification of {} failed (attempt {}/{})",
                remote_path,
                attempt,
                attempts
            );
            mode = RemoteExists::Overwrite;
        }

        let options = verify.map(|v| v.options).unwrap_or_default();
        if options.contains(VerifyOptions::DELETE) {
            if let Err(e) = self.delete_file(remote_path).await {
                log::warn!("FTP: could not delete unverified {}: {}", remote_path, e);
            }
        }
        if options.contains(VerifyOptions::THROW) {
            return Err(FtpError::verification(format!(
                "Uploaded file {} failed verification",
                remote_path
            )));
        }
        Ok(TransferStatus::Failed)
    }
}

async fn remove_partial(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => log::debug!("FTP: removed partial download {}", path.display()),
        Err(e) => log::warn!("FTP: could not remove partial download {}: {}", path.display(), e),
    }
}
