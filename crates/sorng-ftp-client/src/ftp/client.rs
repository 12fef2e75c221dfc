//! Shared FTP client handle.
//!
//! [`FtpClient`] is a cheap-to-clone handle around one [`ControlSession`]
//! behind a `tokio::sync::Mutex`, so only one command/reply pair is in
//! flight on the control socket. Work that should run in parallel gets
//! its own connection via [`FtpClient::acquire_clone`].

use crate::ftp::error::FtpResult;
use crate::ftp::reply::FtpReply;
use crate::ftp::session::ControlSession;
use crate::ftp::transfer::ProgressHandler;
use crate::ftp::types::*;
use crate::ftp::verify::Verification;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct FtpClient {
    session: Arc<Mutex<ControlSession>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for FtpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpClient")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl FtpClient {
    pub fn new(config: FtpConnectionConfig) -> Self {
        Self::from_session(ControlSession::new(config))
    }

    pub fn from_session(session: ControlSession) -> Self {
        let cancel = session.cancellation_token();
        Self {
            session: Arc::new(Mutex::new(session)),
            cancel,
        }
    }

    /// Exclusive access to the session for a sequence of commands.
    pub async fn lock(&self) -> MutexGuard<'_, ControlSession> {
        self.session.lock().await
    }

    pub async fn connect(&self) -> FtpResult<()> {
        self.lock().await.connect().await
    }

    pub async fn disconnect(&self) {
        self.lock().await.disconnect().await
    }

    pub async fn is_connected(&self) -> bool {
        self.lock().await.is_connected()
    }

    pub async fn execute(&self, command: &str) -> FtpResult<FtpReply> {
        self.lock().await.execute(command).await
    }

    /// Cancel whatever the session (and its clones) is doing.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// A connected copy of the session for parallel work. The caller owns
    /// it and should `disconnect()` it when done.
    pub async fn acquire_clone(&self) -> FtpResult<ControlSession> {
        let mut child = self.lock().await.clone_session();
        child.connect().await?;
        Ok(child)
    }

    async fn clones_transfers(&self) -> bool {
        self.lock().await.config().clone_data_connections
    }

    // ─── File transfers ──────────────────────────────────────────

    /// Download on the shared session, or on a throwaway clone when
    /// `clone_data_connections` is set.
    pub async fn download_file(
        &self,
        local_path: &Path,
        remote_path: &str,
        exists: LocalExists,
        verify: Option<Verification<'_>>,
        progress: Option<&ProgressHandler>,
    ) -> FtpResult<TransferStatus> {
        if !self.clones_transfers().await {
            return self
                .lock()
                .await
                .download_file(local_path, remote_path, exists, verify, progress)
                .await;
        }
        let mut worker = self.acquire_clone().await?;
        let result = worker
            .download_file(local_path, remote_path, exists, verify, progress)
            .await;
        worker.disconnect().await;
        result
    }

    pub async fn upload_file(
        &self,
        local_path: &Path,
        remote_path: &str,
        exists: RemoteExists,
        create_remote_dir: bool,
        verify: Option<Verification<'_>>,
        progress: Option<&ProgressHandler>,
    ) -> FtpResult<TransferStatus> {
        if !self.clones_transfers().await {
            return self
                .lock()
                .await
                .upload_file(local_path, remote_path, exists, create_remote_dir, verify, progress)
                .await;
        }
        let mut worker = self.acquire_clone().await?;
        let result = worker
            .upload_file(local_path, remote_path, exists, create_remote_dir, verify, progress)
            .await;
        worker.disconnect().await;
        result
    }

    // ─── Keepalive ───────────────────────────────────────────────

    /// Spawn a task that sends NOOP whenever the session has been idle for
    /// `interval`. Failures are logged and ignored; the task ends when the
    /// session is cancelled.
    pub fn spawn_keepalive(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let session = self.session.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                // a held lock means a command is running; skip this round
                let Ok(mut guard) = session.try_lock() else {
                    continue;
                };
                if !guard.is_connected() || guard.idle_for() < interval {
                    continue;
                }
                if let Err(e) = guard.noop().await {
                    log::debug!("FTP keepalive: NOOP failed (ignored): {}", e);
                }
            }
        })
    }
}
