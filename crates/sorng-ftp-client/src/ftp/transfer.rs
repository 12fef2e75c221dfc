//! Chunked transfer engine.
//!
//! `download_stream` / `upload_stream` move one file over a data channel
//! in rate-limited chunks. A data channel that breaks mid-transfer with a
//! resumable socket error is reopened at the last confirmed offset with
//! `REST`; a second failure at the same offset gives up.

use crate::ftp::data_channel::DataChannel;
use crate::ftp::directory::{is_root_directory, parent_directory};
use crate::ftp::error::{matches_phrase, FtpError, FtpResult, UNEXPECTED_EOF_PHRASES};
use crate::ftp::session::ControlSession;
use crate::ftp::throttle::{effective_chunk_size, RateLimiter};
use crate::ftp::types::*;
use std::io::{self, SeekFrom};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

// ─── Progress ────────────────────────────────────────────────────────

/// Progress sink plus the context stamped on every snapshot.
#[derive(Clone)]
pub struct ProgressHandler {
    callback: ProgressCallback,
    local_path: Option<String>,
    meta: Option<MetaProgress>,
}

impl std::fmt::Debug for ProgressHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressHandler")
            .field("local_path", &self.local_path)
            .field("meta", &self.meta)
            .finish()
    }
}

impl ProgressHandler {
    pub fn new(callback: impl Fn(&TransferProgress) + Send + Sync + 'static) -> Self {
        Self {
            callback: std::sync::Arc::new(callback),
            local_path: None,
            meta: None,
        }
    }

    pub fn from_callback(callback: ProgressCallback) -> Self {
        Self {
            callback,
            local_path: None,
            meta: None,
        }
    }

    pub fn with_local_path(mut self, path: impl Into<String>) -> Self {
        self.local_path = Some(path.into());
        self
    }

    pub fn with_meta(mut self, meta: MetaProgress) -> Self {
        self.meta = Some(meta);
        self
    }

    /// `position` is the file offset, `moved` the bytes moved by this call
    /// (the rate excludes a restart offset).
    pub(crate) fn report(
        &self,
        direction: TransferDirection,
        remote_path: &str,
        position: u64,
        total: u64,
        moved: u64,
        elapsed: Duration,
    ) {
        let mut progress = TransferProgress::compute(direction, remote_path, position, total, elapsed);
        let secs = elapsed.as_secs_f64();
        progress.speed_bps = if secs > 0.0 { moved as f64 / secs } else { 0.0 };
        progress.eta = if total > position && progress.speed_bps > 0.0 {
            Some(Duration::from_secs_f64((total - position) as f64 / progress.speed_bps))
        } else if total > 0 {
            Some(Duration::ZERO)
        } else {
            None
        };
        self.emit(progress);
    }

    /// Final 100 % snapshot.
    pub(crate) fn complete(&self, direction: TransferDirection, remote_path: &str, position: u64, elapsed: Duration) {
        let mut progress = TransferProgress::compute(direction, remote_path, position, position, elapsed);
        progress.percent = 100.0;
        progress.eta = Some(Duration::ZERO);
        self.emit(progress);
    }

    fn emit(&self, mut progress: TransferProgress) {
        progress.local_path = self.local_path.clone();
        progress.meta = self.meta;
        (self.callback)(&progress);
    }
}

// ─── Resume policy ───────────────────────────────────────────────────

/// Socket errors that mean "the server dropped the data connection" and
/// are worth a `REST` + reopen.
pub fn is_resume_allowed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    ) || matches_phrase(&err.to_string(), UNEXPECTED_EOF_PHRASES)
}

fn unresumable(err: io::Error) -> FtpError {
    if err.kind() == io::ErrorKind::TimedOut {
        FtpError::from(err)
    } else {
        FtpError::resume_failure(FtpError::from(err), None)
    }
}

/// Position the local stream starts from for an append-style upload.
pub fn append_local_position(mode: RemoteExists, remote_position: u64) -> u64 {
    match mode {
        RemoteExists::Resume | RemoteExists::ResumeNoCheck => remote_position,
        _ => 0,
    }
}

impl ControlSession {
    /// Close a broken channel and reopen it at `offset`.
    ///
    /// Fails when `err` is not resumable or the previous resume happened at
    /// the same offset (no progress since). A failed reopen carries both
    /// errors.
    async fn reopen_after_failure(
        &mut self,
        channel: DataChannel,
        command: &str,
        offset: u64,
        length: Option<u64>,
        err: io::Error,
        resumed_at: &mut Option<u64>,
        pending_noops: usize,
    ) -> FtpResult<DataChannel> {
        channel.abandon(self, pending_noops).await;
        if !is_resume_allowed(&err) || *resumed_at == Some(offset) {
            return Err(unresumable(err));
        }
        log::warn!("FTP: data connection broke at byte {} ({}), resuming", offset, err);
        *resumed_at = Some(offset);
        self.open_transfer_channel(command, offset, length)
            .await
            .map_err(move |reopen| FtpError::resume_failure(FtpError::from(err), Some(reopen)))
    }

    // ─── Download ────────────────────────────────────────────────

    /// Download `remote_path` into `sink`, starting at `restart`.
    ///
    /// Returns `false` when the file does not exist or the server did not
    /// confirm the transfer after the bytes arrived.
    pub async fn download_stream<W>(
        &mut self,
        sink: &mut W,
        remote_path: &str,
        restart: u64,
        length: LengthHint,
        progress: Option<&ProgressHandler>,
    ) -> FtpResult<bool>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        match self.download_inner(sink, remote_path, restart, length, progress).await {
            Err(e) if e.is_file_not_found() => {
                log::warn!("FTP: {} does not exist: {}", remote_path, e);
                Ok(false)
            }
            other => other,
        }
    }

    async fn download_inner<W>(
        &mut self,
        sink: &mut W,
        remote_path: &str,
        restart: u64,
        length: LengthHint,
        progress: Option<&ProgressHandler>,
    ) -> FtpResult<bool>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let file_len = match length {
            LengthHint::Known(n) => Some(n),
            LengthHint::Unknown => self.file_size(remote_path).await?,
            LengthHint::Irrelevant => None,
        };
        let download_type = self.config().download_type;
        self.set_transfer_type(download_type).await?;

        let total = file_len.unwrap_or(0);
        let read_to_end = total == 0
            || download_type == TransferType::Ascii
            || self.state.server_family.always_read_to_end();

        let rate = self.config().download_rate_limit;
        let chunk = effective_chunk_size(self.config().transfer_chunk_size, rate);
        let noop_interval = Duration::from_millis(self.config().noop_interval_ms);
        let command = format!("RETR {}", remote_path);

        let mut buf = vec![0u8; chunk];
        let mut limiter = RateLimiter::new(rate);
        let started = Instant::now();
        let mut offset = restart;
        let mut resumed_at: Option<u64> = None;
        let mut pending_noops = 0usize;
        let mut last_noop = Instant::now();

        let mut channel = self.open_transfer_channel(&command, offset, file_len).await?;
        log::debug!(
            "FTP: downloading {} from {} ({} bytes, chunk {}, {})",
            remote_path,
            offset,
            total,
            chunk,
            if read_to_end { "until EOF" } else { "exact length" }
        );

        loop {
            let failure = loop {
                if let Err(e) = self.check_cancelled() {
                    channel.abandon(self, pending_noops).await;
                    return Err(e);
                }
                if !read_to_end && offset >= total {
                    break None;
                }
                let want = if read_to_end {
                    buf.len()
                } else {
                    (total - offset).min(buf.len() as u64) as usize
                };
                let n = match channel.read_chunk(&mut buf[..want]).await {
                    Ok(0) if read_to_end => break None,
                    Ok(0) => {
                        break Some(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("Unexpected EOF for remote file {} [{}/{} bytes read]", remote_path, offset, total),
                        ))
                    }
                    Ok(n) => n,
                    // reading past the end often times out instead of EOF
                    Err(e) if e.kind() == io::ErrorKind::TimedOut && total > 0 && offset >= total => {
                        log::debug!("FTP: read timeout at end of {}, treating as EOF", remote_path);
                        break None;
                    }
                    Err(e) => break Some(e),
                };

                if let Err(e) = sink.write_all(&buf[..n]).await {
                    channel.abandon(self, pending_noops).await;
                    return Err(FtpError::io(format!("Writing downloaded data failed: {}", e)));
                }
                offset += n as u64;
                if let Some(p) = progress {
                    p.report(TransferDirection::Download, remote_path, offset, total, offset - restart, started.elapsed());
                }

                if !noop_interval.is_zero() && !channel.is_cloned() && last_noop.elapsed() >= noop_interval {
                    match self.send_command("NOOP").await {
                        Ok(()) => pending_noops += 1,
                        Err(e) => log::debug!("FTP: keepalive NOOP failed: {}", e),
                    }
                    last_noop = Instant::now();
                }
                limiter.consume(n).await;
            };

            if let Some(err) = failure {
                channel = self
                    .reopen_after_failure(channel, &command, offset, file_len, err, &mut resumed_at, pending_noops)
                    .await?;
                pending_noops = 0;
                limiter.reset();
                continue;
            }

            if let Err(e) = sink.flush().await {
                channel.abandon(self, pending_noops).await;
                return Err(FtpError::io(format!("Flushing downloaded data failed: {}", e)));
            }
            if let Some(p) = progress {
                p.complete(TransferDirection::Download, remote_path, offset, started.elapsed());
            }

            match channel.finish(self, pending_noops).await {
                Ok(reply) if reply.is_negative() => {
                    if matches_phrase(&reply.message, UNEXPECTED_EOF_PHRASES) && resumed_at != Some(offset) {
                        log::warn!("FTP: server reported {} at byte {}, resuming", reply, offset);
                        resumed_at = Some(offset);
                        channel = self
                            .open_transfer_channel(&command, offset, file_len)
                            .await
                            .map_err(|e| FtpError::resume_failure(reply.to_error(&command), Some(e)))?;
                        pending_noops = 0;
                        limiter.reset();
                        continue;
                    }
                    log::warn!("FTP: download of {} not confirmed: {}", remote_path, reply);
                    return Ok(false);
                }
                Ok(reply) => log::debug!("FTP: download of {} finished: {}", remote_path, reply),
                Err(e) => log::warn!("FTP: no reply after downloading {} (ignored): {}", remote_path, e),
            }
            log::info!(
                "FTP: downloaded {} ({} bytes in {:?})",
                remote_path,
                offset - restart,
                started.elapsed()
            );
            return Ok(true);
        }
    }

    // ─── Upload ──────────────────────────────────────────────────

    /// Upload `source` to `remote_path`, applying the existence policy
    /// first. The source is read from the position the policy implies.
    pub async fn upload_stream<R>(
        &mut self,
        source: &mut R,
        remote_path: &str,
        exists: RemoteExists,
        create_remote_dir: bool,
        progress: Option<&ProgressHandler>,
    ) -> FtpResult<TransferStatus>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send + ?Sized,
    {
        let local_len = source.seek(SeekFrom::End(0)).await?;
        let mut local_pos = 0u64;
        let mut remote_pos = 0u64;
        let mut remote_len: Option<u64> = None;
        let mut remote_exists = false;

        match exists {
            RemoteExists::NoCheck => {}
            RemoteExists::ResumeNoCheck | RemoteExists::AddToEndNoCheck => {
                remote_len = self.file_size(remote_path).await?;
                remote_pos = remote_len.unwrap_or(0);
                local_pos = append_local_position(exists, remote_pos);
            }
            RemoteExists::Skip | RemoteExists::Overwrite | RemoteExists::Resume | RemoteExists::AddToEnd => {
                remote_exists = self.file_exists(remote_path).await?;
                if remote_exists {
                    match exists {
                        RemoteExists::Skip => {
                            log::info!("FTP: skipping upload, {} already exists", remote_path);
                            if let Some(p) = progress {
                                p.complete(TransferDirection::Upload, remote_path, 0, Duration::ZERO);
                            }
                            return Ok(TransferStatus::Skipped);
                        }
                        RemoteExists::Overwrite => self.delete_file(remote_path).await?,
                        _ => {
                            remote_len = self.file_size(remote_path).await?;
                            remote_pos = remote_len.unwrap_or(0);
                            local_pos = append_local_position(exists, remote_pos);
                        }
                    }
                }
            }
        }

        if create_remote_dir && !remote_exists {
            let dir = parent_directory(remote_path);
            if !is_root_directory(&dir) && !self.directory_exists(&dir).await? {
                self.create_directory(&dir, true).await?;
            }
        }

        if matches!(exists, RemoteExists::Resume | RemoteExists::ResumeNoCheck) && remote_len == Some(local_len) {
            log::info!("FTP: skipping upload, {} is already complete", remote_path);
            if let Some(p) = progress {
                p.complete(TransferDirection::Upload, remote_path, local_len, Duration::ZERO);
            }
            return Ok(TransferStatus::Skipped);
        }

        source.seek(SeekFrom::Start(local_pos)).await?;
        let append = remote_pos > 0
            || matches!(exists, RemoteExists::ResumeNoCheck | RemoteExists::AddToEndNoCheck);
        let desired_len = if matches!(exists, RemoteExists::AddToEnd | RemoteExists::AddToEndNoCheck) {
            remote_len.unwrap_or(0) + local_len
        } else {
            local_len
        };

        let upload_type = self.config().upload_type;
        self.set_transfer_type(upload_type).await?;
        let rate = self.config().upload_rate_limit;
        let chunk = effective_chunk_size(self.config().transfer_chunk_size, rate);
        let command = format!("{} {}", if append { "APPE" } else { "STOR" }, remote_path);
        let resume_command = format!("STOR {}", remote_path);
        let noop_interval = Duration::from_millis(self.config().noop_interval_ms);

        let mut buf = vec![0u8; chunk];
        let mut limiter = RateLimiter::new(rate);
        let started = Instant::now();
        let first_pos = local_pos;
        let mut resumed_at: Option<u64> = None;
        let mut pending_noops = 0usize;
        let mut last_noop = Instant::now();

        let mut channel = self.open_transfer_channel(&command, 0, Some(desired_len)).await?;
        channel.position = remote_pos;
        log::debug!(
            "FTP: uploading {} bytes to {} from {} ({}), chunk {}",
            local_len - local_pos,
            remote_path,
            local_pos,
            if append { "append" } else { "write" },
            chunk
        );

        loop {
            if let Err(e) = self.check_cancelled() {
                channel.abandon(self, pending_noops).await;
                return Err(e);
            }
            let n = match source.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    channel.abandon(self, pending_noops).await;
                    return Err(FtpError::io(format!("Reading local data failed: {}", e)));
                }
            };
            if n == 0 {
                break;
            }
            match channel.write_chunk(&buf[..n]).await {
                Ok(()) => {
                    local_pos += n as u64;
                    remote_pos += n as u64;
                    if let Some(p) = progress {
                        p.report(
                            TransferDirection::Upload,
                            remote_path,
                            local_pos,
                            local_len,
                            local_pos - first_pos,
                            started.elapsed(),
                        );
                    }
                    if !noop_interval.is_zero() && !channel.is_cloned() && last_noop.elapsed() >= noop_interval {
                        match self.send_command("NOOP").await {
                            Ok(()) => pending_noops += 1,
                            Err(e) => log::debug!("FTP: keepalive NOOP failed: {}", e),
                        }
                        last_noop = Instant::now();
                    }
                    limiter.consume(n).await;
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut && local_len > 0 && local_pos >= local_len => break,
                Err(e) => {
                    channel = self
                        .reopen_after_failure(
                            channel,
                            &resume_command,
                            remote_pos,
                            Some(desired_len),
                            e,
                            &mut resumed_at,
                            pending_noops,
                        )
                        .await?;
                    pending_noops = 0;
                    channel.position = remote_pos;
                    source.seek(SeekFrom::Start(local_pos)).await?;
                    limiter.reset();
                }
            }
        }

        if let Some(p) = progress {
            p.complete(TransferDirection::Upload, remote_path, local_pos, started.elapsed());
        }
        match channel.finish(self, pending_noops).await {
            Ok(reply) if reply.is_negative() => {
                log::warn!("FTP: upload of {} not confirmed: {}", remote_path, reply);
                return Ok(TransferStatus::Failed);
            }
            Ok(reply) => log::debug!("FTP: upload of {} finished: {}", remote_path, reply),
            Err(e) => log::warn!("FTP: no reply after uploading {} (ignored): {}", remote_path, e),
        }
        log::info!(
            "FTP: uploaded {} ({} bytes in {:?})",
            remote_path,
            local_pos - first_pos,
            started.elapsed()
        );
        Ok(TransferStatus::Success)
    }
}
