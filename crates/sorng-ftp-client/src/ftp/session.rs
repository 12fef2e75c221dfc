//! Stateful control session: owns the command socket and issues commands.
//!
//! Lifecycle: `connect()` → implicit TLS → greeting → AUTH TLS → USER/PASS
//! → PBSZ/PROT → FEAT → OPTS UTF8 → SYST → optional CCC → initial CWD.
//!
//! A session is driven through `&mut self`; [`crate::ftp::client::FtpClient`]
//! puts one behind a mutex so only one command/reply pair is ever in
//! flight on the socket. Clones copy settings and known capabilities but
//! open their own socket.

use crate::ftp::capabilities::{detect_features, Capabilities, ServerFamily};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::reply::{command_verb, decode_line, encode_command, loggable, FtpReply, ReplyDecoder};
use crate::ftp::tls::{default_validator, CertificateValidator, EncryptionLayer};
use crate::ftp::transport::{DirectConnector, FtpStream, SocketConnector};
use crate::ftp::types::*;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Runtime state learned while connected.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub capabilities: Capabilities,
    pub hash_algorithms: Vec<String>,
    pub server_family: ServerFamily,
    pub system_type: Option<String>,
    pub greeting: Option<String>,
    /// `None` until the first TYPE after (re)connecting.
    pub transfer_type: Option<TransferType>,
    pub working_directory: Option<String>,
    /// Secondary connection created for a single transfer.
    pub is_clone: bool,
    pub epsv_unsupported: bool,
    pub control_encrypted: bool,
    /// PROT P accepted; data connections must be wrapped in TLS.
    pub data_protected: bool,
    pub utf8: bool,
    pub last_command: Option<String>,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub(crate) stale_check_armed: bool,
}

/// One FTP control connection.
pub struct ControlSession {
    id: String,
    config: FtpConnectionConfig,
    connector: Arc<dyn SocketConnector>,
    validator: Arc<dyn CertificateValidator>,
    encryption: Option<EncryptionLayer>,
    stream: Option<BufReader<FtpStream>>,
    pub(crate) state: ConnectionState,
    cancel: CancellationToken,
    last_io: Instant,
}

impl std::fmt::Debug for ControlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSession")
            .field("id", &self.id)
            .field("target", &self.config.display_name())
            .field("connected", &self.is_connected())
            .field("state", &self.state)
            .finish()
    }
}

impl ControlSession {
    pub fn new(config: FtpConnectionConfig) -> Self {
        let validator = default_validator(config.accept_invalid_certs);
        Self {
            id: Uuid::new_v4().to_string(),
            config,
            connector: Arc::new(DirectConnector),
            validator,
            encryption: None,
            stream: None,
            state: ConnectionState::default(),
            cancel: CancellationToken::new(),
            last_io: Instant::now(),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn SocketConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn CertificateValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    // ─── Accessors ───────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Short id used in log lines.
    fn tag(&self) -> &str {
        &self.id[..8]
    }

    pub fn config(&self) -> &FtpConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn capabilities(&self) -> Capabilities {
        self.state.capabilities
    }

    pub fn has_capability(&self, cap: Capabilities) -> bool {
        self.state.capabilities.contains(cap)
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_clone(&self) -> bool {
        self.state.is_clone
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn connector(&self) -> &Arc<dyn SocketConnector> {
        &self.connector
    }

    /// Time since the last command or reply.
    pub fn idle_for(&self) -> Duration {
        self.last_io.elapsed()
    }

    pub(crate) fn check_cancelled(&self) -> FtpResult<()> {
        if self.cancel.is_cancelled() {
            Err(FtpError::cancelled())
        } else {
            Ok(())
        }
    }

    fn touch(&mut self) {
        self.last_io = Instant::now();
        self.state.last_activity = Some(Utc::now());
    }

    pub(crate) fn encryption_layer(&mut self) -> &EncryptionLayer {
        let config = &self.config;
        self.encryption
            .get_or_insert_with(|| EncryptionLayer::new(config.host.clone(), &config.tls_protocols))
    }

    pub(crate) fn validator(&self) -> Arc<dyn CertificateValidator> {
        self.validator.clone()
    }

    // ─── Connect ─────────────────────────────────────────────────

    /// Open the control connection and run the login sequence. An existing
    /// connection is closed first.
    pub async fn connect(&mut self) -> FtpResult<()> {
        self.config.validate()?;
        if self.is_connected() {
            self.disconnect().await;
        }
        self.check_cancelled()?;

        let result = self.connect_sequence().await;
        if let Err(ref e) = result {
            log::warn!("FTP {}: connect to {} failed: {}", self.tag(), self.config.display_name(), e);
            self.close_socket().await;
        }
        result
    }

    async fn connect_sequence(&mut self) -> FtpResult<()> {
        self.reset_for_connect();
        log::info!(
            "FTP {}: connecting to {}:{} ({:?}{})",
            self.tag(),
            self.config.host,
            self.config.port,
            self.config.security,
            if self.state.is_clone { ", clone" } else { "" }
        );

        let tcp = self
            .connector
            .connect(&self.config.host, self.config.port, self.config.connect_timeout())
            .await?;
        self.state.local_addr = tcp.local_addr().ok();
        self.state.peer_addr = tcp.peer_addr().ok();

        // ── Implicit FTPS: TLS from the first byte ───────────────
        let stream = if self.config.security == FtpSecurityMode::Implicit {
            let validator = self.validator.clone();
            self.encryption_layer().activate(tcp, &validator).await?
        } else {
            FtpStream::Plain(tcp)
        };
        self.state.control_encrypted = stream.is_encrypted();
        self.stream = Some(BufReader::new(stream));
        self.touch();

        // ── Greeting ─────────────────────────────────────────────
        let mut greeting = self.read_reply().await?;
        while greeting.is_preliminary() {
            greeting = self.read_reply().await?;
        }
        if !greeting.is_completion() {
            return Err(FtpError::command(
                greeting.code,
                format!("Server refused the connection: {}", greeting.message),
            ));
        }
        self.state.server_family = ServerFamily::from_greeting(&greeting.text());
        self.state.greeting = Some(greeting.text());

        // ── Explicit FTPS: AUTH TLS ──────────────────────────────
        if self.config.security == FtpSecurityMode::Explicit {
            let reply = self.execute("AUTH TLS").await?;
            if !reply.success() {
                let mut err = FtpError::tls_failed(format!("AUTH TLS rejected: {}", reply.message));
                err.code = reply.code;
                return Err(err);
            }
            self.upgrade_control_channel().await?;
        }

        self.login().await?;

        // ── Data channel protection ──────────────────────────────
        if self.state.control_encrypted && self.config.data_connection_encryption {
            self.execute_ok("PBSZ 0").await?;
            self.execute_ok("PROT P").await?;
            self.state.data_protected = true;
        }

        // ── FEAT ─────────────────────────────────────────────────
        let mut assume_capabilities = false;
        if !self.state.is_clone {
            self.state.capabilities = Capabilities::empty();
            self.state.hash_algorithms.clear();
            assume_capabilities = true;
            if self.config.check_capabilities {
                let feat = self.execute("FEAT").await?;
                if feat.success() && !feat.info_lines.is_empty() {
                    let features = detect_features(&feat.info_lines);
                    self.state.capabilities = features.capabilities;
                    self.state.hash_algorithms = features.hash_algorithms;
                    assume_capabilities = false;
                }
            }
        }

        self.negotiate_encoding().await?;

        // ── SYST ─────────────────────────────────────────────────
        if !self.state.is_clone {
            let syst = self.execute("SYST").await?;
            if syst.success() {
                self.state.server_family = self.state.server_family.refine_with_system(&syst.message);
                self.state.system_type = Some(syst.message);
            }
        }
        if assume_capabilities {
            self.state.capabilities = self.state.server_family.assumed_capabilities();
            log::debug!(
                "FTP {}: FEAT unavailable, assuming {:?} for {:?}",
                self.tag(),
                self.state.capabilities,
                self.state.server_family
            );
        }

        // ── CCC ──────────────────────────────────────────────────
        if self.config.clear_command_channel && self.state.control_encrypted {
            let reply = self.execute("CCC").await?;
            if reply.success() {
                self.downgrade_control_channel().await?;
            } else {
                log::warn!("FTP {}: CCC refused, keeping TLS: {}", self.tag(), reply);
            }
        }

        self.state.connected_at = Some(Utc::now());
        self.state.stale_check_armed = true;

        if let Some(dir) = self.config.initial_directory.clone() {
            if let Err(e) = self.set_working_directory(&dir).await {
                log::warn!("FTP {}: initial CWD {} failed: {}", self.tag(), dir, e);
            }
        }

        log::info!(
            "FTP {}: connected to {} ({:?}, tls={})",
            self.tag(),
            self.config.display_name(),
            self.state.server_family,
            self.state.control_encrypted
        );
        Ok(())
    }

    /// Clear per-connection state; clones keep what they inherited.
    fn reset_for_connect(&mut self) {
        let inherited = self.state.is_clone;
        let capabilities = self.state.capabilities;
        let hashes = std::mem::take(&mut self.state.hash_algorithms);
        let family = self.state.server_family;
        let system = self.state.system_type.take();
        let epsv_unsupported = self.state.epsv_unsupported;

        self.state = ConnectionState::default();
        self.state.is_clone = inherited;
        if inherited {
            self.state.capabilities = capabilities;
            self.state.hash_algorithms = hashes;
            self.state.server_family = family;
            self.state.system_type = system;
            self.state.epsv_unsupported = epsv_unsupported;
        }
    }

    async fn login(&mut self) -> FtpResult<()> {
        let user = self.connector.login_user(&self.config);
        let reply = self.execute(&format!("USER {}", user)).await?;
        if reply.is_intermediate() {
            let pass = format!("PASS {}", self.config.password);
            let reply = self.execute(&pass).await?;
            if !reply.is_completion() {
                return Err(FtpError::authentication(
                    reply.code,
                    format!("Login as {} failed: {}", user, reply.message),
                ));
            }
        } else if !reply.is_completion() {
            return Err(FtpError::authentication(
                reply.code,
                format!("USER {} rejected: {}", user, reply.message),
            ));
        }
        log::debug!("FTP {}: logged in as {}", self.tag(), user);
        Ok(())
    }

    async fn negotiate_encoding(&mut self) -> FtpResult<()> {
        let server_utf8 = self.has_capability(Capabilities::UTF8);
        match self.config.encoding {
            ListingEncoding::Auto if server_utf8 => self.enable_utf8().await,
            ListingEncoding::Utf8 => self.enable_utf8().await,
            ListingEncoding::Ascii if server_utf8 => {
                self.execute("OPTS UTF8 OFF").await?;
                self.state.utf8 = false;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn enable_utf8(&mut self) -> FtpResult<()> {
        let reply = self.execute("OPTS UTF8 ON").await?;
        self.state.utf8 = reply.success();
        if !reply.success() {
            log::debug!("FTP {}: OPTS UTF8 ON refused: {}", self.tag(), reply);
        }
        Ok(())
    }

    async fn upgrade_control_channel(&mut self) -> FtpResult<()> {
        let reader = self
            .stream
            .take()
            .ok_or_else(|| FtpError::not_connected("Control connection lost before TLS upgrade"))?;
        let tcp = match reader.into_inner() {
            FtpStream::Plain(tcp) => tcp,
            tls @ FtpStream::Tls(_) => {
                self.stream = Some(BufReader::new(tls));
                return Ok(());
            }
        };
        let validator = self.validator.clone();
        let stream = self.encryption_layer().activate(tcp, &validator).await?;
        self.state.control_encrypted = true;
        self.stream = Some(BufReader::new(stream));
        Ok(())
    }

    async fn downgrade_control_channel(&mut self) -> FtpResult<()> {
        let reader = self
            .stream
            .take()
            .ok_or_else(|| FtpError::not_connected("Control connection lost before CCC"))?;
        let stream = self.encryption_layer().deactivate(reader.into_inner()).await?;
        self.state.control_encrypted = false;
        self.stream = Some(BufReader::new(stream));
        Ok(())
    }

    // ─── Commands ────────────────────────────────────────────────

    /// Send one command and read its reply.
    pub async fn execute(&mut self, command: &str) -> FtpResult<FtpReply> {
        let verb = command_verb(command);
        if !self.is_connected() {
            if verb == "QUIT" {
                return Ok(FtpReply::new(200, "Connection already closed", Vec::new()));
            }
            return Err(FtpError::not_connected(format!("Cannot send {}: not connected", verb)));
        }
        self.check_cancelled()?;
        if self.config.stale_data_check && self.state.stale_check_armed {
            self.drain_stale_data().await;
        }
        if verb == "CWD" || verb == "CDUP" {
            self.state.working_directory = None;
        }
        self.send_command(command).await?;
        self.read_reply().await
    }

    /// [`execute`](Self::execute), failing on anything but 2xx/3xx.
    pub async fn execute_ok(&mut self, command: &str) -> FtpResult<FtpReply> {
        self.execute(command).await?.into_result(command)
    }

    /// Write a command line without waiting for the reply.
    pub(crate) async fn send_command(&mut self, command: &str) -> FtpResult<()> {
        let reader = self
            .stream
            .as_mut()
            .ok_or_else(|| FtpError::not_connected("Control connection is closed"))?;
        let stream = reader.get_mut();
        stream.write_all(&encode_command(command)).await?;
        stream.flush().await?;
        let shown = loggable(command).into_owned();
        log::trace!("FTP {}: >>> {}", self.tag(), shown);
        self.state.last_command = Some(shown);
        self.touch();
        Ok(())
    }

    /// Read one complete reply from the control channel.
    pub async fn read_reply(&mut self) -> FtpResult<FtpReply> {
        let limit = self.config.read_timeout();
        let reader = self
            .stream
            .as_mut()
            .ok_or_else(|| FtpError::not_connected("Control connection is closed"))?;

        let mut decoder = ReplyDecoder::new();
        let outcome = loop {
            let mut raw = Vec::new();
            let n = match timeout(limit, reader.read_until(b'\n', &mut raw)).await {
                Err(_) => {
                    break Err(FtpError::timeout(format!(
                        "No reply within {} ms",
                        limit.as_millis()
                    )))
                }
                Ok(Err(e)) => break Err(FtpError::from(e)),
                Ok(Ok(n)) => n,
            };
            if n == 0 {
                break Err(FtpError::protocol("Server closed the control connection"));
            }
            if let Some(reply) = decoder.push_line(&decode_line(&raw)) {
                break Ok(reply);
            }
        };

        match outcome {
            Ok(reply) => {
                log::trace!("FTP {}: <<< {}", self.tag(), reply);
                self.touch();
                Ok(reply)
            }
            Err(e) => {
                if e.kind == crate::ftp::error::FtpErrorKind::Protocol {
                    // Peer hung up; the socket is unusable.
                    self.stream = None;
                    self.state.stale_check_armed = false;
                }
                Err(e)
            }
        }
    }

    /// Throw away whatever is already sitting in the control channel.
    async fn drain_stale_data(&mut self) {
        let Some(reader) = self.stream.as_mut() else {
            return;
        };
        let mut stale = Vec::new();
        loop {
            let chunk = match reader.fill_buf().now_or_never() {
                Some(Ok(buf)) => buf.to_vec(),
                Some(Err(e)) => {
                    log::warn!("FTP {}: error probing for stale data: {}", &self.id[..8], e);
                    break;
                }
                None => break,
            };
            if chunk.is_empty() {
                break;
            }
            reader.consume(chunk.len());
            stale.extend_from_slice(&chunk);
        }
        if !stale.is_empty() {
            log::warn!(
                "FTP {}: discarded {} bytes of stale control data: {}",
                self.tag(),
                stale.len(),
                String::from_utf8_lossy(&stale).trim_end()
            );
        }
    }

    /// Switch representation type. No command is sent when the session is
    /// already in `ty`.
    pub async fn set_transfer_type(&mut self, ty: TransferType) -> FtpResult<()> {
        if self.state.transfer_type == Some(ty) {
            return Ok(());
        }
        self.execute_ok(ty.command()).await?;
        self.state.transfer_type = Some(ty);
        Ok(())
    }

    /// Send a keepalive NOOP.
    pub async fn noop(&mut self) -> FtpResult<FtpReply> {
        self.execute("NOOP").await
    }

    // ─── Working directory ───────────────────────────────────────

    /// Current remote directory (PWD), cached until the next CWD.
    pub async fn working_directory(&mut self) -> FtpResult<String> {
        if let Some(ref dir) = self.state.working_directory {
            return Ok(dir.clone());
        }
        let reply = self.execute_ok("PWD").await?;
        let dir = parse_pwd(&reply.message)?;
        self.state.working_directory = Some(dir.clone());
        Ok(dir)
    }

    pub async fn set_working_directory(&mut self, path: &str) -> FtpResult<()> {
        self.execute_ok(&format!("CWD {}", path)).await?;
        Ok(())
    }

    // ─── Disconnect ──────────────────────────────────────────────

    /// Close the session. QUIT failures are logged, never returned.
    pub async fn disconnect(&mut self) {
        if !self.is_connected() {
            return;
        }
        if !self.config.ungraceful_disconnect {
            match self.execute("QUIT").await {
                Ok(reply) => log::debug!("FTP {}: QUIT → {}", self.tag(), reply),
                Err(e) => log::warn!("FTP {}: error while quitting (ignored): {}", self.tag(), e),
            }
        }
        self.close_socket().await;
    }

    pub(crate) async fn close_socket(&mut self) {
        if let Some(mut reader) = self.stream.take() {
            let limit = self.config.read_timeout();
            let _ = timeout(limit, reader.get_mut().shutdown()).await;
            log::debug!("FTP {}: control connection closed", self.tag());
        }
        self.state.stale_check_armed = false;
        self.state.transfer_type = None;
        self.state.control_encrypted = false;
        self.state.data_protected = false;
    }

    // ─── Cloning ─────────────────────────────────────────────────

    /// A disconnected copy that shares settings and already-discovered
    /// capabilities. It skips FEAT/SYST when it connects.
    pub fn clone_session(&self) -> ControlSession {
        let mut child = ControlSession::new(self.config.clone())
            .with_connector(self.connector.clone())
            .with_validator(self.validator.clone())
            .with_cancellation(self.cancel.child_token());
        child.encryption = self.encryption.clone();
        child.state.is_clone = true;
        child.state.capabilities = self.state.capabilities;
        child.state.hash_algorithms = self.state.hash_algorithms.clone();
        child.state.server_family = self.state.server_family;
        child.state.system_type = self.state.system_type.clone();
        child.state.epsv_unsupported = self.state.epsv_unsupported;
        child
    }

    // ─── Completion replies ──────────────────────────────────────

    /// Read the reply that closes a data transfer, skipping answers to
    /// keepalive NOOPs sent while the transfer ran.
    pub(crate) async fn read_final_reply(&mut self, mut pending_noops: usize) -> FtpResult<FtpReply> {
        let reply = loop {
            let reply = self.read_reply().await?;
            if pending_noops > 0 && reply.code == Some(200) {
                pending_noops -= 1;
                continue;
            }
            break reply;
        };
        while pending_noops > 0 {
            match self.read_reply().await {
                Ok(_) => pending_noops -= 1,
                Err(e) => {
                    log::debug!("FTP {}: missing NOOP reply: {}", self.tag(), e);
                    break;
                }
            }
        }
        Ok(reply)
    }
}

/// Parse `257 "/some/path" is current directory` into the path.
pub(crate) fn parse_pwd(text: &str) -> FtpResult<String> {
    if let Some(start) = text.find('"') {
        if let Some(end) = text[start + 1..].rfind('"') {
            return Ok(text[start + 1..start + 1 + end].replace("\"\"", "\""));
        }
    }
    let trimmed = text.trim();
    if trimmed.starts_with('/') {
        return Ok(trimmed.split_whitespace().next().unwrap_or("/").to_string());
    }
    Err(FtpError::protocol(format!("Cannot parse PWD reply: {}", text)))
}
