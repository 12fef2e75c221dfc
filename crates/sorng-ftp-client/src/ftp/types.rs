//! Shared types for the FTP crate.

use crate::ftp::error::{FtpError, FtpResult};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

// ─── Connection / Session ────────────────────────────────────────────

/// Security mode for the control channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum FtpSecurityMode {
    /// Plain-text FTP (port 21).
    #[default]
    None,
    /// Explicit FTPS: starts plain then upgrades via AUTH TLS (port 21).
    Explicit,
    /// Implicit FTPS: TLS from the first byte (port 990).
    Implicit,
}

impl FtpSecurityMode {
    /// Well-known control port for this mode.
    pub fn default_port(self) -> u16 {
        match self {
            Self::Implicit => 990,
            _ => 21,
        }
    }
}

/// TLS protocol versions the client is willing to negotiate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum FtpTlsProtocol {
    Tls12,
    Tls13,
}

impl FtpTlsProtocol {
    pub fn all() -> Vec<Self> {
        vec![Self::Tls13, Self::Tls12]
    }

    pub(crate) fn rustls_version(self) -> &'static rustls::SupportedProtocolVersion {
        match self {
            Self::Tls12 => &rustls::version::TLS12,
            Self::Tls13 => &rustls::version::TLS13,
        }
    }
}

/// Representation type (RFC 959 TYPE command).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TransferType {
    Ascii,
    #[default]
    Binary,
}

impl TransferType {
    pub fn command(self) -> &'static str {
        match self {
            Self::Ascii => "TYPE A",
            Self::Binary => "TYPE I",
        }
    }
}

/// Addressing strategy used to open data connections.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum DataChannelType {
    /// EPSV, falling back to PASV on IPv4 when EPSV is refused.
    #[default]
    AutoPassive,
    /// EPRT, falling back to PORT on IPv4 when EPRT is refused.
    AutoActive,
    Epsv,
    Pasv,
    /// PASV but always connecting to the control host.
    PasvEx,
    Eprt,
    Port,
}

impl DataChannelType {
    pub fn is_passive(self) -> bool {
        matches!(self, Self::AutoPassive | Self::Epsv | Self::Pasv | Self::PasvEx)
    }

    /// Concrete strategies tried by the auto-detect sweep.
    pub fn sweep_order() -> [Self; 5] {
        [Self::Eprt, Self::Epsv, Self::Pasv, Self::PasvEx, Self::Port]
    }
}

/// Encoding used for paths and listings on the control channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum ListingEncoding {
    /// UTF-8 when the server advertises it.
    #[default]
    Auto,
    Utf8,
    Ascii,
}

/// Configuration for a single FTP connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpConnectionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default)]
    pub security: FtpSecurityMode,
    #[serde(default = "FtpTlsProtocol::all")]
    pub tls_protocols: Vec<FtpTlsProtocol>,
    /// Accept self-signed / untrusted certificates.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default)]
    pub data_channel_type: DataChannelType,
    /// PASV/EPSV re-rolls allowed while the server keeps picking blocked ports.
    #[serde(default = "default_passive_attempts")]
    pub passive_max_attempts: u32,
    #[serde(default)]
    pub passive_blocked_ports: Vec<u16>,
    /// Local ports tried in order for active mode (empty = ephemeral).
    #[serde(default)]
    pub active_ports: Vec<u16>,
    /// Address announced in PORT/EPRT instead of the local socket address.
    #[serde(default)]
    pub active_external_address: Option<String>,
    /// Wrap data connections in TLS when the control channel is encrypted.
    #[serde(default = "default_true")]
    pub data_connection_encryption: bool,
    /// Downgrade the control channel with CCC after login.
    #[serde(default)]
    pub clear_command_channel: bool,
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub data_connect_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub data_read_timeout_ms: u64,
    #[serde(default = "default_chunk")]
    pub transfer_chunk_size: usize,
    /// Upload rate limit in bytes per second (0 = unlimited).
    #[serde(default)]
    pub upload_rate_limit: u64,
    /// Download rate limit in bytes per second (0 = unlimited).
    #[serde(default)]
    pub download_rate_limit: u64,
    #[serde(default)]
    pub upload_type: TransferType,
    #[serde(default)]
    pub download_type: TransferType,
    /// Attempts made by the file-level wrappers when verification retries.
    #[serde(default = "default_retries")]
    pub retry_attempts: u32,
    /// Open every data channel on a freshly cloned control connection.
    #[serde(default)]
    pub clone_data_connections: bool,
    /// Keepalive NOOP interval during transfers (0 = disabled).
    #[serde(default)]
    pub noop_interval_ms: u64,
    #[serde(default)]
    pub encoding: ListingEncoding,
    /// Drain and log unread control-channel bytes before each command.
    #[serde(default = "default_true")]
    pub stale_data_check: bool,
    /// Close the socket without sending QUIT.
    #[serde(default)]
    pub ungraceful_disconnect: bool,
    /// Query FEAT after login.
    #[serde(default = "default_true")]
    pub check_capabilities: bool,
    /// Initial remote directory to CWD into after login.
    #[serde(default)]
    pub initial_directory: Option<String>,
    /// Friendly label used in log lines.
    #[serde(default)]
    pub label: Option<String>,
}

fn default_port() -> u16 {
    21
}
fn default_username() -> String {
    "anonymous".into()
}
fn default_password() -> String {
    "anonymous@".into()
}
fn default_passive_attempts() -> u32 {
    100
}
fn default_timeout_ms() -> u64 {
    15_000
}
fn default_chunk() -> usize {
    65_536
}
fn default_retries() -> u32 {
    3
}
fn default_true() -> bool {
    true
}

impl Default for FtpConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: default_username(),
            password: default_password(),
            security: FtpSecurityMode::None,
            tls_protocols: FtpTlsProtocol::all(),
            accept_invalid_certs: false,
            data_channel_type: DataChannelType::AutoPassive,
            passive_max_attempts: default_passive_attempts(),
            passive_blocked_ports: Vec::new(),
            active_ports: Vec::new(),
            active_external_address: None,
            data_connection_encryption: true,
            clear_command_channel: false,
            connect_timeout_ms: default_timeout_ms(),
            read_timeout_ms: default_timeout_ms(),
            data_connect_timeout_ms: default_timeout_ms(),
            data_read_timeout_ms: default_timeout_ms(),
            transfer_chunk_size: default_chunk(),
            upload_rate_limit: 0,
            download_rate_limit: 0,
            upload_type: TransferType::Binary,
            download_type: TransferType::Binary,
            retry_attempts: default_retries(),
            clone_data_connections: false,
            noop_interval_ms: 0,
            encoding: ListingEncoding::Auto,
            stale_data_check: true,
            ungraceful_disconnect: false,
            check_capabilities: true,
            initial_directory: None,
            label: None,
        }
    }
}

impl FtpConnectionConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    /// Build a config from `ftp://`, `ftps://` (implicit) or `ftpes://`
    /// (explicit) URLs. The path, if any, becomes the initial directory.
    pub fn from_url(raw: &str) -> FtpResult<Self> {
        let parsed = Url::parse(raw)
            .map_err(|e| FtpError::invalid_config(format!("Invalid FTP URL '{}': {}", raw, e)))?;
        let security = match parsed.scheme() {
            "ftp" => FtpSecurityMode::None,
            "ftps" => FtpSecurityMode::Implicit,
            "ftpes" => FtpSecurityMode::Explicit,
            other => {
                return Err(FtpError::invalid_config(format!(
                    "Unsupported URL scheme '{}'",
                    other
                )))
            }
        };
        let host = parsed
            .host_str()
            .ok_or_else(|| FtpError::invalid_config(format!("URL '{}' has no host", raw)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let mut config = Self {
            host,
            port: parsed.port().unwrap_or_else(|| security.default_port()),
            security,
            ..Default::default()
        };
        if !parsed.username().is_empty() {
            config.username = percent_decode_str(parsed.username()).decode_utf8_lossy().into_owned();
            config.password = parsed
                .password()
                .map(|p| percent_decode_str(p).decode_utf8_lossy().into_owned())
                .unwrap_or_default();
        }
        let path = percent_decode_str(parsed.path()).decode_utf8_lossy().into_owned();
        if !path.is_empty() && path != "/" {
            config.initial_directory = Some(path);
        }
        Ok(config)
    }

    /// Reject settings the session cannot work with.
    pub fn validate(&self) -> FtpResult<()> {
        if self.host.trim().is_empty() {
            return Err(FtpError::invalid_config("Host must not be empty"));
        }
        if self.transfer_chunk_size == 0 {
            return Err(FtpError::invalid_config("Transfer chunk size must be positive"));
        }
        if self.passive_max_attempts == 0 {
            return Err(FtpError::invalid_config("Passive max attempts must be positive"));
        }
        if self.security != FtpSecurityMode::None && self.tls_protocols.is_empty() {
            return Err(FtpError::invalid_config("No TLS protocol versions enabled"));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn data_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.data_connect_timeout_ms)
    }

    pub fn data_read_timeout(&self) -> Duration {
        Duration::from_millis(self.data_read_timeout_ms)
    }

    /// Name used in log lines.
    pub fn display_name(&self) -> String {
        match self.label {
            Some(ref label) => label.clone(),
            None => format!("{}@{}:{}", self.username, self.host, self.port),
        }
    }
}

// ─── Session Profile ─────────────────────────────────────────────────

/// Reproducible subset of a connection config, as found by auto-detection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionProfile {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub security: FtpSecurityMode,
    pub tls_protocols: Vec<FtpTlsProtocol>,
    pub data_channel_type: DataChannelType,
    pub encoding: ListingEncoding,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
}

impl SessionProfile {
    pub fn from_config(config: &FtpConnectionConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            password: config.password.clone(),
            security: config.security,
            tls_protocols: config.tls_protocols.clone(),
            data_channel_type: config.data_channel_type,
            encoding: config.encoding,
            connect_timeout_ms: config.connect_timeout_ms,
            read_timeout_ms: config.read_timeout_ms,
        }
    }

    /// Overlay this profile onto an existing config.
    pub fn apply_to(&self, config: &mut FtpConnectionConfig) {
        config.host = self.host.clone();
        config.port = self.port;
        config.username = self.username.clone();
        config.password = self.password.clone();
        config.security = self.security;
        config.tls_protocols = self.tls_protocols.clone();
        config.data_channel_type = self.data_channel_type;
        config.encoding = self.encoding;
        config.connect_timeout_ms = self.connect_timeout_ms;
        config.read_timeout_ms = self.read_timeout_ms;
    }

    pub fn to_config(&self) -> FtpConnectionConfig {
        let mut config = FtpConnectionConfig::default();
        self.apply_to(&mut config);
        config
    }

    /// Stored form, so a detected profile can skip the next sweep.
    pub fn to_json(&self) -> FtpResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| FtpError::invalid_config(format!("Cannot serialize profile: {}", e)))
    }

    pub fn from_json(json: &str) -> FtpResult<Self> {
        serde_json::from_str(json).map_err(|e| FtpError::invalid_config(format!("Invalid profile: {}", e)))
    }
}

// ─── Listing ─────────────────────────────────────────────────────────

/// Command used to retrieve a raw directory listing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ListingCommand {
    Mlsd,
    List,
    ListAll,
    ListRecursive,
    Nlst,
}

impl ListingCommand {
    pub fn verb(self) -> &'static str {
        match self {
            Self::Mlsd => "MLSD",
            Self::List => "LIST",
            Self::ListAll => "LIST -a",
            Self::ListRecursive => "LIST -R",
            Self::Nlst => "NLST",
        }
    }
}

// ─── Transfer ────────────────────────────────────────────────────────

/// Direction of a file transfer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// What the caller knows about the remote file's length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthHint {
    /// Ask the server with SIZE.
    Unknown,
    Known(u64),
    /// Don't bother; read until the server closes the channel.
    Irrelevant,
}

/// Outcome of a file-level transfer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    Success,
    Failed,
    Skipped,
}

impl TransferStatus {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Policy when the local target of a download already exists.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum LocalExists {
    /// Continue from the local file's length.
    Resume,
    Skip,
    #[default]
    Overwrite,
}

/// Policy when the remote target of an upload already exists.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum RemoteExists {
    /// Write without checking; STOR truncates.
    NoCheck,
    /// Resume from the remote length without checking existence.
    ResumeNoCheck,
    /// Append without checking existence.
    AddToEndNoCheck,
    Skip,
    /// Delete the remote file first.
    #[default]
    Overwrite,
    /// Continue from the remote file's length.
    Resume,
    /// Append the whole local file after the remote content.
    AddToEnd,
}

/// Position in a batch, forwarded untouched to progress callbacks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetaProgress {
    pub index: usize,
    pub count: usize,
}

/// Live progress snapshot for a single transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub direction: TransferDirection,
    pub local_path: Option<String>,
    pub remote_path: String,
    pub transferred_bytes: u64,
    /// Expected length; 0 when unknown.
    pub total_bytes: u64,
    /// Percentage complete, or -1 when the length is unknown.
    pub percent: f64,
    pub speed_bps: f64,
    pub elapsed: Duration,
    pub eta: Option<Duration>,
    pub meta: Option<MetaProgress>,
}

impl TransferProgress {
    pub fn compute(
        direction: TransferDirection,
        remote_path: &str,
        transferred_bytes: u64,
        total_bytes: u64,
        elapsed: Duration,
    ) -> Self {
        let secs = elapsed.as_secs_f64();
        let speed_bps = if secs > 0.0 {
            transferred_bytes as f64 / secs
        } else {
            0.0
        };
        let percent = if total_bytes > 0 {
            (transferred_bytes as f64 / total_bytes as f64 * 100.0).min(100.0)
        } else {
            -1.0
        };
        let eta = if total_bytes > transferred_bytes && speed_bps > 0.0 {
            Some(Duration::from_secs_f64(
                (total_bytes - transferred_bytes) as f64 / speed_bps,
            ))
        } else if total_bytes > 0 {
            Some(Duration::ZERO)
        } else {
            None
        };
        Self {
            direction,
            local_path: None,
            remote_path: remote_path.to_string(),
            transferred_bytes,
            total_bytes,
            percent,
            speed_bps,
            elapsed,
            eta,
            meta: None,
        }
    }
}

/// Progress sink invoked after each chunk and once on completion.
pub type ProgressCallback = Arc<dyn Fn(&TransferProgress) + Send + Sync>;
