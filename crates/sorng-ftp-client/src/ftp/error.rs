//! FTP-specific error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised FTP error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpError {
    pub kind: FtpErrorKind,
    pub message: String,
    /// FTP reply code that triggered the error, if any.
    pub code: Option<u16>,
    /// Follow-up failure, e.g. the reopen that failed after a broken transfer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary: Option<Box<FtpError>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FtpErrorKind {
    /// Malformed or absent reply where one was mandatory.
    Protocol,
    /// Negative reply to a command that required success.
    Command,
    /// Negative reply to USER / PASS.
    Authentication,
    /// Operation attempted without a live control socket.
    NotConnected,
    /// A configured timeout elapsed.
    Timeout,
    /// Mid-transfer failure that could not be resumed.
    ResumeFailure,
    /// Post-transfer verification failed.
    Verification,
    /// TCP / DNS resolution failure.
    ConnectionFailed,
    /// AUTH TLS refused or TLS handshake failure.
    TlsFailed,
    /// Data socket could not be established.
    DataChannelFailed,
    /// Local or socket I/O error.
    Io,
    /// Cancelled through the session's cancellation token.
    Cancelled,
    /// Config / parameter validation error.
    InvalidConfig,
}

pub type FtpResult<T> = Result<T, FtpError>;

/// Negative-reply fragments servers use to say a path does not exist.
pub const FILE_NOT_FOUND_PHRASES: &[&str] = &[
    "can't find file",
    "can't check for file existence",
    "does not exist",
    "failed to open file",
    "not found",
    "no such file",
    "cannot find the file",
    "cannot find",
    "can't get file",
    "could not get file",
    "cannot get file",
    "not a regular file",
    "file unavailable",
    "file is unavailable",
    "file not unavailable",
    "file is not available",
    "no files found",
    "no file found",
    "datei oder verzeichnis nicht gefunden",
    "can't find the path",
    "cannot find the path",
    "could not find the path",
    "file doesnot exist",
];

/// Reply fragments reporting the server saw the data socket close early.
pub const UNEXPECTED_EOF_PHRASES: &[&str] = &[
    "unexpected eof for remote file",
    "received an unexpected eof",
    "unexpected eof",
];

/// Reply fragments MKD uses when the directory is already there.
pub const DIRECTORY_EXISTS_PHRASES: &[&str] = &[
    "exists",
    "file exists",
    "already exists",
    "directory already exists",
];

/// Case-insensitive substring match against a phrase table.
pub fn matches_phrase(text: &str, phrases: &[&str]) -> bool {
    let lower = text.to_lowercase();
    phrases.iter().any(|p| lower.contains(p))
}

// ── Construction helpers ─────────────────────────────────────────────

impl FtpError {
    pub fn new(kind: FtpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
            secondary: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_secondary(mut self, secondary: FtpError) -> Self {
        self.secondary = Some(Box::new(secondary));
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Protocol, msg)
    }

    pub fn command(code: Option<u16>, msg: impl Into<String>) -> Self {
        let err = Self::new(FtpErrorKind::Command, msg);
        match code {
            Some(c) => err.with_code(c),
            None => err,
        }
    }

    pub fn authentication(code: Option<u16>, msg: impl Into<String>) -> Self {
        let err = Self::new(FtpErrorKind::Authentication, msg);
        match code {
            Some(c) => err.with_code(c),
            None => err,
        }
    }

    pub fn not_connected(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::NotConnected, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Timeout, msg)
    }

    /// A broken transfer that could not be picked up again. `secondary`
    /// is the failure of the reopen attempt, when there was one.
    pub fn resume_failure(original: FtpError, secondary: Option<FtpError>) -> Self {
        let mut err = Self::new(
            FtpErrorKind::ResumeFailure,
            format!("Transfer could not be resumed: {}", original.message),
        );
        err.code = original.code;
        err.secondary = secondary.map(Box::new);
        err
    }

    pub fn verification(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Verification, msg)
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ConnectionFailed, msg)
    }

    pub fn tls_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::TlsFailed, msg)
    }

    pub fn data_channel(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::DataChannelFailed, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Io, msg)
    }

    pub fn cancelled() -> Self {
        Self::new(FtpErrorKind::Cancelled, "Operation cancelled")
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::InvalidConfig, msg)
    }

    /// A negative reply to a command. Login rejections are built by the
    /// session as `Authentication` instead.
    pub fn from_reply(code: u16, text: &str) -> Self {
        Self::new(FtpErrorKind::Command, text).with_code(code)
    }

    /// Whether this is a negative server reply that means "no such path".
    pub fn is_file_not_found(&self) -> bool {
        self.kind == FtpErrorKind::Command
            && self.code.map_or(false, |c| c >= 400)
            && matches_phrase(&self.message, FILE_NOT_FOUND_PHRASES)
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == FtpErrorKind::Cancelled
    }
}

impl fmt::Display for FtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "[FTP {:?} {}] {}", self.kind, code, self.message)?;
        } else {
            write!(f, "[FTP {:?}] {}", self.kind, self.message)?;
        }
        if let Some(ref secondary) = self.secondary {
            write!(f, " (then: {})", secondary)?;
        }
        Ok(())
    }
}

impl std::error::Error for FtpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.secondary
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for FtpError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            Self::timeout(format!("I/O timeout: {}", e))
        } else {
            Self::io(e.to_string())
        }
    }
}

impl From<rustls::Error> for FtpError {
    fn from(e: rustls::Error) -> Self {
        Self::tls_failed(e.to_string())
    }
}

impl From<FtpError> for String {
    fn from(e: FtpError) -> String {
        e.to_string()
    }
}
