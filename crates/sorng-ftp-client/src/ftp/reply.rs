//! Control-channel codec (RFC 959 §4.2).
//!
//! Encodes outgoing command lines and folds incoming reply lines into
//! [`FtpReply`] values. The codec is sans-IO: the session feeds it one
//! decoded line at a time and gets a reply back once a terminating
//! `NNN text` line arrives. Lines that don't match the grammar are kept
//! verbatim as info lines; decoding never fails.

use crate::ftp::error::FtpError;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

lazy_static! {
    /// A line that terminates a reply: three digits, then a space and the
    /// message. A bare three-digit line is accepted as well.
    static ref REPLY_LINE_RE: Regex = Regex::new(r"^(?P<code>\d{3})(?: (?P<message>.*))?$").unwrap();
}

/// Reply class, from the first digit of the code.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ReplyKind {
    PositivePreliminary,
    PositiveCompletion,
    PositiveIntermediate,
    TransientNegative,
    PermanentNegative,
}

impl ReplyKind {
    pub fn from_code(code: u16) -> Option<Self> {
        match code / 100 {
            1 => Some(Self::PositivePreliminary),
            2 => Some(Self::PositiveCompletion),
            3 => Some(Self::PositiveIntermediate),
            4 => Some(Self::TransientNegative),
            5 => Some(Self::PermanentNegative),
            _ => None,
        }
    }
}

/// One complete server reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FtpReply {
    pub code: Option<u16>,
    pub message: String,
    /// Continuation lines preceding the terminator, in wire order.
    pub info_lines: Vec<String>,
    pub kind: Option<ReplyKind>,
}

impl FtpReply {
    pub fn new(code: u16, message: impl Into<String>, info_lines: Vec<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
            info_lines,
            kind: ReplyKind::from_code(code),
        }
    }

    /// 2xx or 3xx.
    pub fn success(&self) -> bool {
        matches!(
            self.kind,
            Some(ReplyKind::PositiveCompletion) | Some(ReplyKind::PositiveIntermediate)
        )
    }

    pub fn is_preliminary(&self) -> bool {
        self.kind == Some(ReplyKind::PositivePreliminary)
    }

    pub fn is_completion(&self) -> bool {
        self.kind == Some(ReplyKind::PositiveCompletion)
    }

    pub fn is_intermediate(&self) -> bool {
        self.kind == Some(ReplyKind::PositiveIntermediate)
    }

    /// 4xx or 5xx.
    pub fn is_negative(&self) -> bool {
        matches!(
            self.kind,
            Some(ReplyKind::TransientNegative) | Some(ReplyKind::PermanentNegative)
        )
    }

    pub fn is_permanent_negative(&self) -> bool {
        self.kind == Some(ReplyKind::PermanentNegative)
    }

    /// Info lines followed by the message, newline-joined.
    pub fn text(&self) -> String {
        if self.info_lines.is_empty() {
            return self.message.clone();
        }
        let mut out = self.info_lines.join("\n");
        out.push('\n');
        out.push_str(&self.message);
        out
    }

    /// Turn a negative reply into an error describing `command`.
    pub fn to_error(&self, command: &str) -> FtpError {
        let verb = command_verb(command);
        match self.code {
            Some(code) => FtpError::from_reply(code, &format!("{} failed: {}", verb, self.message)),
            None => FtpError::protocol(format!("{} got a reply without a code: {}", verb, self.message)),
        }
    }

    /// `Ok(self)` for 2xx/3xx, otherwise the classified error.
    pub fn into_result(self, command: &str) -> Result<Self, FtpError> {
        if self.success() {
            Ok(self)
        } else {
            Err(self.to_error(command))
        }
    }
}

impl fmt::Display for FtpReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Accumulates reply lines until a terminator is seen.
#[derive(Debug, Default)]
pub struct ReplyDecoder {
    info_lines: Vec<String>,
}

impl ReplyDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without CRLF). Returns the finished reply when the
    /// line terminates it.
    pub fn push_line(&mut self, line: &str) -> Option<FtpReply> {
        match REPLY_LINE_RE.captures(line) {
            Some(caps) => {
                let code: u16 = caps["code"].parse().ok()?;
                let message = caps.name("message").map_or("", |m| m.as_str());
                let info = std::mem::take(&mut self.info_lines);
                Some(FtpReply::new(code, message, info))
            }
            None => {
                self.info_lines.push(line.to_string());
                None
            }
        }
    }

    /// Lines collected so far for the reply in progress.
    pub fn pending_lines(&self) -> &[String] {
        &self.info_lines
    }
}

/// Decode raw line bytes, stripping the trailing CR/LF.
pub fn decode_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.trim_end_matches(['\r', '\n']).to_string()
}

/// Wire form of a command line.
pub fn encode_command(command: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(command.len() + 2);
    buf.extend_from_slice(command.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Command text safe for logs; credentials are masked.
pub fn loggable(command: &str) -> Cow<'_, str> {
    if command.get(..5).map_or(false, |p| p.eq_ignore_ascii_case("PASS ")) {
        Cow::Borrowed("PASS ***")
    } else {
        Cow::Borrowed(command)
    }
}

/// Upper-cased first word of a command line.
pub fn command_verb(command: &str) -> String {
    command
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}
