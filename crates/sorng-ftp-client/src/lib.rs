//! **sorng-ftp-client**: async FTP/FTPS client core.
//!
//! | Module | Purpose |
//! |---|---|
//! | [`ftp::session`] | Control connection, login, command/reply exchange |
//! | [`ftp::data_channel`] | Passive/active data channel negotiation |
//! | [`ftp::transfer`] | Resumable, rate-limited stream transfers |
//! | [`ftp::file_ops`] | Local file transfers with existence policies and verification |
//! | [`ftp::client`] | Shared handle, parallel clones, keepalive |
//! | [`ftp::autodetect`] | Connection profile discovery |

pub mod ftp;

pub use ftp::{
    ControlSession, FtpClient, FtpConnectionConfig, FtpError, FtpErrorKind, FtpReply, FtpResult,
    SessionProfile,
};
