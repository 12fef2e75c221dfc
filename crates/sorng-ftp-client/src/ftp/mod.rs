//! # sorng-ftp-client: FTP/FTPS client core
//!
//! Protocol coverage:
//! - **RFC 959**: control connection, PASV/PORT data channels, REST
//! - **RFC 2228 / 4217**: AUTH TLS, PBSZ/PROT, CCC (Explicit & Implicit FTPS)
//! - **RFC 2389**: FEAT negotiation
//! - **RFC 2428**: EPSV / EPRT (IPv6-ready)
//! - **RFC 3659**: SIZE, MDTM, MLST/MLSD, REST STREAM
//!
//! Architecture:
//! - `types`: config, enums, progress and profile types
//! - `error`: categorised error type and known server phrases
//! - `reply`: reply decoding
//! - `capabilities`: FEAT parsing and server family detection
//! - `transport`: socket connector seam and the plain/TLS stream
//! - `tls`: rustls setup, certificate validation hook, session cache
//! - `session`: connect, login, execute, disconnect
//! - `data_channel`: EPSV/PASV/EPRT/PORT negotiation
//! - `throttle`: chunk sizing and rate limiting
//! - `transfer`: resumable stream download/upload engine
//! - `directory`: SIZE/MDTM/existence checks, MKD/RMD/DELE/RNFR
//! - `listing`: raw and parsed directory listings
//! - `verify`: post-transfer verification hooks
//! - `file_ops`: local-file transfers with existence policies
//! - `client`: shared handle, clones and keepalive
//! - `autodetect`: connection profile discovery

pub mod types;
pub mod error;
pub mod reply;
pub mod capabilities;
pub mod transport;
pub mod tls;
pub mod session;
pub mod data_channel;
pub mod throttle;
pub mod transfer;
pub mod directory;
pub mod listing;
pub mod verify;
pub mod file_ops;
pub mod client;
pub mod autodetect;

pub use autodetect::AutoDetectOptions;
pub use capabilities::{Capabilities, ServerFamily};
pub use client::FtpClient;
pub use error::{FtpError, FtpErrorKind, FtpResult};
pub use listing::ListingParser;
pub use reply::FtpReply;
pub use session::ControlSession;
pub use tls::CertificateValidator;
pub use transfer::ProgressHandler;
pub use transport::{DirectConnector, SocketConnector};
pub use types::*;
pub use verify::{LengthVerifier, TransferVerifier, Verification, VerifyOptions};
