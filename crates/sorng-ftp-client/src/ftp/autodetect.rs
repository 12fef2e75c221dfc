//! Connection profile discovery.
//!
//! Tries every combination of encoding, security mode, TLS version and
//! data-channel type against the server on disposable sessions and
//! records the ones that connect and open a listing channel.

use crate::ftp::error::{FtpErrorKind, FtpResult};
use crate::ftp::session::ControlSession;
use crate::ftp::types::*;
use serde::{Deserialize, Serialize};

/// Sweep knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoDetectOptions {
    /// Stop at the first working profile.
    #[serde(default = "default_true")]
    pub first_only: bool,
    /// Try implicit FTPS on port 990.
    #[serde(default = "default_true")]
    pub include_implicit: bool,
    /// Skip plain FTP.
    #[serde(default)]
    pub require_encryption: bool,
}

fn default_true() -> bool {
    true
}

impl Default for AutoDetectOptions {
    fn default() -> Self {
        Self {
            first_only: true,
            include_implicit: true,
            require_encryption: false,
        }
    }
}

const SWEEP_ENCODINGS: [ListingEncoding; 2] = [ListingEncoding::Utf8, ListingEncoding::Ascii];
const SWEEP_SECURITY: [FtpSecurityMode; 3] = [
    FtpSecurityMode::None,
    FtpSecurityMode::Implicit,
    FtpSecurityMode::Explicit,
];

/// Candidate configs in sweep order.
pub fn candidates(base: &FtpConnectionConfig, options: &AutoDetectOptions) -> Vec<FtpConnectionConfig> {
    let well_known = base.port == 21 || base.port == 990;
    let mut out = Vec::new();

    for encoding in SWEEP_ENCODINGS {
        for security in SWEEP_SECURITY {
            if security == FtpSecurityMode::None && options.require_encryption {
                continue;
            }
            if security == FtpSecurityMode::Implicit && !options.include_implicit {
                continue;
            }
            let protocols: Vec<Vec<FtpTlsProtocol>> = if security == FtpSecurityMode::None {
                vec![base.tls_protocols.clone()]
            } else {
                base.tls_protocols.iter().map(|p| vec![*p]).collect()
            };

            for tls_protocols in protocols {
                for data_channel_type in DataChannelType::sweep_order() {
                    let mut cfg = base.clone();
                    cfg.encoding = encoding;
                    cfg.security = security;
                    cfg.tls_protocols = tls_protocols.clone();
                    cfg.data_channel_type = data_channel_type;
                    if well_known {
                        cfg.port = security.default_port();
                    }
                    out.push(cfg);
                }
            }
        }
    }
    out
}

impl ControlSession {
    /// Find working connection profiles for this session's host and
    /// credentials. The session itself is left untouched.
    ///
    /// An authentication failure ends the sweep with that error, since no
    /// other combination can fix bad credentials.
    pub async fn auto_detect(&self, options: &AutoDetectOptions) -> FtpResult<Vec<SessionProfile>> {
        let mut found = Vec::new();
        let base = self.config().clone();

        for cfg in candidates(&base, options) {
            self.check_cancelled()?;
            let label = format!(
                "{:?}/{:?}/{:?}/{:?}",
                cfg.encoding, cfg.security, cfg.tls_protocols, cfg.data_channel_type
            );
            log::debug!("FTP auto-detect: trying {} on port {}", label, cfg.port);

            let mut probe = ControlSession::new(cfg)
                .with_connector(self.connector().clone())
                .with_validator(self.validator())
                .with_cancellation(self.cancellation_token().child_token());

            let result = probe_session(&mut probe).await;
            probe.disconnect().await;

            match result {
                Ok(()) => {
                    log::info!("FTP auto-detect: {} works", label);
                    found.push(SessionProfile::from_config(probe.config()));
                    if options.first_only {
                        break;
                    }
                }
                Err(e) if e.kind == FtpErrorKind::Authentication || e.is_cancelled() => {
                    log::warn!("FTP auto-detect: aborting sweep: {}", e);
                    return Err(e);
                }
                Err(e) => log::debug!("FTP auto-detect: {} failed: {}", label, e),
            }
        }

        Ok(found)
    }
}

async fn probe_session(probe: &mut ControlSession) -> FtpResult<()> {
    probe.connect().await?;
    probe.get_listing_raw("", ListingCommand::List).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn base(port: u16) -> FtpConnectionConfig {
        let mut cfg = FtpConnectionConfig::new("127.0.0.1", "a", "b");
        cfg.port = port;
        cfg
    }

    #[test]
    fn test_candidate_count() {
        // 2 encodings x (plain + 2 implicit + 2 explicit) x 5 channel types
        let all = candidates(&base(21), &AutoDetectOptions::default());
        assert_eq!(all.len(), 50);

        let opts = AutoDetectOptions {
            include_implicit: false,
            require_encryption: true,
            ..Default::default()
        };
        assert_eq!(candidates(&base(21), &opts).len(), 20);
    }

    #[test]
    fn test_candidate_order_and_ports() {
        let all = candidates(&base(990), &AutoDetectOptions::default());
        let first = &all[0];
        assert_eq!(first.encoding, ListingEncoding::Utf8);
        assert_eq!(first.security, FtpSecurityMode::None);
        assert_eq!(first.data_channel_type, DataChannelType::Eprt);
        assert_eq!(first.port, 21);

        let implicit: Vec<_> = all.iter().filter(|c| c.security == FtpSecurityMode::Implicit).collect();
        assert!(implicit.iter().all(|c| c.port == 990 && c.tls_protocols.len() == 1));

        let last = all.last().unwrap();
        assert_eq!(last.encoding, ListingEncoding::Ascii);
        assert_eq!(last.security, FtpSecurityMode::Explicit);
        assert_eq!(last.data_channel_type, DataChannelType::Port);
    }

    #[test]
    fn test_custom_port_kept() {
        let all = candidates(&base(2121), &AutoDetectOptions::default());
        assert!(all.iter().all(|c| c.port == 2121));
    }

    #[tokio::test]
    async fn test_auth_failure_aborts_sweep() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (rd, mut wr) = sock.into_split();
            let mut rd = BufReader::new(rd);
            wr.write_all(b"220 ready\r\n").await.unwrap();
            let mut line = String::new();
            while rd.read_line(&mut line).await.unwrap() > 0 {
                let reply: &[u8] = if line.starts_with("USER") {
                    b"331 password please\r\n"
                } else if line.starts_with("PASS") {
                    b"530 Login incorrect\r\n"
                } else {
                    b"221 bye\r\n"
                };
                wr.write_all(reply).await.unwrap();
                line.clear();
            }
        });

        let session = ControlSession::new(base(port));
        let err = session.auto_detect(&AutoDetectOptions::default()).await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::Authentication);
        server.abort();
    }

    #[tokio::test]
    async fn test_refused_listing_does_not_abort_sweep() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (rd, mut wr) = sock.into_split();
                    let mut rd = BufReader::new(rd);
                    if wr.write_all(b"220 ready\r\n").await.is_err() {
                        return;
                    }
                    let mut line = String::new();
                    while let Ok(n) = rd.read_line(&mut line).await {
                        if n == 0 {
                            break;
                        }
                        let verb = line.split_whitespace().next().unwrap_or("").to_ascii_uppercase();
                        let reply: &[u8] = match verb.as_str() {
                            "USER" => b"331 password please\r\n",
                            "PASS" => b"230 welcome\r\n",
                            "QUIT" => b"221 bye\r\n",
                            "EPRT" | "PORT" | "EPSV" | "PASV" | "LIST" => b"530 Permission denied\r\n",
                            _ => b"502 not implemented\r\n",
                        };
                        if wr.write_all(reply).await.is_err() {
                            break;
                        }
                        line.clear();
                    }
                });
            }
        });

        let opts = AutoDetectOptions {
            include_implicit: false,
            ..Default::default()
        };
        let found = ControlSession::new(base(port)).auto_detect(&opts).await.unwrap();
        assert!(found.is_empty());
        server.abort();
    }

    #[tokio::test]
    async fn test_unreachable_host_finds_nothing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let opts = AutoDetectOptions {
            include_implicit: false,
            require_encryption: false,
            first_only: false,
        };
        let mut cfg = base(port);
        cfg.connect_timeout_ms = 500;
        cfg.tls_protocols = vec![FtpTlsProtocol::Tls12];
        let found = ControlSession::new(cfg).auto_detect(&opts).await.unwrap();
        assert!(found.is_empty());
    }
}
