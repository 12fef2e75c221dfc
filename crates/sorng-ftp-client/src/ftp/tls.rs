//! TLS for Explicit and Implicit FTPS (RFC 4217).
//!
//! [`EncryptionLayer`] wraps a TCP socket in a rustls session on demand
//! and can drop back to plaintext after CCC. Control and data channels of
//! one session share a session cache, so data connections resume the
//! control channel's TLS session (many servers insist on it).
//!
//! Certificate decisions go through a synchronous [`CertificateValidator`]
//! passed to [`EncryptionLayer::activate`].

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::transport::FtpStream;
use crate::ftp::types::FtpTlsProtocol;
use lazy_static::lazy_static;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{ClientSessionMemoryCache, Resumption, WebPkiServerVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fmt;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

lazy_static! {
    /// Platform trust roots, loaded once.
    static ref NATIVE_ROOTS: Arc<RootCertStore> = Arc::new(load_native_roots());
}

fn load_native_roots() -> RootCertStore {
    let mut store = RootCertStore::empty();
    let result = rustls_native_certs::load_native_certs();
    for err in &result.errors {
        log::warn!("FTP TLS: failed to load a native root certificate: {}", err);
    }
    let (added, ignored) = store.add_parsable_certificates(result.certs);
    log::debug!("FTP TLS: {} native roots loaded ({} ignored)", added, ignored);
    store
}

// ─── Certificate validation ──────────────────────────────────────────

/// What the validator gets to look at.
#[derive(Debug)]
pub struct CertificateContext<'a> {
    pub host: &'a str,
    /// DER of the server's end-entity certificate.
    pub end_entity: &'a [u8],
    pub intermediate_count: usize,
    /// WebPKI chain + hostname verdict against the platform roots.
    pub default_verdict: Result<(), String>,
}

/// Validator answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateDecision {
    pub accept: bool,
    pub reason: Option<String>,
}

impl CertificateDecision {
    pub fn accept() -> Self {
        Self {
            accept: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            accept: false,
            reason: Some(reason.into()),
        }
    }
}

/// Decides whether a server certificate is trusted.
pub trait CertificateValidator: Send + Sync + fmt::Debug {
    fn validate(&self, ctx: &CertificateContext<'_>) -> CertificateDecision;
}

/// Trust exactly what WebPKI trusts.
#[derive(Debug, Default, Clone, Copy)]
pub struct StrictValidator;

impl CertificateValidator for StrictValidator {
    fn validate(&self, ctx: &CertificateContext<'_>) -> CertificateDecision {
        match ctx.default_verdict {
            Ok(()) => CertificateDecision::accept(),
            Err(ref reason) => CertificateDecision::reject(reason.clone()),
        }
    }
}

/// Accept anything, logging certificates WebPKI would have refused.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptInvalidCertificates;

impl CertificateValidator for AcceptInvalidCertificates {
    fn validate(&self, ctx: &CertificateContext<'_>) -> CertificateDecision {
        if let Err(ref reason) = ctx.default_verdict {
            log::warn!("FTP TLS: accepting untrusted certificate for {}: {}", ctx.host, reason);
        }
        CertificateDecision::accept()
    }
}

/// Validator matching the `accept_invalid_certs` setting.
pub fn default_validator(accept_invalid_certs: bool) -> Arc<dyn CertificateValidator> {
    if accept_invalid_certs {
        Arc::new(AcceptInvalidCertificates)
    } else {
        Arc::new(StrictValidator)
    }
}

/// rustls verifier delegating the final say to a [`CertificateValidator`].
struct CallbackVerifier {
    host: String,
    webpki: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
    validator: Arc<dyn CertificateValidator>,
}

impl fmt::Debug for CallbackVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackVerifier")
            .field("host", &self.host)
            .field("validator", &self.validator)
            .finish()
    }
}

impl ServerCertVerifier for CallbackVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let default_verdict = match self.webpki {
            Some(ref webpki) => webpki
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                .map(|_| ())
                .map_err(|e| e.to_string()),
            None => Err("no trusted root certificates available".to_string()),
        };
        let ctx = CertificateContext {
            host: &self.host,
            end_entity: end_entity.as_ref(),
            intermediate_count: intermediates.len(),
            default_verdict,
        };
        let decision = self.validator.validate(&ctx);
        if decision.accept {
            Ok(ServerCertVerified::assertion())
        } else {
            let reason = decision
                .reason
                .unwrap_or_else(|| "certificate rejected by validator".to_string());
            Err(rustls::Error::General(reason))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// ─── Encryption layer ────────────────────────────────────────────────

/// Per-session TLS state: target host, allowed versions and the session
/// cache shared by the control and data connections.
#[derive(Clone)]
pub struct EncryptionLayer {
    host: String,
    protocols: Vec<FtpTlsProtocol>,
    provider: Arc<CryptoProvider>,
    sessions: Arc<ClientSessionMemoryCache>,
}

impl fmt::Debug for EncryptionLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionLayer")
            .field("host", &self.host)
            .field("protocols", &self.protocols)
            .finish()
    }
}

impl EncryptionLayer {
    pub fn new(host: impl Into<String>, protocols: &[FtpTlsProtocol]) -> Self {
        Self {
            host: host.into(),
            protocols: protocols.to_vec(),
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            sessions: Arc::new(ClientSessionMemoryCache::new(32)),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn client_config(&self, validator: Arc<dyn CertificateValidator>) -> FtpResult<Arc<ClientConfig>> {
        if self.protocols.is_empty() {
            return Err(FtpError::invalid_config("No TLS protocol versions enabled"));
        }
        let versions: Vec<&'static rustls::SupportedProtocolVersion> =
            self.protocols.iter().map(|p| p.rustls_version()).collect();

        let webpki = if NATIVE_ROOTS.is_empty() {
            None
        } else {
            WebPkiServerVerifier::builder_with_provider(NATIVE_ROOTS.clone(), self.provider.clone())
                .build()
                .map_err(|e| log::warn!("FTP TLS: WebPKI verifier unavailable: {}", e))
                .ok()
        };
        let verifier = CallbackVerifier {
            host: self.host.clone(),
            webpki,
            provider: self.provider.clone(),
            validator,
        };

        let mut config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&versions)
            .map_err(|e| FtpError::tls_failed(format!("TLS configuration: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        config.resumption = Resumption::store(self.sessions.clone());
        Ok(Arc::new(config))
    }

    /// Run the client handshake over `tcp`.
    pub async fn activate(
        &self,
        tcp: TcpStream,
        validator: &Arc<dyn CertificateValidator>,
    ) -> FtpResult<FtpStream> {
        let config = self.client_config(validator.clone())?;
        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| FtpError::tls_failed(format!("Invalid TLS server name '{}': {}", self.host, e)))?;
        let tls = TlsConnector::from(config)
            .connect(server_name, tcp)
            .await
            .map_err(|e| FtpError::tls_failed(format!("TLS handshake with {}: {}", self.host, e)))?;
        log::debug!("FTP TLS: handshake with {} complete", self.host);
        Ok(FtpStream::Tls(Box::new(tls)))
    }

    /// Send close_notify and hand back the bare socket (CCC). The peer's
    /// own close_notify, if any, shows up as stale bytes on the control
    /// channel and is drained before the next command.
    pub async fn deactivate(&self, stream: FtpStream) -> FtpResult<FtpStream> {
        match stream {
            FtpStream::Tls(tls) => {
                let (mut tcp, mut conn) = (*tls).into_inner();
                conn.send_close_notify();
                let mut buf = Vec::new();
                while conn.wants_write() {
                    conn.write_tls(&mut buf)?;
                }
                tcp.write_all(&buf).await?;
                tcp.flush().await?;
                log::debug!("FTP TLS: control channel with {} downgraded to plaintext", self.host);
                Ok(FtpStream::Plain(tcp))
            }
            plain => Ok(plain),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(verdict: Result<(), String>) -> CertificateContext<'static> {
        CertificateContext {
            host: "ftp.example.com",
            end_entity: &[],
            intermediate_count: 0,
            default_verdict: verdict,
        }
    }

    #[test]
    fn test_strict_validator_follows_webpki() {
        assert!(StrictValidator.validate(&ctx(Ok(()))).accept);
        let d = StrictValidator.validate(&ctx(Err("UnknownIssuer".into())));
        assert!(!d.accept);
        assert_eq!(d.reason.as_deref(), Some("UnknownIssuer"));
    }

    #[test]
    fn test_accept_invalid_accepts_everything() {
        assert!(AcceptInvalidCertificates.validate(&ctx(Err("expired".into()))).accept);
        assert!(default_validator(true).validate(&ctx(Err("x".into()))).accept);
        assert!(!default_validator(false).validate(&ctx(Err("x".into()))).accept);
    }

    #[test]
    fn test_client_config_respects_versions() {
        let layer = EncryptionLayer::new("127.0.0.1", &[FtpTlsProtocol::Tls12]);
        let config = layer.client_config(default_validator(true)).unwrap();
        assert!(config.supports_version(rustls::ProtocolVersion::TLSv1_2));
        assert!(!config.supports_version(rustls::ProtocolVersion::TLSv1_3));

        let none = EncryptionLayer::new("127.0.0.1", &[]);
        assert!(none.client_config(default_validator(true)).is_err());
    }
}
