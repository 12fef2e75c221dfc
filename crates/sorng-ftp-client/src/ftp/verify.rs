//! Post-transfer verification hooks.

use crate::ftp::error::FtpResult;
use crate::ftp::session::ControlSession;
use async_trait::async_trait;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::path::Path;

bitflags! {
    /// What to do when verification fails.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct VerifyOptions: u8 {
        /// Retry (overwriting) up to `retry_attempts` times.
        const RETRY  = 1 << 0;
        /// Delete the unverified file once attempts are exhausted.
        const DELETE = 1 << 1;
        /// Fail with a `Verification` error once attempts are exhausted.
        const THROW  = 1 << 2;
    }
}

/// Compares a transferred file on both ends.
#[async_trait]
pub trait TransferVerifier: Send + Sync {
    async fn verify(&self, session: &mut ControlSession, local_path: &Path, remote_path: &str) -> FtpResult<bool>;
}

/// Verifier plus the failure policy, as passed to the file-level calls.
#[derive(Clone, Copy)]
pub struct Verification<'a> {
    pub options: VerifyOptions,
    pub verifier: &'a dyn TransferVerifier,
}

impl<'a> Verification<'a> {
    pub fn new(options: VerifyOptions, verifier: &'a dyn TransferVerifier) -> Self {
        Self { options, verifier }
    }

    /// Attempts the wrapper makes given the session's `retry_attempts`.
    pub fn attempts(&self, retry_attempts: u32) -> u32 {
        if self.options.contains(VerifyOptions::RETRY) {
            retry_attempts.max(1)
        } else {
            1
        }
    }
}

/// Compares the local length with the remote SIZE.
#[derive(Debug, Default, Clone, Copy)]
pub struct LengthVerifier;

#[async_trait]
impl TransferVerifier for LengthVerifier {
    async fn verify(&self, session: &mut ControlSession, local_path: &Path, remote_path: &str) -> FtpResult<bool> {
        let local = tokio::fs::metadata(local_path).await?.len();
        let remote = session.file_size(remote_path).await?;
        log::debug!("FTP: verify {}: local {} bytes, remote {:?}", remote_path, local, remote);
        Ok(remote == Some(local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempts() {
        let v = LengthVerifier;
        assert_eq!(Verification::new(VerifyOptions::RETRY, &v).attempts(3), 3);
        assert_eq!(Verification::new(VerifyOptions::RETRY, &v).attempts(0), 1);
        assert_eq!(Verification::new(VerifyOptions::THROW, &v).attempts(3), 1);
        assert_eq!(Verification::new(VerifyOptions::empty(), &v).attempts(5), 1);
    }

    #[test]
    fn test_options_serialize() {
        let opts = VerifyOptions::RETRY | VerifyOptions::DELETE;
        let json = serde_json::to_string(&opts).unwrap();
        let back: VerifyOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, opts);
    }
}
