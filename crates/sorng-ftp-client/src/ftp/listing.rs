//! Directory listing retrieval.
//!
//! Listings are fetched as raw text lines over an ASCII data channel.
//! Turning `LIST`/`MLSD` lines into entries is left to a [`ListingParser`]
//! supplied by the caller.

use crate::ftp::capabilities::Capabilities;
use crate::ftp::error::FtpResult;
use crate::ftp::session::ControlSession;
use crate::ftp::types::{ListingCommand, TransferType};

/// Turns raw listing lines into entries.
pub trait ListingParser: Send + Sync {
    type Entry;

    /// `capabilities` tells the parser whether lines came from MLSD.
    fn parse(&self, lines: &[String], capabilities: Capabilities) -> FtpResult<Vec<Self::Entry>>;
}

/// Split listing bytes into non-empty lines without their CR/LF.
pub fn split_listing(data: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(data)
        .split('\n')
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect()
}

impl ControlSession {
    /// Raw listing of `path` (empty for the working directory).
    pub async fn get_listing_raw(&mut self, path: &str, command: ListingCommand) -> FtpResult<Vec<String>> {
        self.set_transfer_type(TransferType::Ascii).await?;
        let cmd = if path.is_empty() {
            command.verb().to_string()
        } else {
            format!("{} {}", command.verb(), path)
        };

        let mut channel = self.open_transfer_channel(&cmd, 0, None).await?;
        if channel.is_empty_listing() {
            channel.finish(self, 0).await?;
            return Ok(Vec::new());
        }
        let data = match channel.read_all().await {
            Ok(data) => data,
            Err(e) => {
                channel.abandon(self, 0).await;
                return Err(e.into());
            }
        };
        let reply = channel.finish(self, 0).await?;
        if reply.is_negative() {
            return Err(reply.to_error(&cmd));
        }

        let lines = split_listing(&data);
        log::debug!("FTP: {} returned {} lines", cmd, lines.len());
        Ok(lines)
    }

    /// `NLST` names; an empty directory gives an empty list.
    pub async fn get_name_listing(&mut self, path: &str) -> FtpResult<Vec<String>> {
        let lines = self.get_listing_raw(path, ListingCommand::Nlst).await?;
        Ok(lines.into_iter().map(|l| l.trim().to_string()).collect())
    }

    /// Parsed listing: MLSD when the server has it, LIST otherwise.
    pub async fn get_listing<P: ListingParser>(&mut self, path: &str, parser: &P) -> FtpResult<Vec<P::Entry>> {
        let command = if self.has_capability(Capabilities::MLSD) {
            ListingCommand::Mlsd
        } else {
            ListingCommand::List
        };
        let lines = self.get_listing_raw(path, command).await?;
        parser.parse(&lines, self.capabilities())
    }
}
