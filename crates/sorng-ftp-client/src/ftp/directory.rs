//! File and directory operations on the control channel: SIZE, MDTM,
//! existence probes, MKD/RMD, DELE, rename, SITE CHMOD and MLST.

use crate::ftp::capabilities::Capabilities;
use crate::ftp::error::{
    matches_phrase, FtpError, FtpResult, DIRECTORY_EXISTS_PHRASES, FILE_NOT_FOUND_PHRASES,
};
use crate::ftp::reply::FtpReply;
use crate::ftp::session::ControlSession;
use crate::ftp::types::TransferType;
use chrono::{DateTime, NaiveDateTime, Utc};

/// SIZE refusals that go away in binary mode.
const SIZE_NOT_IN_ASCII_PHRASES: &[&str] = &["not allowed in ascii", "size not allowed in ascii"];

// ─── Path helpers ────────────────────────────────────────────────────

/// `"/a/b/c.txt"` → `"/a/b"`; `"c.txt"` → `"."`.
pub fn parent_directory(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
        None => ".".to_string(),
    }
}

/// Last path component.
pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

pub fn is_root_directory(path: &str) -> bool {
    let p = path.trim();
    p.is_empty() || p == "/" || p == "." || p == "./"
}

/// Whether a name listing contains `path`, whether the server lists bare
/// names, full paths, or full paths without the leading slash.
pub fn name_listing_contains(names: &[String], path: &str) -> bool {
    let name = file_name(path);
    let prefixed = format!("/{}", path.trim_start_matches('/'));
    names.iter().any(|entry| {
        entry == name || entry == path || format!("/{}", entry.trim_start_matches('/')) == prefixed
    })
}

/// MDTM timestamp: `YYYYMMDDhhmmss` with optional `.fff`.
pub fn parse_mdtm(text: &str) -> Option<DateTime<Utc>> {
    let value = text.split_whitespace().next()?;
    let (whole, fraction) = match value.split_once('.') {
        Some((w, f)) => (w, Some(f)),
        None => (value, None),
    };
    let naive = NaiveDateTime::parse_from_str(whole, "%Y%m%d%H%M%S").ok()?;
    let mut ts = naive.and_utc();
    if let Some(f) = fraction {
        let digits: String = f.chars().take(3).collect();
        let millis: i64 = format!("{:0<3}", digits).parse().ok()?;
        ts += chrono::Duration::milliseconds(millis);
    }
    Some(ts)
}

impl ControlSession {
    // ─── SIZE ────────────────────────────────────────────────────

    /// Remote file length, or `None` when the server won't say.
    pub async fn file_size(&mut self, path: &str) -> FtpResult<Option<u64>> {
        let reply = self.execute(&format!("SIZE {}", path)).await?;
        if reply.success() {
            return Ok(reply.message.trim().parse().ok());
        }
        if matches_phrase(&reply.message, SIZE_NOT_IN_ASCII_PHRASES)
            && self.state.transfer_type != Some(TransferType::Binary)
        {
            log::debug!("FTP: SIZE refused in ASCII mode, retrying in binary");
            self.set_transfer_type(TransferType::Binary).await?;
            let retry = self.execute(&format!("SIZE {}", path)).await?;
            if retry.success() {
                return Ok(retry.message.trim().parse().ok());
            }
        }
        Ok(None)
    }

    // ─── MDTM ────────────────────────────────────────────────────

    pub async fn modified_time(&mut self, path: &str) -> FtpResult<DateTime<Utc>> {
        let reply = self.execute_ok(&format!("MDTM {}", path)).await?;
        parse_mdtm(&reply.message)
            .ok_or_else(|| FtpError::protocol(format!("Cannot parse MDTM reply: {}", reply.message)))
    }

    // ─── Existence probes ────────────────────────────────────────

    /// FTP has no "exists" command: try SIZE, then MDTM, then a name
    /// listing of the parent directory.
    pub async fn file_exists(&mut self, path: &str) -> FtpResult<bool> {
        if self.has_capability(Capabilities::SIZE) {
            let reply = self.execute(&format!("SIZE {}", path)).await?;
            if reply.success() {
                return Ok(true);
            }
            if is_not_found(&reply) {
                return Ok(false);
            }
        }

        if self.has_capability(Capabilities::MDTM) {
            let reply = self.execute(&format!("MDTM {}", path)).await?;
            if reply.is_completion() {
                return Ok(true);
            }
            if reply.is_permanent_negative() && is_not_found(&reply) {
                return Ok(false);
            }
        }

        let names = match self.get_name_listing(&parent_directory(path)).await {
            Ok(names) => names,
            Err(e) if e.is_file_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(name_listing_contains(&names, path))
    }

    /// CWD into `path` and back.
    pub async fn directory_exists(&mut self, path: &str) -> FtpResult<bool> {
        if is_root_directory(path) {
            return Ok(true);
        }
        let pwd = self.working_directory().await?;
        if !self.execute(&format!("CWD {}", path)).await?.success() {
            return Ok(false);
        }
        let restore = self.execute(&format!("CWD {}", pwd)).await?;
        if !restore.success() {
            return Err(FtpError::command(
                restore.code,
                format!("Failed to restore working directory {}: {}", pwd, restore.message),
            ));
        }
        Ok(true)
    }

    // ─── MKD / RMD ───────────────────────────────────────────────

    /// Create `path`; with `recursive`, every missing parent too.
    ///
    /// Returns `false` when the server reports the directory already exists.
    pub async fn create_directory(&mut self, path: &str, recursive: bool) -> FtpResult<bool> {
        let path = path.trim_end_matches('/');
        if is_root_directory(path) {
            return Ok(false);
        }
        if recursive {
            let absolute = path.starts_with('/');
            let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
            let mut current = String::new();
            for part in &parts[..parts.len().saturating_sub(1)] {
                if absolute || !current.is_empty() {
                    current.push('/');
                }
                current.push_str(part);
                self.make_directory(&current).await?;
            }
        }
        self.make_directory(path).await
    }

    async fn make_directory(&mut self, path: &str) -> FtpResult<bool> {
        let reply = self.execute(&format!("MKD {}", path)).await?;
        if reply.success() {
            log::debug!("FTP: created directory {}", path);
            return Ok(true);
        }
        if reply.code == Some(550)
            || (reply.is_permanent_negative() && matches_phrase(&reply.message, DIRECTORY_EXISTS_PHRASES))
        {
            return Ok(false);
        }
        Err(reply.to_error("MKD"))
    }

    /// Remove an empty directory.
    pub async fn delete_directory(&mut self, path: &str) -> FtpResult<()> {
        self.execute_ok(&format!("RMD {}", path)).await?;
        Ok(())
    }

    // ─── DELE / RNFR+RNTO ────────────────────────────────────────

    pub async fn delete_file(&mut self, path: &str) -> FtpResult<()> {
        self.execute_ok(&format!("DELE {}", path)).await?;
        Ok(())
    }

    /// Rename (or move) a file or directory.
    pub async fn rename(&mut self, from: &str, to: &str) -> FtpResult<()> {
        let rnfr = self.execute(&format!("RNFR {}", from)).await?;
        if !rnfr.success() {
            return Err(rnfr.to_error("RNFR"));
        }
        self.execute_ok(&format!("RNTO {}", to)).await?;
        Ok(())
    }

    // ─── SITE CHMOD ──────────────────────────────────────────────

    /// `mode` is the usual octal permission value, e.g. `0o644`.
    pub async fn chmod(&mut self, path: &str, mode: u32) -> FtpResult<()> {
        self.execute_ok(&format!("SITE CHMOD {:03o} {}", mode, path)).await?;
        Ok(())
    }

    // ─── MLST ────────────────────────────────────────────────────

    /// MLST fact line for `path` (`type=file;size=12;modify=...; name`).
    ///
    /// `None` when the server lacks MLST or the path does not exist.
    pub async fn stat_raw(&mut self, path: &str) -> FtpResult<Option<String>> {
        if !self.has_capability(Capabilities::MLSD) {
            return Ok(None);
        }
        let reply = self.execute(&format!("MLST {}", path)).await?;
        if !reply.success() {
            if is_not_found(&reply) {
                return Ok(None);
            }
            return Err(reply.to_error("MLST"));
        }
        Ok(reply
            .info_lines
            .iter()
            .map(|l| l.trim())
            .find(|l| l.contains('=') && l.contains(';'))
            .map(str::to_string))
    }
}

fn is_not_found(reply: &FtpReply) -> bool {
    reply.is_negative() && matches_phrase(&reply.message, FILE_NOT_FOUND_PHRASES)
}
