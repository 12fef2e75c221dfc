//! Server capability registry (RFC 2389 FEAT) and server-family detection.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Optional features a server advertised in its FEAT reply.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Capabilities: u64 {
        const MLSD         = 1 << 0;
        const SIZE         = 1 << 1;
        const MDTM         = 1 << 2;
        /// REST STREAM.
        const REST         = 1 << 3;
        const UTF8         = 1 << 4;
        const PRET         = 1 << 5;
        const MFMT         = 1 << 6;
        const MFCT         = 1 << 7;
        const MFF          = 1 << 8;
        const MD5          = 1 << 9;
        const XMD5         = 1 << 10;
        const XCRC         = 1 << 11;
        const XSHA1        = 1 << 12;
        const XSHA256      = 1 << 13;
        const XSHA512      = 1 << 14;
        const EPSV         = 1 << 15;
        const CPSV         = 1 << 16;
        const NOOP         = 1 << 17;
        const CLNT         = 1 << 18;
        const SSCN         = 1 << 19;
        const SITE_MKDIR   = 1 << 20;
        const SITE_RMDIR   = 1 << 21;
        const SITE_UTIME   = 1 << 22;
        const SITE_SYMLINK = 1 << 23;
        const AVBL         = 1 << 24;
        const THMB         = 1 << 25;
        const RMDA         = 1 << 26;
        const DSIZ         = 1 << 27;
        const HOST         = 1 << 28;
        const CCC          = 1 << 29;
        const MODE_Z       = 1 << 30;
        const LANG         = 1 << 31;
        const HASH         = 1 << 32;
    }
}

/// FEAT keywords, matched as prefixes of the upper-cased feature line.
const FEATURE_PREFIXES: &[(&str, Capabilities)] = &[
    ("MLST", Capabilities::MLSD),
    ("MLSD", Capabilities::MLSD),
    ("MDTM", Capabilities::MDTM),
    ("REST STREAM", Capabilities::REST),
    ("SIZE", Capabilities::SIZE),
    ("UTF8", Capabilities::UTF8),
    ("UTF-8", Capabilities::UTF8),
    ("PRET", Capabilities::PRET),
    ("MFMT", Capabilities::MFMT),
    ("MFCT", Capabilities::MFCT),
    ("MFF", Capabilities::MFF),
    ("MD5", Capabilities::MD5),
    ("XMD5", Capabilities::XMD5),
    ("XCRC", Capabilities::XCRC),
    ("XSHA1", Capabilities::XSHA1),
    ("XSHA256", Capabilities::XSHA256),
    ("XSHA512", Capabilities::XSHA512),
    ("EPSV", Capabilities::EPSV),
    ("CPSV", Capabilities::CPSV),
    ("NOOP", Capabilities::NOOP),
    ("CLNT", Capabilities::CLNT),
    ("SSCN", Capabilities::SSCN),
    ("SITE MKDIR", Capabilities::SITE_MKDIR),
    ("SITE RMDIR", Capabilities::SITE_RMDIR),
    ("SITE UTIME", Capabilities::SITE_UTIME),
    ("SITE SYMLINK", Capabilities::SITE_SYMLINK),
    ("AVBL", Capabilities::AVBL),
    ("THMB", Capabilities::THMB),
    ("RMDA", Capabilities::RMDA),
    ("DSIZ", Capabilities::DSIZ),
    ("HOST", Capabilities::HOST),
    ("CCC", Capabilities::CCC),
    ("MODE Z", Capabilities::MODE_Z),
    ("LANG", Capabilities::LANG),
    ("HASH", Capabilities::HASH),
];

/// Capabilities plus the HASH algorithm list, as parsed from FEAT.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureSet {
    pub capabilities: Capabilities,
    pub hash_algorithms: Vec<String>,
}

/// Parse the info lines of a FEAT reply.
pub fn detect_features<S: AsRef<str>>(lines: &[S]) -> FeatureSet {
    let mut set = FeatureSet::default();
    for raw in lines {
        let mut line = raw.as_ref().trim();
        if line.get(..4).map_or(false, |p| p.eq_ignore_ascii_case("211-")) {
            line = line[4..].trim();
        }
        let upper = line.to_ascii_uppercase();
        for (prefix, flag) in FEATURE_PREFIXES {
            if upper.starts_with(prefix) {
                set.capabilities |= *flag;
            }
        }
        if upper.starts_with("HASH") {
            set.hash_algorithms = line[4..]
                .split(';')
                .map(|a| a.trim().trim_end_matches('*').to_string())
                .filter(|a| !a.is_empty())
                .collect();
        }
    }
    set
}

// ─── Server family ───────────────────────────────────────────────────

/// Server software, as far as the greeting and SYST reveal it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ServerFamily {
    VsFtpd,
    ProFtpd,
    PureFtpd,
    FileZilla,
    Iis,
    ServU,
    GlFtpd,
    IbmZos,
    OpenVms,
    WindowsCe,
    #[default]
    Unknown,
}

impl ServerFamily {
    /// Guess from the welcome banner.
    pub fn from_greeting(greeting: &str) -> Self {
        let lower = greeting.to_lowercase();
        if lower.contains("vsftpd") {
            Self::VsFtpd
        } else if lower.contains("proftpd") {
            Self::ProFtpd
        } else if lower.contains("pure-ftpd") || lower.contains("pureftpd") {
            Self::PureFtpd
        } else if lower.contains("filezilla server") {
            Self::FileZilla
        } else if lower.contains("microsoft ftp service") {
            Self::Iis
        } else if lower.contains("serv-u") {
            Self::ServU
        } else if lower.contains("glftpd") {
            Self::GlFtpd
        } else if lower.contains("ibm ftp cs") {
            Self::IbmZos
        } else if lower.contains("windows ce") {
            Self::WindowsCe
        } else {
            Self::Unknown
        }
    }

    /// Refine using the SYST reply; keeps `self` when SYST says nothing new.
    pub fn refine_with_system(self, system: &str) -> Self {
        let upper = system.to_ascii_uppercase();
        if upper.contains("MVS") || upper.contains("Z/OS") {
            Self::IbmZos
        } else if upper.starts_with("VMS") || upper.contains("OPENVMS") {
            Self::OpenVms
        } else {
            self
        }
    }

    /// Capability set assumed when FEAT is missing or empty.
    pub fn assumed_capabilities(self) -> Capabilities {
        let common = Capabilities::SIZE | Capabilities::MDTM | Capabilities::REST;
        match self {
            Self::VsFtpd => common | Capabilities::UTF8 | Capabilities::EPSV,
            Self::ProFtpd | Self::FileZilla | Self::ServU => {
                common | Capabilities::UTF8 | Capabilities::EPSV | Capabilities::MLSD | Capabilities::MFMT
            }
            Self::PureFtpd | Self::Iis => {
                common | Capabilities::UTF8 | Capabilities::EPSV | Capabilities::MLSD
            }
            Self::GlFtpd => common | Capabilities::PRET | Capabilities::CPSV,
            Self::IbmZos => Capabilities::SIZE | Capabilities::REST,
            Self::OpenVms | Self::WindowsCe | Self::Unknown => Capabilities::empty(),
        }
    }

    /// Servers whose SIZE does not match the bytes a RETR delivers.
    pub fn always_read_to_end(self) -> bool {
        matches!(self, Self::IbmZos)
    }
}
