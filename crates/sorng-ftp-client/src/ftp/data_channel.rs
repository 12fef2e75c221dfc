//! Data channel negotiation (RFC 959 PASV/PORT, RFC 2428 EPSV/EPRT).
//!
//! `open_data_channel` sets up the second socket a transfer command needs,
//! sends `REST` and the command itself, and wraps the socket in TLS once
//! the server acknowledged the command. Passive addresses pointing into
//! private networks are replaced with the control host (NAT correction).

use crate::ftp::capabilities::Capabilities;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::reply::{command_verb, FtpReply};
use crate::ftp::session::ControlSession;
use crate::ftp::transport::FtpStream;
use crate::ftp::types::DataChannelType;
use lazy_static::lazy_static;
use regex::Regex;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

lazy_static! {
    static ref EPSV_PORT_RE: Regex = Regex::new(r"\(\|\|\|(?P<port>\d+)\|\)").unwrap();
    static ref PASV_ADDR_RE: Regex = Regex::new(
        r"(?P<a>\d{1,3}),\s*(?P<b>\d{1,3}),\s*(?P<c>\d{1,3}),\s*(?P<d>\d{1,3}),\s*(?P<hi>\d{1,3}),\s*(?P<lo>\d{1,3})"
    )
    .unwrap();
}

// ─── Reply parsing ───────────────────────────────────────────────────

/// Port from an EPSV reply: `229 Entering Extended Passive Mode (|||6446|)`.
pub fn parse_epsv_port(message: &str) -> Option<u16> {
    EPSV_PORT_RE
        .captures(message)
        .and_then(|c| c["port"].parse().ok())
}

/// Address and port from a PASV reply: `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`.
pub fn parse_pasv_endpoint(message: &str) -> Option<(Ipv4Addr, u16)> {
    let caps = PASV_ADDR_RE.captures(message)?;
    let octet = |name: &str| caps[name].parse::<u8>().ok();
    let ip = Ipv4Addr::new(octet("a")?, octet("b")?, octet("c")?, octet("d")?);
    let port = (u16::from(octet("hi")?) << 8) + u16::from(octet("lo")?);
    Some((ip, port))
}

/// Private, loopback or unspecified; such passive addresses are usually a
/// NATed server describing itself from the inside.
pub fn is_private_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_unspecified(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

/// Host to dial for a PASV reply.
pub fn resolve_passive_host(
    advertised: Ipv4Addr,
    control_host: &str,
    force_control_host: bool,
    behind_proxy: bool,
) -> String {
    if force_control_host || (!behind_proxy && is_private_address(&IpAddr::V4(advertised))) {
        control_host.to_string()
    } else {
        advertised.to_string()
    }
}

/// `EPRT |1|192.168.0.2|5282|`
pub fn format_eprt(ip: IpAddr, port: u16) -> String {
    let family = if ip.is_ipv6() { 2 } else { 1 };
    format!("EPRT |{}|{}|{}|", family, ip, port)
}

/// `PORT 192,168,0,2,20,162`
pub fn format_port(ip: Ipv4Addr, port: u16) -> String {
    let [a, b, c, d] = ip.octets();
    format!("PORT {},{},{},{},{},{}", a, b, c, d, port >> 8, port & 0xff)
}

/// NLST of an empty directory, which some servers answer with 550.
fn is_empty_name_listing(command: &str, reply: &FtpReply) -> bool {
    command_verb(command) == "NLST"
        && reply.code == Some(550)
        && reply.message.to_lowercase().contains("no files found")
}

// ─── Data channel ────────────────────────────────────────────────────

/// An open data connection and the command it belongs to.
pub struct DataChannel {
    stream: Option<FtpStream>,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
    pub encrypted: bool,
    /// Reply to the transfer command. A preliminary (1xx) status means the
    /// final reply is still pending on the control channel.
    pub command_status: FtpReply,
    /// Logical length of the remote file, when known.
    pub length: Option<u64>,
    /// Logical offset, starting at the restart position.
    pub position: u64,
    read_timeout: Duration,
    empty_listing: bool,
    /// Child session the channel was opened on, torn down with the channel.
    owner: Option<Box<ControlSession>>,
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("encrypted", &self.encrypted)
            .field("command_status", &self.command_status)
            .field("length", &self.length)
            .field("position", &self.position)
            .field("cloned", &self.owner.is_some())
            .finish()
    }
}

impl DataChannel {
    fn new(stream: FtpStream, status: FtpReply, read_timeout: Duration) -> Self {
        Self {
            local_addr: stream.local_addr().ok(),
            peer_addr: stream.peer_addr().ok(),
            encrypted: stream.is_encrypted(),
            stream: Some(stream),
            command_status: status,
            length: None,
            position: 0,
            read_timeout,
            empty_listing: false,
            owner: None,
        }
    }

    /// Channel with no socket; reads return end-of-stream immediately.
    fn empty(status: FtpReply) -> Self {
        Self {
            stream: None,
            local_addr: None,
            peer_addr: None,
            encrypted: false,
            command_status: status,
            length: Some(0),
            position: 0,
            read_timeout: Duration::ZERO,
            empty_listing: true,
            owner: None,
        }
    }

    pub fn is_cloned(&self) -> bool {
        self.owner.is_some()
    }

    /// Stand-in for an NLST the server answered with "no files found".
    pub fn is_empty_listing(&self) -> bool {
        self.empty_listing
    }

    pub fn needs_final_reply(&self) -> bool {
        self.command_status.is_preliminary()
    }

    /// Read up to `buf.len()` bytes; 0 means the server closed the channel.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(0);
        };
        let n = match timeout(self.read_timeout, stream.read(buf)).await {
            Ok(r) => r?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("data channel read timed out after {} ms", self.read_timeout.as_millis()),
                ))
            }
        };
        self.position += n as u64;
        Ok(n)
    }

    pub async fn write_chunk(&mut self, buf: &[u8]) -> io::Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "data channel is closed"));
        };
        match timeout(self.read_timeout, stream.write_all(buf)).await {
            Ok(r) => r?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("data channel write timed out after {} ms", self.read_timeout.as_millis()),
                ))
            }
        }
        self.position += buf.len() as u64;
        Ok(())
    }

    /// Drain the channel into memory (listings).
    pub async fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = self.read_chunk(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    async fn close_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let limit = self.read_timeout.max(Duration::from_millis(100));
            let _ = timeout(limit, stream.shutdown()).await;
        }
    }

    /// Close the socket and read the reply that completes the command.
    ///
    /// On a cloned channel the reply is read from the child, which is then
    /// disconnected. `pending_noops` counts keepalive NOOPs whose replies
    /// are still queued on `session`.
    pub async fn finish(mut self, session: &mut ControlSession, pending_noops: usize) -> FtpResult<FtpReply> {
        self.close_stream().await;
        let status = self.command_status.clone();
        match self.owner.take() {
            Some(mut child) => {
                let reply = if status.is_preliminary() {
                    child.read_final_reply(0).await
                } else {
                    Ok(status)
                };
                child.disconnect().await;
                reply
            }
            None if status.is_preliminary() => session.read_final_reply(pending_noops).await,
            None => Ok(status),
        }
    }

    /// Close after a failure. The pending reply (usually 426) is read and
    /// dropped so the control channel is ready for the next command.
    pub async fn abandon(mut self, session: &mut ControlSession, pending_noops: usize) {
        self.close_stream().await;
        match self.owner.take() {
            Some(mut child) => child.disconnect().await,
            None if self.command_status.is_preliminary() => {
                match session.read_final_reply(pending_noops).await {
                    Ok(reply) => log::debug!("FTP: abandoned data channel, server said {}", reply),
                    Err(e) => log::debug!("FTP: no reply after abandoning data channel: {}", e),
                }
            }
            None => {}
        }
    }
}

/// Aborts the accept task when the active-mode setup bails out.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// ─── Negotiation ─────────────────────────────────────────────────────

impl ControlSession {
    /// Open a data channel for `command` on this session.
    ///
    /// `restart` > 0 sends `REST` first. `length` is the known remote
    /// length, recorded on the channel and used for the proxy REST rule.
    pub async fn open_data_channel(
        &mut self,
        command: &str,
        restart: u64,
        length: Option<u64>,
    ) -> FtpResult<DataChannel> {
        self.check_cancelled()?;
        let mut ty = self.config().data_channel_type;
        if self.control_is_ipv6() {
            ty = match ty {
                DataChannelType::Port => DataChannelType::Eprt,
                DataChannelType::Pasv | DataChannelType::PasvEx => DataChannelType::Epsv,
                other => other,
            };
        }

        let mut channel = if ty.is_passive() {
            self.open_passive(ty, command, restart, length).await?
        } else {
            self.open_active(ty, command, restart, length).await?
        };
        if channel.stream.is_some() {
            channel.length = length;
        }
        channel.position = restart;
        Ok(channel)
    }

    /// Like [`open_data_channel`](Self::open_data_channel), but on a fresh
    /// clone when `clone_data_connections` is set. The clone belongs to the
    /// channel and is disconnected when the channel is finished.
    pub async fn open_transfer_channel(
        &mut self,
        command: &str,
        restart: u64,
        length: Option<u64>,
    ) -> FtpResult<DataChannel> {
        if !self.config().clone_data_connections || self.is_clone() {
            return self.open_data_channel(command, restart, length).await;
        }
        let mut child = self.clone_session();
        let transfer_type = self.state.transfer_type;
        let opened = async {
            child.connect().await?;
            if let Some(ty) = transfer_type {
                child.set_transfer_type(ty).await?;
            }
            child.open_data_channel(command, restart, length).await
        }
        .await;
        self.state.epsv_unsupported |= child.state.epsv_unsupported;
        match opened {
            Ok(mut channel) => {
                channel.owner = Some(Box::new(child));
                Ok(channel)
            }
            Err(e) => {
                child.disconnect().await;
                Err(e)
            }
        }
    }

    fn control_is_ipv6(&self) -> bool {
        self.state.local_addr.map_or(false, |a| a.is_ipv6())
    }

    async fn open_passive(
        &mut self,
        mut ty: DataChannelType,
        command: &str,
        restart: u64,
        length: Option<u64>,
    ) -> FtpResult<DataChannel> {
        let ipv6 = self.control_is_ipv6();
        if matches!(ty, DataChannelType::Epsv | DataChannelType::AutoPassive)
            && self.state.epsv_unsupported
            && !ipv6
        {
            ty = DataChannelType::Pasv;
        }
        let max_attempts = self.config().passive_max_attempts.max(1);
        let mut attempts = 0;

        let (host, port) = loop {
            attempts += 1;
            let endpoint = match ty {
                DataChannelType::Epsv | DataChannelType::AutoPassive => {
                    let reply = self.execute("EPSV").await?;
                    if !reply.success() {
                        if ty == DataChannelType::AutoPassive && !ipv6 && reply.is_negative() {
                            log::info!("FTP: EPSV refused ({}), falling back to PASV", reply);
                            self.state.epsv_unsupported = true;
                            ty = DataChannelType::Pasv;
                            attempts -= 1;
                            continue;
                        }
                        return Err(reply.to_error("EPSV"));
                    }
                    self.epsv_endpoint(&reply)?
                }
                DataChannelType::Pasv | DataChannelType::PasvEx => {
                    if self.has_capability(Capabilities::PRET) {
                        let reply = self.execute(&format!("PRET {}", command)).await?;
                        if !reply.success() {
                            log::debug!("FTP: PRET refused ({}), continuing with PASV", reply);
                        }
                    }
                    let reply = self.execute("PASV").await?;
                    if !reply.success() {
                        return Err(reply.to_error("PASV"));
                    }
                    self.pasv_endpoint(&reply, ty == DataChannelType::PasvEx)?
                }
                other => {
                    return Err(FtpError::invalid_config(format!("{:?} is not a passive mode", other)))
                }
            };
            if !self.config().passive_blocked_ports.contains(&endpoint.1) {
                break endpoint;
            }
            if attempts >= max_attempts {
                return Err(FtpError::data_channel(format!(
                    "Server offered only blocked ports after {} attempts",
                    attempts
                )));
            }
            log::debug!("FTP: passive port {} is blocked, asking again", endpoint.1);
        };

        log::debug!("FTP: opening passive data connection to {}:{}", host, port);
        let connector = self.connector().clone();
        let tcp = connector
            .connect(&host, port, self.config().data_connect_timeout())
            .await
            .map_err(|e| match e.kind {
                crate::ftp::error::FtpErrorKind::Timeout => e,
                _ => FtpError::data_channel(format!("Data connection to {}:{}: {}", host, port, e.message)),
            })?;

        let status = match self.issue_transfer_command(command, restart, length).await? {
            Ok(status) => status,
            Err(empty) => return Ok(empty),
        };
        self.secure_data_stream(tcp, status).await
    }

    fn epsv_endpoint(&self, reply: &FtpReply) -> FtpResult<(String, u16)> {
        let port = match parse_epsv_port(&reply.message) {
            Some(port) => port,
            // Some servers answer EPSV in PASV format.
            None => match parse_pasv_endpoint(&reply.message) {
                Some((_, port)) => port,
                None => {
                    return Err(FtpError::protocol(format!(
                        "Cannot parse EPSV reply: {}",
                        reply.message
                    )))
                }
            },
        };
        let host = match self.state.peer_addr {
            Some(addr) if !self.connector().is_proxy() => addr.ip().to_string(),
            _ => self.config().host.clone(),
        };
        Ok((host, port))
    }

    fn pasv_endpoint(&self, reply: &FtpReply, force_control_host: bool) -> FtpResult<(String, u16)> {
        let (ip, port) = parse_pasv_endpoint(&reply.message).ok_or_else(|| {
            FtpError::protocol(format!("Cannot parse PASV reply: {}", reply.message))
        })?;
        let host = resolve_passive_host(
            ip,
            &self.config().host,
            force_control_host,
            self.connector().is_proxy(),
        );
        if host != ip.to_string() {
            log::debug!("FTP: server advertised {}, connecting to {} instead", ip, host);
        }
        Ok((host, port))
    }

    async fn open_active(
        &mut self,
        mut ty: DataChannelType,
        command: &str,
        restart: u64,
        length: Option<u64>,
    ) -> FtpResult<DataChannel> {
        let ipv6 = self.control_is_ipv6();
        let local_ip = self
            .state
            .local_addr
            .map(|a| a.ip())
            .ok_or_else(|| FtpError::not_connected("No local address for active mode"))?;
        let announce_ip = match self.config().active_external_address {
            Some(ref addr) => addr.parse::<IpAddr>().map_err(|e| {
                FtpError::invalid_config(format!("Invalid active external address '{}': {}", addr, e))
            })?,
            None => local_ip,
        };

        let listener = self.bind_active_listener(local_ip).await?;
        let port = listener.local_addr()?.port();
        let mut accept = AbortOnDrop(tokio::spawn(async move { listener.accept().await }));

        loop {
            match ty {
                DataChannelType::Eprt | DataChannelType::AutoActive => {
                    let cmd = format_eprt(announce_ip, port);
                    let reply = self.execute(&cmd).await?;
                    if reply.success() {
                        break;
                    }
                    if ty == DataChannelType::AutoActive && !ipv6 && reply.is_permanent_negative() {
                        log::info!("FTP: EPRT refused ({}), falling back to PORT", reply);
                        ty = DataChannelType::Port;
                        continue;
                    }
                    return Err(reply.to_error("EPRT"));
                }
                DataChannelType::Port => {
                    let IpAddr::V4(v4) = announce_ip else {
                        return Err(FtpError::data_channel("PORT requires an IPv4 address"));
                    };
                    self.execute_ok(&format_port(v4, port)).await?;
                    break;
                }
                other => {
                    return Err(FtpError::invalid_config(format!("{:?} is not an active mode", other)))
                }
            }
        }

        let status = match self.issue_transfer_command(command, restart, length).await? {
            Ok(status) => status,
            Err(empty) => return Ok(empty),
        };

        let limit = self.config().data_connect_timeout();
        let tcp = match timeout(limit, &mut accept.0).await {
            Err(_) => {
                return Err(FtpError::timeout(format!(
                    "Server did not connect to port {} within {} ms",
                    port,
                    limit.as_millis()
                )))
            }
            Ok(Err(join)) => return Err(FtpError::data_channel(format!("Accept task failed: {}", join))),
            Ok(Ok(Err(e))) => return Err(FtpError::data_channel(format!("Accept failed: {}", e))),
            Ok(Ok(Ok((tcp, peer)))) => {
                log::debug!("FTP: active data connection from {}", peer);
                tcp
            }
        };
        tcp.set_nodelay(true).ok();
        self.secure_data_stream(tcp, status).await
    }

    async fn bind_active_listener(&self, ip: IpAddr) -> FtpResult<TcpListener> {
        if self.config().active_ports.is_empty() {
            return TcpListener::bind((ip, 0))
                .await
                .map_err(|e| FtpError::data_channel(format!("Cannot listen on {}: {}", ip, e)));
        }
        for &port in &self.config().active_ports {
            match TcpListener::bind((ip, port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    log::debug!("FTP: active port {} in use, trying next", port);
                }
                Err(e) => {
                    return Err(FtpError::data_channel(format!("Cannot listen on {}:{}: {}", ip, port, e)))
                }
            }
        }
        Err(FtpError::data_channel("All configured active ports are in use"))
    }

    /// Send REST (when restarting) and the transfer command.
    ///
    /// The outer error is a failure; the inner `Err` is the empty-listing
    /// case, already turned into a finished channel.
    async fn issue_transfer_command(
        &mut self,
        command: &str,
        restart: u64,
        length: Option<u64>,
    ) -> FtpResult<Result<FtpReply, DataChannel>> {
        if restart > 0 {
            let skip = self.connector().is_proxy() && length.map_or(false, |len| restart >= len);
            if !skip {
                self.execute_ok(&format!("REST {}", restart)).await?;
            }
        }
        let reply = self.execute(command).await?;
        if reply.is_preliminary() || reply.success() {
            return Ok(Ok(reply));
        }
        if is_empty_name_listing(command, &reply) {
            log::debug!("FTP: empty directory ({})", reply);
            return Ok(Err(DataChannel::empty(reply)));
        }
        Err(reply.to_error(command))
    }

    /// Wrap the accepted/connected socket in TLS when PROT P is active.
    async fn secure_data_stream(&mut self, tcp: TcpStream, status: FtpReply) -> FtpResult<DataChannel> {
        let read_timeout = self.config().data_read_timeout();
        let stream = if self.state.data_protected {
            let validator = self.validator();
            self.encryption_layer().activate(tcp, &validator).await?
        } else {
            FtpStream::Plain(tcp)
        };
        Ok(DataChannel::new(stream, status, read_timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::types::FtpConnectionConfig;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[test]
    fn test_parse_pasv_endpoint() {
        let (ip, port) = parse_pasv_endpoint("Entering Passive Mode (192,168,1,5,200,12)").unwrap();
        assert_eq!(ip, Ipv4Addr::new(192, 168, 1, 5));
        assert_eq!(port, 51212);
        let (ip, port) = parse_pasv_endpoint("Entering Passive Mode 10,0,0,7,4,1.").unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 7));
        assert_eq!(port, 1025);
        assert!(parse_pasv_endpoint("Entering Passive Mode (300,1,1,1,1,1)").is_none());
        assert!(parse_pasv_endpoint("nonsense").is_none());
    }

    #[test]
    fn test_parse_epsv_port() {
        assert_eq!(parse_epsv_port("Entering Extended Passive Mode (|||6446|)"), Some(6446));
        assert_eq!(parse_epsv_port("Entering Extended Passive Mode (!!!6446!)"), None);
        assert_eq!(parse_epsv_port("Extended Passive Mode OK"), None);
    }

    #[test]
    fn test_nat_correction() {
        let private = Ipv4Addr::new(192, 168, 1, 5);
        assert_eq!(resolve_passive_host(private, "ftp.example.com", false, false), "ftp.example.com");
        // behind a proxy the advertised address is used as-is
        assert_eq!(resolve_passive_host(private, "ftp.example.com", false, true), "192.168.1.5");
        let public = Ipv4Addr::new(93, 184, 216, 34);
        assert_eq!(resolve_passive_host(public, "ftp.example.com", false, false), "93.184.216.34");
        // PASVEX always dials the control host
        assert_eq!(resolve_passive_host(public, "ftp.example.com", true, false), "ftp.example.com");
    }

    #[test]
    fn test_private_address_ranges() {
        for ip in ["10.1.2.3", "172.16.0.1", "172.31.255.1", "192.168.0.1", "127.0.0.1", "0.0.0.0"] {
            assert!(is_private_address(&ip.parse().unwrap()), "{}", ip);
        }
        for ip in ["172.32.0.1", "8.8.8.8", "192.169.0.1"] {
            assert!(!is_private_address(&ip.parse().unwrap()), "{}", ip);
        }
    }

    #[test]
    fn test_active_command_format() {
        assert_eq!(format_port(Ipv4Addr::new(192, 168, 0, 2), 5282), "PORT 192,168,0,2,20,162");
        assert_eq!(format_eprt("10.0.0.1".parse().unwrap(), 2121), "EPRT |1|10.0.0.1|2121|");
        assert_eq!(format_eprt("::1".parse().unwrap(), 2121), "EPRT |2|::1|2121|");
    }

    #[test]
    fn test_empty_name_listing_detection() {
        let reply = FtpReply::new(550, "No files found.", vec![]);
        assert!(is_empty_name_listing("NLST /empty", &reply));
        assert!(!is_empty_name_listing("LIST /empty", &reply));
        let other = FtpReply::new(550, "Permission denied", vec![]);
        assert!(!is_empty_name_listing("NLST", &other));
    }

    #[tokio::test]
    async fn test_empty_channel_reads_nothing() {
        let mut channel = DataChannel::empty(FtpReply::new(550, "No files found", vec![]));
        let mut buf = [0u8; 8];
        assert_eq!(channel.read_chunk(&mut buf).await.unwrap(), 0);
        assert!(!channel.needs_final_reply());
        assert!(channel.is_empty_listing());
        assert!(channel.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_epsv_skipped_once_known_unsupported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let log = seen.clone();
        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let data = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let data_port = data.local_addr().unwrap().port();
            let (rd, mut wr) = sock.into_split();
            let mut rd = BufReader::new(rd);
            wr.write_all(b"220 ready\r\n").await.unwrap();
            let mut line = String::new();
            while rd.read_line(&mut line).await.unwrap() > 0 {
                let cmd = line.trim_end().to_string();
                log.lock().unwrap().push(cmd.clone());
                let reply = match cmd.split(' ').next().unwrap_or("") {
                    "USER" => "331 password please".to_string(),
                    "PASS" => "230 welcome".to_string(),
                    "SYST" => "215 UNIX Type: L8".to_string(),
                    "PASV" => format!(
                        "227 Entering Passive Mode (127,0,0,1,{},{})",
                        data_port >> 8,
                        data_port & 0xff
                    ),
                    "NLST" => "550 No files found".to_string(),
                    "QUIT" => "221 bye".to_string(),
                    _ => "502 not implemented".to_string(),
                };
                wr.write_all(format!("{}\r\n", reply).as_bytes()).await.unwrap();
                line.clear();
            }
            drop(data);
        });

        let mut cfg = FtpConnectionConfig::new("127.0.0.1", "a", "b");
        cfg.port = port;
        cfg.data_channel_type = DataChannelType::Epsv;
        let mut session = ControlSession::new(cfg);
        session.connect().await.unwrap();
        session.state.epsv_unsupported = true;

        let channel = session.open_data_channel("NLST", 0, None).await.unwrap();
        assert!(channel.is_empty_listing());
        session.disconnect().await;
        server.await.unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.iter().any(|c| c == "PASV"));
        assert!(!seen.iter().any(|c| c == "EPSV"));
    }
}
