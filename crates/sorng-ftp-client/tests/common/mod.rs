//! Scripted in-process FTP server for integration tests.

#![allow(dead_code)]

use sorng_ftp_client::ftp::{DataChannelType, FtpConnectionConfig};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const USER: &str = "a";
pub const PASSWORD: &str = "b";

#[derive(Debug, Clone, Default)]
pub struct MockOptions {
    /// Answer EPSV with 500.
    pub refuse_epsv: bool,
    /// Drop the data socket of the first RETR after this many bytes.
    pub break_first_retr_at: Option<usize>,
    /// Preferred PASV data port; an ephemeral one is used when taken.
    pub pasv_port: Option<u16>,
    /// Advertise `port` in the first `count` PASV replies without listening on it.
    pub decoy_pasv: Option<(u16, usize)>,
    /// Accept EPRT and PORT.
    pub active: bool,
    /// Answer EPRT with 500 (PORT still works when `active` is set).
    pub refuse_eprt: bool,
    /// List PRET in FEAT and answer it with 550.
    pub refused_pret: bool,
    /// Follow every NOOP reply with an unsolicited line.
    pub stale_after_noop: bool,
    /// Send RETR data in 1 KiB pieces 20 ms apart, answering NOOPs in between.
    pub trickle_retr: bool,
    /// Keep the RETR data socket open until the client closes it.
    pub hold_retr_open: bool,
    /// Reset the data socket of the first STOR after this many bytes.
    pub break_first_stor_at: Option<usize>,
}

struct Shared {
    options: MockOptions,
    files: Mutex<HashMap<String, Vec<u8>>>,
    commands: Mutex<Vec<String>>,
    retr_count: AtomicUsize,
    stor_count: AtomicUsize,
    pasv_count: AtomicUsize,
}

pub struct MockServer {
    pub port: u16,
    pub host: String,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MockServer {
    pub async fn start(options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve_on(listener, options)
    }

    /// Server on `[::1]`; `None` when the host has no IPv6 loopback.
    pub async fn start_v6(options: MockOptions) -> Option<Self> {
        let listener = TcpListener::bind("[::1]:0").await.ok()?;
        Some(Self::serve_on(listener, options))
    }

    fn serve_on(listener: TcpListener, options: MockOptions) -> Self {
        let addr = listener.local_addr().unwrap();
        let port = addr.port();
        let host = addr.ip().to_string();
        let shared = Arc::new(Shared {
            options,
            files: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            retr_count: AtomicUsize::new(0),
            stor_count: AtomicUsize::new(0),
            pasv_count: AtomicUsize::new(0),
        });
        let state = shared.clone();
        let task = tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                let state = state.clone();
                tokio::spawn(async move {
                    let _ = serve(sock, state).await;
                });
            }
        });
        Self { port, host, shared, task }
    }

    pub fn config(&self) -> FtpConnectionConfig {
        let mut cfg = FtpConnectionConfig::new(self.host.clone(), USER, PASSWORD);
        cfg.port = self.port;
        cfg.data_channel_type = DataChannelType::Pasv;
        cfg.connect_timeout_ms = 5_000;
        cfg.read_timeout_ms = 5_000;
        cfg.data_connect_timeout_ms = 5_000;
        cfg.data_read_timeout_ms = 5_000;
        cfg
    }

    pub fn add_file(&self, path: &str, data: &[u8]) {
        self.shared.files.lock().unwrap().insert(path.to_string(), data.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.shared.files.lock().unwrap().get(path).cloned()
    }

    pub fn commands(&self) -> Vec<String> {
        self.shared.commands.lock().unwrap().clone()
    }

    /// Commands received with the given verb.
    pub fn count(&self, verb: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.split(' ').next().map_or(false, |v| v.eq_ignore_ascii_case(verb)))
            .count()
    }
}

/// Deterministic test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn reply(wr: &mut OwnedWriteHalf, line: &str) -> io::Result<()> {
    wr.write_all(format!("{}\r\n", line).as_bytes()).await
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(parent, _)| parent)
}

async fn bind_data_listener(ip: IpAddr, preferred: Option<u16>) -> io::Result<TcpListener> {
    if let Some(port) = preferred {
        if let Ok(listener) = TcpListener::bind((ip, port)).await {
            return Ok(listener);
        }
    }
    TcpListener::bind((ip, 0)).await
}

/// Where the next data connection comes from.
enum DataTarget {
    Listen(TcpListener),
    Dial(SocketAddr),
}

async fn open_data(target: Option<DataTarget>) -> io::Result<TcpStream> {
    let limit = Duration::from_secs(5);
    match target {
        Some(DataTarget::Listen(listener)) => {
            let (sock, _) = timeout(limit, listener.accept())
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "data accept"))??;
            Ok(sock)
        }
        Some(DataTarget::Dial(addr)) => timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "data connect"))?,
        None => Err(io::Error::new(io::ErrorKind::NotConnected, "no data port negotiated")),
    }
}

/// `|1|127.0.0.1|5282|`
fn parse_eprt(arg: &str) -> Option<SocketAddr> {
    let parts: Vec<&str> = arg.split('|').collect();
    if parts.len() < 4 {
        return None;
    }
    let ip: IpAddr = parts[2].parse().ok()?;
    let port: u16 = parts[3].parse().ok()?;
    Some(SocketAddr::new(ip, port))
}

/// `127,0,0,1,20,162`
fn parse_port(arg: &str) -> Option<SocketAddr> {
    let n: Vec<u8> = arg.split(',').filter_map(|p| p.trim().parse().ok()).collect();
    if n.len() != 6 {
        return None;
    }
    let ip = Ipv4Addr::new(n[0], n[1], n[2], n[3]);
    Some(SocketAddr::new(IpAddr::V4(ip), (u16::from(n[4]) << 8) + u16::from(n[5])))
}

/// Answer NOOPs that arrive while a transfer is running.
async fn answer_pending_noops(
    rd: &mut BufReader<OwnedReadHalf>,
    wr: &mut OwnedWriteHalf,
    shared: &Shared,
) -> io::Result<()> {
    let mut pending = Vec::new();
    while let Ok(Ok(n)) = timeout(Duration::from_millis(5), rd.read_until(b'\n', &mut pending)).await {
        if n == 0 {
            break;
        }
        let cmd = String::from_utf8_lossy(&pending).trim_end().to_string();
        pending.clear();
        let noop = cmd.eq_ignore_ascii_case("NOOP");
        shared.commands.lock().unwrap().push(cmd);
        if noop {
            reply(wr, "200 OK").await?;
        } else {
            reply(wr, "503 Transfer in progress").await?;
        }
    }
    Ok(())
}

async fn serve(sock: TcpStream, shared: Arc<Shared>) -> io::Result<()> {
    let local_ip = sock.local_addr()?.ip();
    let (rd, mut wr) = sock.into_split();
    let mut rd = BufReader::new(rd);
    reply(&mut wr, "220 mock ready").await?;

    let options = shared.options.clone();
    let mut data: Option<DataTarget> = None;
    let mut rest = 0usize;
    let mut rename_from: Option<String> = None;
    let mut line = String::new();

    loop {
        line.clear();
        if rd.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let cmd = line.trim_end().to_string();
        shared.commands.lock().unwrap().push(cmd.clone());
        let (verb, arg) = match cmd.split_once(' ') {
            Some((v, a)) => (v.to_ascii_uppercase(), a.to_string()),
            None => (cmd.to_ascii_uppercase(), String::new()),
        };

        match verb.as_str() {
            "USER" => reply(&mut wr, "331 Password required").await?,
            "PASS" if arg == PASSWORD => reply(&mut wr, "230 Logged in").await?,
            "PASS" => reply(&mut wr, "530 Login incorrect").await?,
            "FEAT" => {
                let pret = if options.refused_pret { " PRET\r\n" } else { "" };
                let feat = format!("211-Features:\r\n SIZE\r\n MDTM\r\n REST STREAM\r\n{}211 End\r\n", pret);
                wr.write_all(feat.as_bytes()).await?
            }
            "SYST" => reply(&mut wr, "215 UNIX Type: L8").await?,
            "TYPE" => reply(&mut wr, "200 Type set").await?,
            "NOOP" if options.stale_after_noop => {
                wr.write_all(b"200 OK\r\n213 unsolicited leftover\r\n").await?
            }
            "NOOP" => reply(&mut wr, "200 OK").await?,
            "PWD" => reply(&mut wr, "257 \"/\" is the current directory").await?,
            "CWD" => reply(&mut wr, "250 Directory changed").await?,
            "MKD" => reply(&mut wr, &format!("257 \"{}\" created", arg)).await?,
            "DELE" => {
                let removed = shared.files.lock().unwrap().remove(&arg).is_some();
                if removed {
                    reply(&mut wr, "250 Deleted").await?
                } else {
                    reply(&mut wr, "550 File not found").await?
                }
            }
            "RNFR" => {
                rename_from = Some(arg);
                reply(&mut wr, "350 Ready for RNTO").await?
            }
            "RNTO" => {
                let renamed = {
                    let mut files = shared.files.lock().unwrap();
                    match rename_from.take().and_then(|from| files.remove(&from)) {
                        Some(data) => {
                            files.insert(arg, data);
                            true
                        }
                        None => false,
                    }
                };
                if renamed {
                    reply(&mut wr, "250 Renamed").await?
                } else {
                    reply(&mut wr, "550 File not found").await?
                }
            }
            "SIZE" => {
                let len = shared.files.lock().unwrap().get(&arg).map(|d| d.len());
                match len {
                    Some(len) => reply(&mut wr, &format!("213 {}", len)).await?,
                    None => reply(&mut wr, "550 File not found").await?,
                }
            }
            "MDTM" => {
                let exists = shared.files.lock().unwrap().contains_key(&arg);
                if exists {
                    reply(&mut wr, "213 20240102030405").await?
                } else {
                    reply(&mut wr, "550 File not found").await?
                }
            }
            "REST" => {
                rest = arg.parse().unwrap_or(0);
                reply(&mut wr, &format!("350 Restarting at {}", rest)).await?
            }
            "PRET" if options.refused_pret => reply(&mut wr, "550 PRET not accepted").await?,
            "EPSV" if options.refuse_epsv => reply(&mut wr, "500 EPSV not understood").await?,
            "EPSV" => {
                let listener = bind_data_listener(local_ip, None).await?;
                let port = listener.local_addr()?.port();
                data = Some(DataTarget::Listen(listener));
                reply(&mut wr, &format!("229 Entering Extended Passive Mode (|||{}|)", port)).await?
            }
            "PASV" => {
                let nth = shared.pasv_count.fetch_add(1, Ordering::SeqCst);
                let port = match options.decoy_pasv {
                    Some((decoy, count)) if nth < count => {
                        data = None;
                        decoy
                    }
                    _ => {
                        let listener = bind_data_listener(IpAddr::V4(Ipv4Addr::LOCALHOST), options.pasv_port).await?;
                        let port = listener.local_addr()?.port();
                        data = Some(DataTarget::Listen(listener));
                        port
                    }
                };
                reply(
                    &mut wr,
                    &format!("227 Entering Passive Mode (127,0,0,1,{},{})", port >> 8, port & 0xff),
                )
                .await?
            }
            "EPRT" if options.active && !options.refuse_eprt => match parse_eprt(&arg) {
                Some(addr) => {
                    data = Some(DataTarget::Dial(addr));
                    reply(&mut wr, "200 EPRT command successful").await?
                }
                None => reply(&mut wr, "501 Bad EPRT argument").await?,
            },
            "EPRT" if options.refuse_eprt => reply(&mut wr, "500 EPRT not understood").await?,
            "PORT" if options.active => match parse_port(&arg) {
                Some(addr) => {
                    data = Some(DataTarget::Dial(addr));
                    reply(&mut wr, "200 PORT command successful").await?
                }
                None => reply(&mut wr, "501 Bad PORT argument").await?,
            },
            "RETR" if arg.starts_with("private/") => {
                data = None;
                reply(&mut wr, "530 Permission denied").await?
            }
            "RETR" => {
                let file = shared.files.lock().unwrap().get(&arg).cloned();
                let start = std::mem::take(&mut rest);
                let Some(file) = file else {
                    data = None;
                    reply(&mut wr, &format!("550 {}: No such file or directory", arg)).await?;
                    continue;
                };
                reply(&mut wr, "150 Opening BINARY mode data connection").await?;
                let mut ds = open_data(data.take()).await?;
                let start = start.min(file.len());
                let first = shared.retr_count.fetch_add(1, Ordering::SeqCst) == 0;
                match options.break_first_retr_at {
                    Some(cut) if first && cut > start && cut < file.len() => {
                        ds.write_all(&file[start..cut]).await?;
                        drop(ds);
                        reply(&mut wr, "426 Connection closed; transfer aborted").await?;
                        continue;
                    }
                    _ => {}
                }
                if options.trickle_retr {
                    for piece in file[start..].chunks(1024) {
                        ds.write_all(piece).await?;
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        answer_pending_noops(&mut rd, &mut wr, &shared).await?;
                    }
                } else {
                    ds.write_all(&file[start..]).await?;
                }
                if options.hold_retr_open {
                    let mut scratch = [0u8; 64];
                    let _ = timeout(Duration::from_secs(5), ds.read(&mut scratch)).await;
                } else {
                    let _ = ds.shutdown().await;
                }
                drop(ds);
                reply(&mut wr, "226 Transfer complete").await?
            }
            "STOR" | "APPE" => {
                reply(&mut wr, "150 Ok to send data").await?;
                let mut ds = open_data(data.take()).await?;
                let start = std::mem::take(&mut rest);
                let first = verb == "STOR" && shared.stor_count.fetch_add(1, Ordering::SeqCst) == 0;
                let (received, broken) = match options.break_first_stor_at {
                    Some(cut) if first => {
                        let mut part = vec![0u8; cut];
                        ds.read_exact(&mut part).await?;
                        // zero linger turns the close into a reset
                        #[allow(deprecated)]
                        ds.set_linger(Some(Duration::ZERO))?;
                        drop(ds);
                        (part, true)
                    }
                    _ => {
                        let mut received = Vec::new();
                        ds.read_to_end(&mut received).await?;
                        (received, false)
                    }
                };
                {
                    let mut files = shared.files.lock().unwrap();
                    let entry = files.entry(arg).or_default();
                    if verb == "STOR" {
                        entry.truncate(start);
                    }
                    entry.extend_from_slice(&received);
                }
                if broken {
                    reply(&mut wr, "426 Connection reset; transfer aborted").await?
                } else {
                    reply(&mut wr, "226 Transfer complete").await?
                }
            }
            "NLST" | "LIST" => {
                let dir = arg.trim_matches('/').to_string();
                let mut entries: Vec<(String, usize)> = shared
                    .files
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|(path, _)| parent_of(path.trim_start_matches('/')) == dir)
                    .map(|(path, data)| (path.rsplit('/').next().unwrap_or(path).to_string(), data.len()))
                    .collect();
                entries.sort();
                if entries.is_empty() && verb == "NLST" {
                    data = None;
                    reply(&mut wr, "550 No files found").await?;
                    continue;
                }
                reply(&mut wr, "150 Here comes the listing").await?;
                let mut ds = open_data(data.take()).await?;
                for (name, len) in entries {
                    let line = if verb == "NLST" {
                        format!("{}\r\n", name)
                    } else {
                        format!("-rw-r--r-- 1 ftp ftp {} Jan 01 00:00 {}\r\n", len, name)
                    };
                    ds.write_all(line.as_bytes()).await?;
                }
                ds.shutdown().await?;
                drop(ds);
                reply(&mut wr, "226 Directory send OK").await?
            }
            "QUIT" => {
                reply(&mut wr, "221 Goodbye").await?;
                return Ok(());
            }
            _ => reply(&mut wr, "502 Command not implemented").await?,
        }
    }
}
