mod common;

use common::{payload, MockOptions, MockServer};
use sorng_ftp_client::ftp::*;

async fn download(session: &mut ControlSession, path: &str) -> Vec<u8> {
    let mut out = Vec::new();
    assert!(session
        .download_stream(&mut out, path, 0, LengthHint::Unknown, None)
        .await
        .unwrap());
    out
}

#[tokio::test]
async fn test_download_over_eprt() {
    let server = MockServer::start(MockOptions {
        active: true,
        ..Default::default()
    })
    .await;
    let data = payload(5_000);
    server.add_file("test.bin", &data);

    let mut cfg = server.config();
    cfg.data_channel_type = DataChannelType::Eprt;
    let mut session = ControlSession::new(cfg);
    session.connect().await.unwrap();

    assert_eq!(download(&mut session, "test.bin").await, data);
    let eprt: Vec<String> = server.commands().into_iter().filter(|c| c.starts_with("EPRT")).collect();
    assert_eq!(eprt.len(), 1);
    assert!(eprt[0].starts_with("EPRT |1|127.0.0.1|"));
    assert_eq!(server.count("PASV"), 0);
    assert_eq!(server.count("PORT"), 0);
}

#[tokio::test]
async fn test_auto_active_falls_back_to_port() {
    let server = MockServer::start(MockOptions {
        active: true,
        refuse_eprt: true,
        ..Default::default()
    })
    .await;
    let data = payload(3_000);
    server.add_file("test.bin", &data);

    let mut cfg = server.config();
    cfg.data_channel_type = DataChannelType::AutoActive;
    let mut session = ControlSession::new(cfg);
    session.connect().await.unwrap();

    assert_eq!(download(&mut session, "test.bin").await, data);
    assert_eq!(server.count("EPRT"), 1);
    let port: Vec<String> = server.commands().into_iter().filter(|c| c.starts_with("PORT ")).collect();
    assert_eq!(port.len(), 1);
    assert!(port[0].starts_with("PORT 127,0,0,1,"));
}

#[tokio::test]
async fn test_blocked_passive_port_is_requested_again() {
    let server = MockServer::start(MockOptions {
        decoy_pasv: Some((1, 2)),
        ..Default::default()
    })
    .await;
    let data = payload(1_000);
    server.add_file("test.bin", &data);

    let mut cfg = server.config();
    cfg.passive_blocked_ports = vec![1];
    let mut session = ControlSession::new(cfg);
    session.connect().await.unwrap();

    assert_eq!(download(&mut session, "test.bin").await, data);
    assert_eq!(server.count("PASV"), 3);
}

#[tokio::test]
async fn test_only_blocked_passive_ports_gives_up() {
    let server = MockServer::start(MockOptions {
        decoy_pasv: Some((1, usize::MAX)),
        ..Default::default()
    })
    .await;
    server.add_file("test.bin", &payload(100));

    let mut cfg = server.config();
    cfg.passive_blocked_ports = vec![1];
    cfg.passive_max_attempts = 3;
    let mut session = ControlSession::new(cfg);
    session.connect().await.unwrap();

    let mut out = Vec::new();
    let err = session
        .download_stream(&mut out, "test.bin", 0, LengthHint::Known(100), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, FtpErrorKind::DataChannelFailed);
    assert_eq!(server.count("PASV"), 3);
    assert_eq!(server.count("RETR"), 0);
    assert_eq!(session.noop().await.unwrap().code, Some(200));
}

#[tokio::test]
async fn test_pret_precedes_pasv_and_refusal_is_ignored() {
    let server = MockServer::start(MockOptions {
        refused_pret: true,
        ..Default::default()
    })
    .await;
    let data = payload(2_000);
    server.add_file("test.bin", &data);

    let mut session = ControlSession::new(server.config());
    session.connect().await.unwrap();
    assert!(session.has_capability(Capabilities::PRET));

    assert_eq!(download(&mut session, "test.bin").await, data);
    let cmds = server.commands();
    let pret = cmds.iter().position(|c| c == "PRET RETR test.bin").unwrap();
    assert_eq!(cmds[pret + 1], "PASV");
}

#[tokio::test]
async fn test_ipv6_control_forces_extended_commands() {
    let Some(passive) = MockServer::start_v6(MockOptions::default()).await else {
        return;
    };
    let data = payload(1_500);
    passive.add_file("test.bin", &data);

    let mut session = ControlSession::new(passive.config());
    session.connect().await.unwrap();
    assert_eq!(download(&mut session, "test.bin").await, data);
    assert_eq!(passive.count("EPSV"), 1);
    assert_eq!(passive.count("PASV"), 0);
    session.disconnect().await;

    let Some(active) = MockServer::start_v6(MockOptions {
        active: true,
        ..Default::default()
    })
    .await
    else {
        return;
    };
    active.add_file("test.bin", &data);
    let mut cfg = active.config();
    cfg.data_channel_type = DataChannelType::Port;
    let mut session = ControlSession::new(cfg);
    session.connect().await.unwrap();
    assert_eq!(download(&mut session, "test.bin").await, data);
    let eprt: Vec<String> = active.commands().into_iter().filter(|c| c.starts_with("EPRT")).collect();
    assert_eq!(eprt.len(), 1);
    assert!(eprt[0].starts_with("EPRT |2|::1|"));
    assert_eq!(active.count("PORT"), 0);
}
