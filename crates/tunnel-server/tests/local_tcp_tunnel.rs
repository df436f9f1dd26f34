//! End-to-end local TCP tunnel scenario (spec §8): a real `TunnelServer`
//! listening on a loopback TCP socket, driven by two plain `TcpStream`
//! clients speaking the wire protocol directly, exactly as a listener
//! agent and a target agent would.

use std::net::SocketAddr;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use tunnel_cloud_control::{ClientRecord, ClientStatus, MappingProtocol, MappingStatus, PortMapping};
use tunnel_proto::{CommandType, ConnectionType, FrameCodec, HandshakePayload, HandshakeRespPayload, Packet, TunnelOpenPayload};
use tunnel_server::{ServerConfig, TunnelServer};

type ClientCodec = FrameCodec<OwnedReadHalf, OwnedWriteHalf>;

async fn reserve_ephemeral_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn connect(addr: SocketAddr) -> ClientCodec {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (reader, writer) = stream.into_split();
    FrameCodec::new(reader, writer, CancellationToken::new())
}

async fn send_handshake(codec: &ClientCodec, client_id: &str, auth_code: &str, secret_key: &str, connection_type: ConnectionType) {
    codec
        .write_packet(
            &Packet::Handshake(HandshakePayload {
                client_id: client_id.to_string(),
                auth_code: auth_code.to_string(),
                secret_key: secret_key.to_string(),
                node_hint: None,
                version: 1,
                connection_type,
                reconnect: false,
            }),
            false,
            0,
        )
        .await
        .unwrap();
}

/// Control connections get a `HandshakeResp` back; tunnel-side
/// connections admit silently (they authenticate via the TunnelOpen
/// packet's secretKey instead), so the caller proceeds straight to
/// sending it.
async fn handshake_control(codec: &ClientCodec, client_id: &str, auth_code: &str, secret_key: &str) -> HandshakeRespPayload {
    send_handshake(codec, client_id, auth_code, secret_key, ConnectionType::Control).await;
    match codec.read_packet().await.unwrap().0 {
        Packet::HandshakeResp(resp) => resp,
        other => panic!("expected HandshakeResp, got {other:?}"),
    }
}

async fn build_test_server() -> (TunnelServer, SocketAddr) {
    let addr = reserve_ephemeral_port().await;
    let mut config = ServerConfig::default();
    config.listen.tcp = Some(addr);
    let server = TunnelServer::build(&config).await.unwrap();

    let cc = server.cloud_control();
    cc.insert_client(ClientRecord { client_id: "listener".to_string(), auth_code: "code-a".to_string(), secret_key: "key-a".to_string(), status: ClientStatus::Active });
    cc.insert_client(ClientRecord { client_id: "target".to_string(), auth_code: "code-b".to_string(), secret_key: "key-b".to_string(), status: ClientStatus::Active });
    cc.insert_mapping(PortMapping {
        id: "m1".to_string(),
        listen_client_id: "listener".to_string(),
        target_client_id: "target".to_string(),
        protocol: MappingProtocol::Tcp,
        listen_port: 9000,
        target_host: "127.0.0.1".to_string(),
        target_port: 5432,
        secret_key: "tunnel-secret".to_string(),
        config: Default::default(),
        status: MappingStatus::Active,
    });

    (server, addr)
}

#[tokio::test]
async fn local_tcp_tunnel_forwards_bytes_between_listener_and_target() {
    let (server, addr) = build_test_server().await;

    // The target's long-lived control connection, used to receive the
    // TunnelOpenRequest push once the listener side opens its tunnel.
    let control_b = connect(addr).await;
    let resp = handshake_control(&control_b, "target", "code-b", "key-b").await;
    assert!(resp.success, "control handshake should succeed: {:?}", resp.error);

    // The listener's physical tunnel connection.
    let tunnel_a = connect(addr).await;
    send_handshake(&tunnel_a, "listener", "", "", ConnectionType::Tunnel).await;
    tunnel_a
        .write_packet(
            &Packet::TunnelOpen(TunnelOpenPayload { tunnel_id: "t1".to_string(), mapping_id: "m1".to_string(), secret_key: "tunnel-secret".to_string(), target_host: None, target_port: None }),
            false,
            0,
        )
        .await
        .unwrap();
    match tunnel_a.read_packet().await.unwrap().0 {
        Packet::TunnelOpenAck(ack) => assert!(ack.success, "listener tunnel-open should be acked: {:?}", ack.error),
        other => panic!("expected TunnelOpenAck, got {other:?}"),
    }

    // The open request lands on B's control connection as a JsonCommand.
    let command = match control_b.read_packet().await.unwrap().0 {
        Packet::JsonCommand(command) => command,
        other => panic!("expected JsonCommand, got {other:?}"),
    };
    assert_eq!(command.command_type, CommandType::TunnelOpenRequest);
    let tunnel_id = command.body["tunnel_id"].as_str().unwrap().to_string();
    assert_eq!(tunnel_id, "t1");

    // B opens its own physical tunnel connection in response.
    let tunnel_b = connect(addr).await;
    send_handshake(&tunnel_b, "target", "", "", ConnectionType::Tunnel).await;
    tunnel_b
        .write_packet(
            &Packet::TunnelOpen(TunnelOpenPayload { tunnel_id, mapping_id: "m1".to_string(), secret_key: "tunnel-secret".to_string(), target_host: None, target_port: None }),
            false,
            0,
        )
        .await
        .unwrap();
    match tunnel_b.read_packet().await.unwrap().0 {
        Packet::TunnelOpenAck(ack) => assert!(ack.success, "target tunnel-open should be acked: {:?}", ack.error),
        other => panic!("expected TunnelOpenAck, got {other:?}"),
    }

    // Both ends are now in stream mode: raw bytes written on one arrive
    // verbatim on the other, with no further framing.
    let outbound: &[u8] = b"hello from listener";
    tunnel_a.write_exactly(outbound).await.unwrap();
    let received = tunnel_b.read_exactly(outbound.len()).await.unwrap();
    assert_eq!(received.as_slice(), outbound);

    let inbound: &[u8] = b"reply from target";
    tunnel_b.write_exactly(inbound).await.unwrap();
    let reply = tunnel_a.read_exactly(inbound.len()).await.unwrap();
    assert_eq!(reply.as_slice(), inbound);

    server.shutdown().await;
}

#[tokio::test]
async fn wrong_credentials_are_rejected_without_closing_the_connection() {
    let (server, addr) = build_test_server().await;

    let control = connect(addr).await;
    let resp = handshake_control(&control, "target", "code-b", "wrong-key").await;
    assert!(!resp.success);
    assert!(resp.error.as_deref().unwrap_or_default().contains("BAD_CREDENTIALS"));

    // The connection itself stays open after a rejected handshake; a
    // second attempt with the right credentials still succeeds.
    let retry = handshake_control(&control, "target", "code-b", "key-b").await;
    assert!(retry.success, "retry with correct credentials should succeed: {:?}", retry.error);

    server.shutdown().await;
}

#[tokio::test]
async fn oversized_frame_length_closes_the_connection() {
    use tokio::io::AsyncWriteExt;

    let (server, addr) = build_test_server().await;

    let mut raw = TcpStream::connect(addr).await.unwrap();
    // Kind byte for Handshake (0), no flags, followed by a length header
    // one byte past MAX_PACKET_LEN. The codec must reject this before
    // ever attempting to read a payload of that size.
    raw.write_all(&[0u8]).await.unwrap();
    raw.write_all(&(16u32 * 1024 * 1024 + 1).to_be_bytes()).await.unwrap();
    raw.flush().await.unwrap();

    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(std::time::Duration::from_secs(5), tokio::io::AsyncReadExt::read(&mut raw, &mut buf))
        .await
        .expect("server should close the connection promptly")
        .unwrap();
    assert_eq!(n, 0, "server should close the connection rather than read the oversized payload");

    server.shutdown().await;
}
