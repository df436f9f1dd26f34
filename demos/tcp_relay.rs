//! Example: TCP tunnel through a `TunnelServer` exit node.
//!
//! This demonstrates a complete local TCP tunnel:
//! 1. Start a local TCP echo server (the "target" service).
//! 2. Build and run a `TunnelServer` node on a loopback TCP listener.
//! 3. Seed the node's in-memory client directory with a listener and a
//!    target client, and a port mapping between them.
//! 4. Drive the wire protocol directly from two plain `TcpStream`s,
//!    exactly as a listener agent and a target agent would, to open
//!    the tunnel and forward bytes between it and the echo server.
//!
//! Run this example:
//! ```bash
//! cargo run --example tcp_relay
//! ```

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use tunnel_cloud_control::{ClientRecord, ClientStatus, MappingProtocol, MappingStatus, PortMapping};
use tunnel_proto::{ConnectionType, FrameCodec, HandshakePayload, Packet, TunnelOpenPayload};
use tunnel_server::{ServerConfig, TunnelServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("Step 1: starting local TCP echo server on 127.0.0.1:6000...");
    let echo_listener = TcpListener::bind("127.0.0.1:6000").await?;
    tokio::spawn(async move {
        loop {
            let (mut socket, addr) = match echo_listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    eprintln!("echo accept error: {e}");
                    continue;
                }
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) => {
                            println!("  [echo] {addr} disconnected");
                            break;
                        }
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
        }
    });
    println!("echo server ready\n");

    println!("Step 2: building tunnel-server node on 127.0.0.1:4443...");
    let mut config = ServerConfig::default();
    config.listen.tcp = Some("127.0.0.1:4443".parse()?);
    let server = TunnelServer::build(&config).await?;
    server.spawn_heartbeat_sweep();
    println!("node listening\n");

    println!("Step 3: seeding clients and a port mapping...");
    let cc = server.cloud_control();
    cc.insert_client(ClientRecord { client_id: "listener".to_string(), auth_code: "listener-code".to_string(), secret_key: "listener-key".to_string(), status: ClientStatus::Active });
    cc.insert_client(ClientRecord { client_id: "echo-target".to_string(), auth_code: "target-code".to_string(), secret_key: "target-key".to_string(), status: ClientStatus::Active });
    cc.insert_mapping(PortMapping {
        id: "demo-mapping".to_string(),
        listen_client_id: "listener".to_string(),
        target_client_id: "echo-target".to_string(),
        protocol: MappingProtocol::Tcp,
        listen_port: 9000,
        target_host: "127.0.0.1".to_string(),
        target_port: 6000,
        secret_key: "demo-tunnel-secret".to_string(),
        config: Default::default(),
        status: MappingStatus::Active,
    });
    println!("client directory seeded\n");

    println!("Step 4: opening the tunnel from both sides...");
    let addr: std::net::SocketAddr = "127.0.0.1:4443".parse()?;

    let target_control = connect(addr).await;
    send_handshake(&target_control, "echo-target", "target-code", "target-key", ConnectionType::Control).await;
    let _ = target_control.read_packet().await?;

    let listener_tunnel = connect(addr).await;
    send_handshake(&listener_tunnel, "listener", "", "", ConnectionType::Tunnel).await;
    listener_tunnel
        .write_packet(
            &Packet::TunnelOpen(TunnelOpenPayload { tunnel_id: "demo-tunnel".to_string(), mapping_id: "demo-mapping".to_string(), secret_key: "demo-tunnel-secret".to_string(), target_host: None, target_port: None }),
            false,
            0,
        )
        .await?;
    let _ = listener_tunnel.read_packet().await?;

    let target_open_command = match target_control.read_packet().await?.0 {
        Packet::JsonCommand(command) => command,
        other => return Err(format!("expected JsonCommand, got {other:?}").into()),
    };
    let tunnel_id = target_open_command.body["tunnel_id"].as_str().unwrap_or("demo-tunnel").to_string();

    let target_tunnel = connect(addr).await;
    send_handshake(&target_tunnel, "echo-target", "", "", ConnectionType::Tunnel).await;
    target_tunnel
        .write_packet(
            &Packet::TunnelOpen(TunnelOpenPayload { tunnel_id, mapping_id: "demo-mapping".to_string(), secret_key: "demo-tunnel-secret".to_string(), target_host: None, target_port: None }),
            false,
            0,
        )
        .await?;
    let _ = target_tunnel.read_packet().await?;

    println!("tunnel open\n");

    println!("Step 5: forwarding a message through the tunnel...");
    let message = b"hello through the tunnel";
    listener_tunnel.write_exactly(message).await?;
    let echoed = target_tunnel.read_exactly(message.len()).await?;
    println!("  [target physical end] received: {}", String::from_utf8_lossy(&echoed));

    // The raw bytes above land at the tunnel's target physical end; a
    // real target agent would forward them on to 127.0.0.1:6000 and
    // relay the echo back the same way. This example stops at the
    // tunnel boundary since no such agent exists in this workspace.

    println!("\nPress Ctrl+C to stop...");
    tokio::signal::ctrl_c().await?;
    server.shutdown().await;
    Ok(())
}

type ClientCodec = FrameCodec<tokio::net::tcp::OwnedReadHalf, tokio::net::tcp::OwnedWriteHalf>;

async fn connect(addr: std::net::SocketAddr) -> ClientCodec {
    let stream = TcpStream::connect(addr).await.expect("connect to tunnel-server");
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
        .expect("write handshake");
}
