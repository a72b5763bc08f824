//! End-to-end: the broker driver serving a real TCP client.

use std::sync::Arc;

use amqwire::{
    ConnectionDriver,
    DriverConfig,
    EngineConfig,
    Frame,
    Method,
    SessionRegistry,
    codec::WireCodec,
    frame::FrameBody,
    handshake::{self, ProtocolHeader},
    method::{AcceptMode, ConnectionMethod, MessageMethod},
    reconnect::{ConnectionOptions, ReconnectController, TcpConnector},
};
use futures::{SinkExt, StreamExt};
use tokio::{io::DuplexStream, net::TcpListener};
use tokio_util::{codec::Framed, sync::CancellationToken};

mod common;
use common::{RecordingSink, TestResult};

async fn spawn_broker(config: EngineConfig) -> TestResult<(String, Arc<RecordingSink>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    let sink = RecordingSink::new();
    let registry = Arc::new(SessionRegistry::default());
    let accept_sink = sink.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let config = config.clone();
            let sink = accept_sink.clone();
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                if let Ok(driver) = ConnectionDriver::accept(
                    stream,
                    config,
                    DriverConfig::default(),
                    sink,
                    registry,
                    CancellationToken::new(),
                )
                .await
                {
                    let _ = driver.run().await;
                }
            });
        }
    });
    Ok((addr, sink))
}

/// A real client negotiates, attaches a session, and learns the broker's
/// advertised hosts.
#[tokio::test]
async fn client_negotiates_and_attaches_over_tcp() -> TestResult {
    let mut config = EngineConfig::default();
    config.known_hosts = vec!["standby:5672".to_owned()];
    let (addr, _sink) = spawn_broker(config).await?;

    let mut controller =
        ReconnectController::new(addr.clone(), ConnectionOptions::default(), TcpConnector);
    controller.add_session("e2e", false);
    controller.open().await?;

    assert!(controller.is_open());
    assert_eq!(controller.urls(), [addr, "standby:5672".to_owned()]);
    Ok(())
}

/// Two sessions resume over one connection on distinct channels.
#[tokio::test]
async fn multiple_sessions_share_one_connection() -> TestResult {
    let (addr, _sink) = spawn_broker(EngineConfig::default()).await?;

    let mut controller =
        ReconnectController::new(addr, ConnectionOptions::default(), TcpConnector);
    controller.add_session("first", false);
    controller.add_session("second", false);
    controller.open().await?;
    assert!(controller.is_open());
    Ok(())
}

/// Drive the client half of the negotiation over an in-memory transport.
async fn negotiate_client(
    mut io: DuplexStream,
) -> TestResult<Framed<DuplexStream, WireCodec>> {
    handshake::write_header(&mut io, ProtocolHeader::AMQP_0_10).await?;
    let echoed = handshake::read_header(&mut io).await?;
    echoed.negotiate(ProtocolHeader::AMQP_0_10)?;

    let mut framed = Framed::new(io, WireCodec::default());
    loop {
        let frame = framed
            .next()
            .await
            .ok_or("transport closed during negotiation")??;
        match frame.as_method() {
            Some((Method::Connection(ConnectionMethod::Start { .. }), _)) => {
                framed
                    .send(Frame::method(
                        0,
                        Method::Connection(ConnectionMethod::StartOk {
                            client_properties: Vec::new(),
                            mechanism: "ANONYMOUS".into(),
                            response: Vec::new(),
                            locale: "en_US".into(),
                        }),
                    ))
                    .await?;
            }
            Some((Method::Connection(ConnectionMethod::Tune { .. }), _)) => {
                framed
                    .send(Frame::method(
                        0,
                        Method::Connection(ConnectionMethod::TuneOk {
                            channel_max: 0,
                            max_frame_size: 0,
                            heartbeat: 0,
                        }),
                    ))
                    .await?;
                framed
                    .send(Frame::method(
                        0,
                        Method::Connection(ConnectionMethod::Open {
                            virtual_host: String::new(),
                        }),
                    ))
                    .await?;
            }
            Some((Method::Connection(ConnectionMethod::OpenOk { .. }), _)) => {
                return Ok(framed);
            }
            _ => {}
        }
    }
}

fn dangling_transfer(channel: u16) -> Frame {
    Frame::transfer_open(
        channel,
        Method::Message(MessageMethod::Transfer {
            destination: "q".into(),
            accept_mode: AcceptMode::None,
        }),
        false,
    )
}

/// An outbound frameset interleaved by a pushing task is an engine-side
/// invariant violation: the driver must close the connection with
/// `InternalError` instead of forwarding the corrupted frames.
#[tokio::test]
async fn interleaved_push_closes_the_connection() -> TestResult {
    let (client_io, server_io) = tokio::io::duplex(4096);
    let sink = RecordingSink::new();
    let registry = Arc::new(SessionRegistry::default());

    let client = tokio::spawn(negotiate_client(client_io));
    let driver = ConnectionDriver::accept(
        server_io,
        EngineConfig::default(),
        DriverConfig::default(),
        sink,
        registry,
        CancellationToken::new(),
    )
    .await?;
    let handle = driver.push_handle();
    let run = tokio::spawn(driver.run());
    let mut framed = client.await??;

    // A second method frame on channel 7 while its frameset is still open.
    handle.push(vec![dangling_transfer(7)]).await?;
    handle.push(vec![dangling_transfer(7)]).await?;

    let mut transfers = 0usize;
    let mut close_code = None;
    while let Some(frame) = framed.next().await {
        match &frame?.body {
            FrameBody::Method {
                method: Method::Message(MessageMethod::Transfer { .. }),
                ..
            } => transfers += 1,
            FrameBody::Method {
                method: Method::Connection(ConnectionMethod::Close { reply_code, .. }),
                ..
            } => close_code = Some(*reply_code),
            _ => {}
        }
    }

    // The legal first frame may arrive; the interleaving one never does.
    assert!(transfers <= 1, "corrupted frameset was forwarded");
    assert_eq!(
        close_code,
        Some(amqwire::error::ConnectionCloseCode::InternalError)
    );
    run.await??;
    Ok(())
}
