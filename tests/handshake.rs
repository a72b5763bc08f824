//! Protocol-initiation exchange over a real byte stream.

use amqwire::{HandshakeError, ProtocolHeader, handshake};
use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

mod common;
use common::TestResult;

/// A garbage header is answered with the broker's advertised header.
#[tokio::test]
async fn bad_magic_gets_the_broker_header_back() -> TestResult {
    let (mut client, mut server) = duplex(64);
    let broker = tokio::spawn(async move {
        handshake::accept(&mut server, ProtocolHeader::AMQP_0_10).await
    });

    client.write_all(b"PQMA\x00\x00\x00\x00").await?;
    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await?;
    assert_eq!(reply, ProtocolHeader::AMQP_0_10.to_bytes());

    let outcome = broker.await?;
    assert!(matches!(
        outcome,
        Err(HandshakeError::HeaderMismatch { found }) if &found == b"PQMA"
    ));
    Ok(())
}

/// A version mismatch is typed by the first differing octet.
#[tokio::test]
async fn minor_version_mismatch_is_typed() -> TestResult {
    let (mut client, mut server) = duplex(64);
    let broker = tokio::spawn(async move {
        handshake::accept(&mut server, ProtocolHeader::AMQP_0_10).await
    });

    client
        .write_all(&ProtocolHeader::new(1, 1, 0, 9).to_bytes())
        .await?;
    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await?;
    assert_eq!(reply, ProtocolHeader::AMQP_0_10.to_bytes());

    assert!(matches!(
        broker.await?,
        Err(HandshakeError::ProtocolMinor { found: 9, supported: 10 })
    ));
    Ok(())
}

/// A matching header is answered with the broker's own advertisement and
/// frame mode may begin.
#[tokio::test]
async fn matching_header_is_accepted() -> TestResult {
    let (mut client, mut server) = duplex(64);
    let broker = tokio::spawn(async move {
        handshake::accept(&mut server, ProtocolHeader::AMQP_0_10).await
    });

    client
        .write_all(&ProtocolHeader::AMQP_0_10.to_bytes())
        .await?;
    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await?;
    assert_eq!(reply, ProtocolHeader::AMQP_0_10.to_bytes());
    assert!(broker.await?.is_ok());
    Ok(())
}
