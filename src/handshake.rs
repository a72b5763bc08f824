//! Protocol-initiation header exchange.
//!
//! The first eight bytes on a fresh transport are `{'A','M','Q','P', class,
//! instance, major, minor}`. The exchange is deliberately stateless and
//! byte-level: on any mismatch the engine advertises its own preferred
//! header and closes the transport, before the rest of the engine runs.

use bincode::{Decode, Encode, config, decode_from_slice, encode_into_slice};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::HandshakeError;

/// Protocol magic prefix.
pub const PROTOCOL_MAGIC: [u8; 4] = *b"AMQP";

/// Encoded size of a protocol header.
pub const HEADER_LEN: usize = 8;

fn wire_config() -> impl config::Config {
    config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

/// The 8-byte protocol-initiation header.
///
/// # Examples
///
/// ```
/// use amqwire::ProtocolHeader;
///
/// let header = ProtocolHeader::AMQP_0_10;
/// assert_eq!(&header.to_bytes()[..4], b"AMQP");
/// assert_eq!(ProtocolHeader::from_bytes(header.to_bytes()).unwrap(), header);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub struct ProtocolHeader {
    magic: [u8; 4],
    /// Protocol class octet.
    pub class: u8,
    /// Protocol instance octet.
    pub instance: u8,
    /// Major protocol version.
    pub major: u8,
    /// Minor protocol version.
    pub minor: u8,
}

impl ProtocolHeader {
    /// The version this engine speaks.
    pub const AMQP_0_10: Self = Self::new(1, 1, 0, 10);

    /// Construct a header with the protocol magic.
    #[must_use]
    pub const fn new(class: u8, instance: u8, major: u8, minor: u8) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            class,
            instance,
            major,
            minor,
        }
    }

    /// Encode into the 8-byte wire form.
    #[must_use]
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        // A fixed-size struct of byte fields always fits the buffer.
        encode_into_slice(self, &mut buf, wire_config())
            .expect("protocol header encodes into 8 bytes");
        buf
    }

    /// Decode a received header, validating only the magic.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::HeaderMismatch`] when the magic differs.
    pub fn from_bytes(bytes: [u8; HEADER_LEN]) -> Result<Self, HandshakeError> {
        let (header, _) = decode_from_slice::<Self, _>(&bytes, wire_config())
            .map_err(|_| HandshakeError::HeaderMismatch {
                found: [bytes[0], bytes[1], bytes[2], bytes[3]],
            })?;
        if header.magic != PROTOCOL_MAGIC {
            return Err(HandshakeError::HeaderMismatch {
                found: header.magic,
            });
        }
        Ok(header)
    }

    /// Check a peer header against the version this engine supports.
    ///
    /// Each octet is validated in order, yielding the typed error for the
    /// first mismatch.
    ///
    /// # Errors
    ///
    /// Returns the typed mismatch for the first unsupported octet.
    pub fn negotiate(self, supported: Self) -> Result<(), HandshakeError> {
        if self.class != supported.class {
            return Err(HandshakeError::ProtocolClass {
                found: self.class,
                supported: supported.class,
            });
        }
        if self.instance != supported.instance {
            return Err(HandshakeError::ProtocolInstance {
                found: self.instance,
                supported: supported.instance,
            });
        }
        if self.major != supported.major {
            return Err(HandshakeError::ProtocolMajor {
                found: self.major,
                supported: supported.major,
            });
        }
        if self.minor != supported.minor {
            return Err(HandshakeError::ProtocolMinor {
                found: self.minor,
                supported: supported.minor,
            });
        }
        Ok(())
    }
}

/// Read one protocol header off the transport.
///
/// # Errors
///
/// Returns [`HandshakeError::Io`] if the transport fails before eight bytes
/// arrive, or [`HandshakeError::HeaderMismatch`] for a bad magic.
pub async fn read_header<R>(reader: &mut R) -> Result<ProtocolHeader, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut buf).await?;
    ProtocolHeader::from_bytes(buf)
}

/// Write a protocol header to the transport.
///
/// # Errors
///
/// Returns [`HandshakeError::Io`] on transport failure.
pub async fn write_header<W>(writer: &mut W, header: ProtocolHeader) -> Result<(), HandshakeError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&header.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Accept a peer's header, always advertising `supported` in reply.
///
/// On success the broker's own header has been written and the transport is
/// ready to switch to frame mode. On failure the preferred header has still
/// been emitted (except for I/O errors) and the caller must close the
/// transport.
///
/// # Errors
///
/// Returns the typed mismatch or the underlying I/O failure.
pub async fn accept<T>(io: &mut T, supported: ProtocolHeader) -> Result<(), HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let outcome = async {
        let header = read_header(io).await?;
        header.negotiate(supported)
    }
    .await;
    match outcome {
        Ok(()) => {
            write_header(io, supported).await?;
            Ok(())
        }
        Err(err) => {
            if err.wants_header_reply() {
                write_header(io, supported).await?;
            }
            Err(err)
        }
    }
}
