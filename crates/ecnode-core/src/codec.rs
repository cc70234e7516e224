//! Packet stream codec.
//!
//! Reads and writes [`Packet`]s on any async byte stream. A read validates
//! the magic before touching the payload and bounds both the result message
//! and the payload, so a corrupt header can never make us allocate or wait
//! for an arbitrary amount of data.

use std::io;
use std::time::Duration;

use ecnode_proto::constants::PACKET_HEADER_SIZE;
use ecnode_proto::defaults::{DEFAULT_MAX_PAYLOAD_SIZE, DEFAULT_MAX_RESULT_MSG_LEN};
use ecnode_proto::{EcError, EcResult, Packet};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Read one packet.
///
/// `deadline` bounds the whole read; `None` waits forever, which is only
/// appropriate for trusted long-lived links.
///
/// Errors:
/// - `NetworkError`: the peer closed the connection before sending anything
/// - `Timeout`: the deadline elapsed
/// - `MalformedPacket`: bad magic, oversize lengths, or a truncated stream
pub async fn read_packet<R>(reader: &mut R, deadline: Option<Duration>) -> EcResult<Packet>
where
    R: AsyncRead + Unpin,
{
    match deadline {
        Some(d) => tokio::time::timeout(d, read_packet_inner(reader))
            .await
            .map_err(|_| EcError::Timeout)?,
        None => read_packet_inner(reader).await,
    }
}

async fn read_packet_inner<R>(reader: &mut R) -> EcResult<Packet>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; PACKET_HEADER_SIZE];

    // A clean close between packets is not a protocol error.
    reader
        .read_exact(&mut header[..1])
        .await
        .map_err(|_| EcError::NetworkError)?;
    reader
        .read_exact(&mut header[1..])
        .await
        .map_err(truncated)?;

    let (mut packet, msg_len) = Packet::decode_header(&header)?;

    if msg_len > DEFAULT_MAX_RESULT_MSG_LEN as usize {
        debug!("result message too long: {} bytes", msg_len);
        return Err(EcError::MalformedPacket);
    }
    if packet.size > DEFAULT_MAX_PAYLOAD_SIZE {
        debug!("payload too large: {} bytes", packet.size);
        return Err(EcError::MalformedPacket);
    }

    if msg_len > 0 {
        let mut msg = vec![0u8; msg_len];
        reader.read_exact(&mut msg).await.map_err(truncated)?;
        packet.result_msg = String::from_utf8_lossy(&msg).into_owned();
    }

    let payload_len = packet.wire_payload_len();
    if payload_len > 0 {
        let mut data = vec![0u8; payload_len];
        reader.read_exact(&mut data).await.map_err(truncated)?;
        packet.data = data;
    }

    Ok(packet)
}

fn truncated(e: io::Error) -> EcError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        EcError::MalformedPacket
    } else {
        EcError::NetworkError
    }
}

/// Write one packet and flush.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> EcResult<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = packet.encode();
    writer
        .write_all(&buf)
        .await
        .map_err(|_| EcError::NetworkError)?;
    writer.flush().await.map_err(|_| EcError::NetworkError)?;
    Ok(())
}
