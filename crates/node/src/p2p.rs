use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use chainidx_params::ChainParams;
use chainidx_primitives::sha256d;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::wire::{VersionMessage, WireError, WireMessage, NODE_NETWORK};

pub const HEADER_SIZE: usize = 24;
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;
const SEND_TIMEOUT_SECS: u64 = 10;
const HANDSHAKE_READ_TIMEOUT_SECS: u64 = 30;
const CONNECT_TIMEOUT_SECS: u64 = 5;
const USER_AGENT: &str = concat!("/chainidx:", env!("CARGO_PKG_VERSION"), "/");

pub fn local_version(params: &ChainParams, start_height: i32) -> VersionMessage {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0);
    VersionMessage {
        version: params.protocol_version as i32,
        services: NODE_NETWORK,
        timestamp,
        nonce: rand::random(),
        user_agent: USER_AGENT.to_string(),
        start_height,
        relay: true,
    }
}

pub async fn connect(addr: SocketAddr) -> Result<TcpStream, WireError> {
    let stream = timeout(
        Duration::from_secs(CONNECT_TIMEOUT_SECS),
        TcpStream::connect(addr),
    )
    .await
    .map_err(|_| WireError::Timeout("connect"))??;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Full frame: magic, NUL-padded command, payload length, checksum, payload.
pub fn frame(magic: [u8; 4], message: &WireMessage) -> Result<Vec<u8>, WireError> {
    let payload = message.encode_payload()?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::Oversized(payload.len()));
    }
    let command = message.command().as_bytes();
    if command.len() > 12 {
        return Err(WireError::Schema("command too long".to_string()));
    }
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&magic);
    let mut command_bytes = [0u8; 12];
    command_bytes[..command.len()].copy_from_slice(command);
    out.extend_from_slice(&command_bytes);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let checksum = sha256d(&payload);
    out.extend_from_slice(&checksum[..4]);
    out.extend_from_slice(&payload);
    Ok(out)
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    magic: [u8; 4],
    message: &WireMessage,
) -> Result<usize, WireError> {
    let bytes = frame(magic, message)?;
    timeout(
        Duration::from_secs(SEND_TIMEOUT_SECS),
        writer.write_all(&bytes),
    )
    .await
    .map_err(|_| WireError::Timeout("write"))??;
    Ok(bytes.len())
}

pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    magic: [u8; 4],
) -> Result<WireMessage, WireError> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    if header[..4] != magic {
        return Err(WireError::Magic);
    }
    let command = header[4..16]
        .iter()
        .take_while(|byte| **byte != 0)
        .map(|byte| *byte as char)
        .collect::<String>();
    let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
    if length > MAX_PAYLOAD_SIZE {
        return Err(WireError::Oversized(length));
    }
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    let calc = sha256d(&payload);
    if header[20..24] != calc[..4] {
        return Err(WireError::Checksum);
    }
    WireMessage::decode(&command, &payload)
}

/// Exchanges `version`/`verack`, answering pings meanwhile. Returns the
/// peer's version message.
pub async fn handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    magic: [u8; 4],
    ours: VersionMessage,
) -> Result<VersionMessage, WireError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_message(writer, magic, &WireMessage::Version(ours)).await?;
    let mut got_verack = false;
    let mut theirs = None;
    while !(got_verack && theirs.is_some()) {
        let message = timeout(
            Duration::from_secs(HANDSHAKE_READ_TIMEOUT_SECS),
            read_message(reader, magic),
        )
        .await
        .map_err(|_| WireError::Timeout("handshake"))??;
        match message {
            WireMessage::Version(version) => {
                write_message(writer, magic, &WireMessage::Verack).await?;
                theirs = Some(version);
            }
            WireMessage::Verack => got_verack = true,
            WireMessage::Ping(nonce) => {
                write_message(writer, magic, &WireMessage::Pong(nonce)).await?;
            }
            _ => {}
        }
    }
    theirs.ok_or(WireError::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

    #[tokio::test]
    async fn frame_round_trips_through_reader() {
        let bytes = frame(MAGIC, &WireMessage::Ping([1, 2, 3, 4, 5, 6, 7, 8])).expect("frame");
        assert_eq!(bytes.len(), HEADER_SIZE + 8);
        assert_eq!(&bytes[4..8], b"ping");
        let mut reader = bytes.as_slice();
        let message = read_message(&mut reader, MAGIC).await.expect("read");
        assert_eq!(message, WireMessage::Ping([1, 2, 3, 4, 5, 6, 7, 8]));
    }

    #[tokio::test]
    async fn corrupt_frames_are_rejected() {
        let mut bytes = frame(MAGIC, &WireMessage::Pong([9; 8])).expect("frame");
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let mut reader = bytes.as_slice();
        assert_eq!(
            read_message(&mut reader, MAGIC).await,
            Err(WireError::Checksum)
        );

        let bytes = frame(MAGIC, &WireMessage::Verack).expect("frame");
        let mut reader = bytes.as_slice();
        assert_eq!(
            read_message(&mut reader, [0, 0, 0, 0]).await,
            Err(WireError::Magic)
        );

        let mut bytes = frame(MAGIC, &WireMessage::Verack).expect("frame");
        bytes[16..20].copy_from_slice(&((MAX_PAYLOAD_SIZE + 1) as u32).to_le_bytes());
        let mut reader = bytes.as_slice();
        assert!(matches!(
            read_message(&mut reader, MAGIC).await,
            Err(WireError::Oversized(_))
        ));
    }
}
