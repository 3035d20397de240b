//! Async framing for Bitcoin wire messages.
//!
//! A frame is a 24-byte header (magic, command, payload length, checksum)
//! followed by the payload. The header is parsed just far enough to know
//! how much to read; decoding and checksum verification are delegated to
//! the `bitcoin` codec on the reassembled frame.

use bitcoin::consensus::encode;
use bitcoin::network::message::{NetworkMessage, RawNetworkMessage};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the frame header.
pub const HEADER_LEN: usize = 24;

/// Upper bound on payload size; anything larger is a protocol violation.
pub const MAX_PAYLOAD: u32 = 32 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("wire I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad magic {got:#010x}, expected {want:#010x}")]
    BadMagic { got: u32, want: u32 },
    #[error("oversized message: {0} bytes")]
    Oversized(u32),
    #[error("codec error: {0}")]
    Codec(#[from] encode::Error),
}

/// Read one framed message. Verifies magic and length bounds here,
/// checksum and structure in the codec.
pub async fn read_message<R>(reader: &mut R, magic: u32) -> Result<RawNetworkMessage, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let got = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes"));
    if got != magic {
        return Err(WireError::BadMagic { got, want: magic });
    }

    let length = u32::from_le_bytes(header[16..20].try_into().expect("4 bytes"));
    if length > MAX_PAYLOAD {
        return Err(WireError::Oversized(length));
    }

    let mut frame = vec![0u8; HEADER_LEN + length as usize];
    frame[..HEADER_LEN].copy_from_slice(&header);
    reader.read_exact(&mut frame[HEADER_LEN..]).await?;

    Ok(encode::deserialize(&frame)?)
}

/// Serialize and send one message under the given magic.
pub async fn write_message<W>(
    writer: &mut W,
    magic: u32,
    payload: NetworkMessage,
) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let raw = RawNetworkMessage { magic, payload };
    writer.write_all(&encode::serialize(&raw)).await?;
    Ok(())
}
