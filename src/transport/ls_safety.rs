//! LS safety transport: DUT telemetry messages (spec §4.A.3).
//!
//! Frame: `[sync:u16 = 0xCAFE][length:u16][crc:u32][msg_format:u16][reserved:u16][body…]`,
//! little-endian. CRC32 covers bytes from offset 8 onward (format + body).
//! Grounded on `examples/original_source/backend/app/services/dut_comms/ls_comms/`.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{EngineError, EngineResult};
use crate::transport::framing::{crc32_iso_hdlc, scan_for_sync, verify_crc32, SyncScan};

pub const SYNC_WORD: u16 = 0xCAFE;
pub const HEADER_SIZE: usize = 12;

/// Encode an LS-safety frame for `msg_format` carrying `body`.
pub fn encode_frame(msg_format: u16, reserved: u16, body: &[u8]) -> Vec<u8> {
    let length = (HEADER_SIZE + body.len()) as u16;

    let mut crc_covered = Vec::with_capacity(4 + body.len());
    crc_covered.extend_from_slice(&msg_format.to_le_bytes());
    crc_covered.extend_from_slice(&reserved.to_le_bytes());
    crc_covered.extend_from_slice(body);
    let crc = crc32_iso_hdlc(&crc_covered);

    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
    frame.extend_from_slice(&SYNC_WORD.to_le_bytes());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&crc_covered);
    frame
}

/// Decode one frame using the three-step sliding-window detector adapted to
/// the 12-byte LS header (spec §4.A.3).
pub async fn decode_frame<R>(reader: &mut R, timeout: Duration) -> EngineResult<(u16, Vec<u8>)>
where
    R: AsyncRead + Unpin + Send,
{
    tokio::time::timeout(timeout, decode_frame_inner(reader))
        .await
        .map_err(|_| EngineError::TransportTimeout(timeout))?
}

async fn decode_frame_inner<R>(reader: &mut R) -> EngineResult<(u16, Vec<u8>)>
where
    R: AsyncRead + Unpin + Send,
{
    let sync_bytes = SYNC_WORD.to_le_bytes();
    let mut window: Vec<u8> = Vec::new();
    let rest;
    loop {
        let mut byte = [0u8; 1];
        reader
            .read_exact(&mut byte)
            .await
            .map_err(EngineError::Io)?;
        window.push(byte[0]);
        if window.len() > sync_bytes.len() {
            window.remove(0);
        }
        if let SyncScan::Found { .. } = scan_for_sync(&window, &sync_bytes) {
            let mut r = [0u8; HEADER_SIZE - 2];
            reader.read_exact(&mut r).await.map_err(EngineError::Io)?;
            rest = r;
            break;
        }
    }

    let length = u16::from_le_bytes([rest[0], rest[1]]) as usize;
    let crc = u32::from_le_bytes([rest[2], rest[3], rest[4], rest[5]]);
    let msg_format = u16::from_le_bytes([rest[6], rest[7]]);
    let reserved = [rest[8], rest[9]];

    if length < HEADER_SIZE {
        return Err(EngineError::FrameTruncated {
            expected: HEADER_SIZE,
            actual: length,
        });
    }
    let body_len = length - HEADER_SIZE;
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await.map_err(EngineError::Io)?;

    let mut crc_covered = Vec::with_capacity(4 + body_len);
    crc_covered.extend_from_slice(&msg_format.to_le_bytes());
    crc_covered.extend_from_slice(&reserved);
    crc_covered.extend_from_slice(&body);
    verify_crc32(&crc_covered, crc)?;

    Ok((msg_format, body))
}

pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> EngineResult<()>
where
    W: AsyncWrite + Unpin + Send,
{
    writer.write_all(frame).await.map_err(EngineError::Io)?;
    writer.flush().await.map_err(EngineError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trip_decodes_identical_message() {
        let frame = encode_frame(0x01, 0x00, b"TELEMETRY");
        let mut cursor = Cursor::new(frame);
        let (msg_format, body) = decode_frame(&mut cursor, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(msg_format, 0x01);
        assert_eq!(body, b"TELEMETRY");
    }

    #[tokio::test]
    async fn header_bit_flip_yields_crc_error() {
        let mut frame = encode_frame(0x01, 0x00, b"TELEMETRY");
        frame[6] ^= 0x01; // flip a bit inside msg_format (CRC-covered)
        let mut cursor = Cursor::new(frame);
        let err = decode_frame(&mut cursor, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::FrameCrcError { .. }));
    }
}
