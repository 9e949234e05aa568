//! Chassis test-fixture transport: turntable, cliff-sensor doors, encoders
//! (spec §4.A.2).
//!
//! Wire frame: `[sync_word:u32 = 0xA5FF00CC][length:u16][msg_type:u16][body…][crc16_kermit:u16]`,
//! big-endian. `length` covers header + body + footer (overhead = 10 bytes).
//! Grounded on `examples/original_source/backend/app/services/dut_comms/ltl_chassis_fixt_comms/chassis_transport.py`.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{EngineError, EngineResult};
use crate::transport::framing::{scan_for_sync, verify_crc16, SyncScan};

pub const SYNC_WORD: u32 = 0xA5FF_00CC;
/// sync(4) + length(2) + msg_type(2) + crc16(2).
pub const TRANSPORT_OVERHEAD: usize = 10;
const HEADER_SIZE: usize = 8;

/// Encode a chassis frame for `msg_type` carrying `body`.
pub fn encode_frame(msg_type: u16, body: &[u8]) -> Vec<u8> {
    let length = (body.len() + TRANSPORT_OVERHEAD) as u16;
    let mut header = Vec::with_capacity(HEADER_SIZE);
    header.extend_from_slice(&SYNC_WORD.to_be_bytes());
    header.extend_from_slice(&length.to_be_bytes());
    header.extend_from_slice(&msg_type.to_be_bytes());

    let mut covered = header.clone();
    covered.extend_from_slice(body);
    let crc = crate::transport::framing::crc16_kermit_wire(&covered);

    let mut frame = covered;
    frame.extend_from_slice(&crc.to_be_bytes());
    frame
}

/// Decode one frame from `reader` using the three-step sliding-window
/// detector (spec §4.A.2): scan for `sync_word`, read the declared body
/// length, then read and verify the CRC footer. Any stalled read beyond
/// `timeout` fails with `TransportTimeout`.
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
    // Step 1: slide an 8-byte window until sync_word matches.
    let sync_bytes = SYNC_WORD.to_be_bytes();
    let mut window: Vec<u8> = Vec::new();
    let header_rest;
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
            let mut rest = [0u8; HEADER_SIZE - 4];
            reader.read_exact(&mut rest).await.map_err(EngineError::Io)?;
            header_rest = rest;
            break;
        }
    }

    let length = u16::from_be_bytes([header_rest[0], header_rest[1]]) as usize;
    let msg_type = u16::from_be_bytes([header_rest[2], header_rest[3]]);

    if length < TRANSPORT_OVERHEAD {
        return Err(EngineError::FrameTruncated {
            expected: TRANSPORT_OVERHEAD,
            actual: length,
        });
    }
    let body_len = length - TRANSPORT_OVERHEAD;

    // Step 2: read the body.
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await.map_err(EngineError::Io)?;

    // Step 3: read the CRC footer and verify.
    let mut footer = [0u8; 2];
    reader
        .read_exact(&mut footer)
        .await
        .map_err(EngineError::Io)?;
    let received_crc = u16::from_be_bytes(footer);

    let mut covered = Vec::with_capacity(HEADER_SIZE + body_len);
    covered.extend_from_slice(&sync_bytes);
    covered.extend_from_slice(&header_rest);
    covered.extend_from_slice(&body);
    verify_crc16(&covered, received_crc)?;

    Ok((msg_type, body))
}

/// Write a pre-encoded frame to `writer`.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> EngineResult<()>
where
    W: AsyncWrite + Unpin + Send,
{
    writer.write_all(frame).await.map_err(EngineError::Io)?;
    writer.flush().await.map_err(EngineError::Io)?;
    Ok(())
}
