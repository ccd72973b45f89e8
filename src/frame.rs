//! MLLP-style block framing for outbound messages.
//!
//! Every message sent to the hub is wrapped as
//! `START_BLOCK + body + END_BLOCK + CARRIAGE_RETURN`.

use tokio::io::{AsyncWrite, AsyncWriteExt};

pub const START_BLOCK: u8 = 0x0B;
pub const END_BLOCK: u8 = 0x1C;
pub const CARRIAGE_RETURN: u8 = 0x0D;

const FRAME_OVERHEAD: usize = 3;
// Inbound frames larger than this are discarded by the decoder
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Wrap a body in block markers.
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() + FRAME_OVERHEAD);
    frame.push(START_BLOCK);
    frame.extend_from_slice(body);
    frame.push(END_BLOCK);
    frame.push(CARRIAGE_RETURN);
    frame
}

/// Writes framed messages to an open stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameWriter;

impl FrameWriter {
    pub fn new() -> Self {
        Self
    }

    /// Frame `body` and write it out in a single `write_all`, then flush.
    pub async fn write<W>(&self, stream: &mut W, body: &[u8]) -> std::io::Result<usize>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let frame = encode_frame(body);
        stream.write_all(&frame).await?;
        stream.flush().await?;
        Ok(frame.len())
    }
}

/// Incremental decoder splitting a byte stream into frame bodies.
///
/// Bytes outside a start block are skipped. A frame is complete once the
/// `END_BLOCK CARRIAGE_RETURN` pair is seen.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    in_frame: bool,
    discarded_bytes: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the decoder, returning every body completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();

        for &byte in bytes {
            if !self.in_frame {
                if byte == START_BLOCK {
                    self.in_frame = true;
                    self.buffer.clear();
                } else {
                    self.discarded_bytes += 1;
                }
                continue;
            }

            if byte == START_BLOCK {
                // Unterminated frame followed by a new one
                self.discarded_bytes += self.buffer.len() as u64;
                self.buffer.clear();
                continue;
            }

            if byte == CARRIAGE_RETURN && self.buffer.last() == Some(&END_BLOCK) {
                self.buffer.pop();
                frames.push(std::mem::take(&mut self.buffer));
                self.in_frame = false;
                continue;
            }

            self.buffer.push(byte);
            if self.buffer.len() > MAX_FRAME_SIZE {
                self.discarded_bytes += self.buffer.len() as u64;
                self.buffer.clear();
                self.in_frame = false;
            }
        }

        frames
    }

    /// Bytes that did not belong to any complete frame so far.
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded_bytes
    }

    pub fn has_partial_frame(&self) -> bool {
        self.in_frame
    }
}
