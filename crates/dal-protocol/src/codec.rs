//! Tokio codec for terminal packets.
//!
//! `VipaCodec` implements [`Decoder`] and [`Encoder<Packet>`] so a serial
//! port (or any `AsyncRead + AsyncWrite`) can be wrapped in
//! `FramedRead`/`FramedWrite`.
//!
//! ```text
//! Transport -> Decoder -> Packet -> ResponseAssembler -> VipaResponse
//! VipaCommand -> frames() -> Packet -> Encoder -> Transport
//! ```
//!
//! # Error Handling
//!
//! A packet whose LRC does not match is dropped with a warning and decoding
//! resumes at the next byte boundary after it, so one corrupted packet never
//! stalls the stream. A declared length above the configured maximum is an
//! error, because the length byte itself can no longer be trusted.
//!
//! # Usage
//!
//! ```rust,no_run
//! use dal_protocol::VipaCodec;
//! use futures::StreamExt;
//! use tokio_util::codec::FramedRead;
//!
//! # async fn example(port: tokio::io::DuplexStream) -> dal_core::Result<()> {
//! let mut packets = FramedRead::new(port, VipaCodec::new());
//! while let Some(packet) = packets.next().await {
//!     println!("received {:?}", packet?);
//! }
//! # Ok(())
//! # }
//! ```

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use dal_core::constants::{EXTENDED_LENGTH_MARKER, MAX_INF_LENGTH};
use dal_core::{Error, Result};

use crate::frame::{Packet, lrc};

/// Codec for `NAD | PCB | LEN | INF | LRC` packets.
#[derive(Debug, Clone)]
pub struct VipaCodec {
    /// Largest INF accepted on decode.
    max_inf_length: usize,
    /// Packets dropped for checksum mismatches.
    dropped: u64,
}

impl Default for VipaCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl VipaCodec {
    pub fn new() -> Self {
        Self::with_max_inf_length(MAX_INF_LENGTH)
    }

    pub fn with_max_inf_length(max_inf_length: usize) -> Self {
        Self {
            max_inf_length,
            dropped: 0,
        }
    }

    pub fn max_inf_length(&self) -> usize {
        self.max_inf_length
    }

    /// Number of packets discarded because their checksum did not match.
    pub fn dropped_packets(&self) -> u64 {
        self.dropped
    }
}

impl Decoder for VipaCodec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        loop {
            if src.len() < 3 {
                return Ok(None);
            }

            let (inf_len, header_len) = if src[2] == EXTENDED_LENGTH_MARKER {
                if src.len() < 5 {
                    return Ok(None);
                }
                (u16::from_be_bytes([src[3], src[4]]) as usize, 5)
            } else {
                (src[2] as usize, 3)
            };

            if inf_len > self.max_inf_length {
                return Err(Error::FrameTooLarge {
                    size: inf_len,
                    max: self.max_inf_length,
                });
            }

            let total = header_len + inf_len + 1;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            let expected = lrc(&src[..total - 1]);
            let actual = src[total - 1];
            if expected != actual {
                self.dropped += 1;
                warn!(
                    expected = format_args!("{expected:#04x}"),
                    actual = format_args!("{actual:#04x}"),
                    "Dropping packet with bad checksum"
                );
                src.advance(total);
                continue;
            }

            let mut frame = src.split_to(total);
            let nad = frame[0];
            let pcb = frame[1];
            frame.advance(header_len);
            frame.truncate(inf_len);
            return Ok(Some(Packet::new(nad, pcb, frame.freeze())));
        }
    }
}

impl Encoder<Packet> for VipaCodec {
    type Error = Error;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<()> {
        packet.encode_into(dst)
    }
}
