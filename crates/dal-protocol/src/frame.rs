//! Packets, command framing and response reassembly.
//!
//! A [`VipaCommand`] is one logical command. [`VipaCommand::frames`] turns it
//! into the physical [`Packet`]s written to the transport: a single packet
//! when the payload fits [`PACKET_SIZE`], otherwise a chain where every
//! packet but the last carries the [`PCB_CHAINED`] bit.
//!
//! Replies travel the other way. A [`ResponseAssembler`] collects chained
//! reply packets and yields one [`VipaResponse`] per logical reply.
//!
//! # Examples
//!
//! ```
//! use dal_protocol::{DisplayMessage, VipaCommand, VipaCommandType};
//!
//! let command = VipaCommand::new(
//!     VipaCommandType::DisplayMessage,
//!     DisplayMessage::Idle.as_byte(),
//!     0x00,
//! );
//! let frames = command.frames();
//! assert_eq!(frames.len(), 1);
//! assert_eq!(frames[0].inf().as_ref(), &[0xD2, 0x01, 0x01, 0x00]);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use dal_core::constants::{
    DEFAULT_NODE_ADDRESS, DEFAULT_PCB, EXTENDED_LENGTH_MARKER, MAX_INF_LENGTH,
    MAX_SHORT_INF_LENGTH, PACKET_OVERHEAD, PACKET_SIZE, PCB_CHAINED, STATUS_WORD_LENGTH,
};
use dal_core::{Error, Result};

use crate::commands::VipaCommandType;
use crate::status::VipaStatus;

/// XOR checksum over `bytes`.
pub fn lrc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// One physical packet: `NAD | PCB | LEN | INF | LRC`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    nad: u8,
    pcb: u8,
    inf: Bytes,
}

impl Packet {
    pub fn new(nad: u8, pcb: u8, inf: impl Into<Bytes>) -> Self {
        Self {
            nad,
            pcb,
            inf: inf.into(),
        }
    }

    pub fn nad(&self) -> u8 {
        self.nad
    }

    pub fn pcb(&self) -> u8 {
        self.pcb
    }

    pub fn inf(&self) -> &Bytes {
        &self.inf
    }

    /// More packets of the same command or reply follow.
    pub fn is_chained(&self) -> bool {
        self.pcb & PCB_CHAINED != 0
    }

    /// Total encoded size including header and checksum.
    pub fn wire_len(&self) -> usize {
        let extended = if self.inf.len() > MAX_SHORT_INF_LENGTH { 2 } else { 0 };
        PACKET_OVERHEAD + extended + self.inf.len()
    }

    /// Append the wire form to `dst`.
    ///
    /// # Errors
    ///
    /// Returns `Error::FrameTooLarge` if INF exceeds the extended length form.
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<()> {
        if self.inf.len() > MAX_INF_LENGTH {
            return Err(Error::FrameTooLarge {
                size: self.inf.len(),
                max: MAX_INF_LENGTH,
            });
        }

        let start = dst.len();
        dst.reserve(self.wire_len());
        dst.put_u8(self.nad);
        dst.put_u8(self.pcb);
        if self.inf.len() > MAX_SHORT_INF_LENGTH {
            dst.put_u8(EXTENDED_LENGTH_MARKER);
            dst.put_u16(self.inf.len() as u16);
        } else {
            dst.put_u8(self.inf.len() as u8);
        }
        dst.put_slice(&self.inf);
        let checksum = lrc(&dst[start..]);
        dst.put_u8(checksum);
        Ok(())
    }

    /// Wire form as a standalone buffer.
    ///
    /// # Errors
    ///
    /// See [`Packet::encode_into`].
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// One logical command addressed to the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VipaCommand {
    command: VipaCommandType,
    p1: u8,
    p2: u8,
    data: Bytes,
    expected_length: Option<u8>,
    nad: u8,
    pcb: u8,
}

impl VipaCommand {
    /// Command with no payload to the default node address.
    pub fn new(command: VipaCommandType, p1: u8, p2: u8) -> Self {
        Self {
            command,
            p1,
            p2,
            data: Bytes::new(),
            expected_length: None,
            nad: DEFAULT_NODE_ADDRESS,
            pcb: DEFAULT_PCB,
        }
    }

    /// Attach a payload, normally TLV-encoded.
    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    /// Append `Le` to the final packet.
    pub fn with_expected_length(mut self, le: u8) -> Self {
        self.expected_length = Some(le);
        self
    }

    pub fn with_nad(mut self, nad: u8) -> Self {
        self.nad = nad;
        self
    }

    /// Base PCB; the chaining bit is managed by the framer.
    pub fn with_pcb(mut self, pcb: u8) -> Self {
        self.pcb = pcb & !PCB_CHAINED;
        self
    }

    pub fn command(&self) -> VipaCommandType {
        self.command
    }

    pub fn p1(&self) -> u8 {
        self.p1
    }

    pub fn p2(&self) -> u8 {
        self.p2
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn nad(&self) -> u8 {
        self.nad
    }

    /// Payload exceeds one packet and will be chained.
    pub fn is_chained(&self) -> bool {
        self.data.len() > PACKET_SIZE
    }

    /// Physical packets for this command, in write order.
    pub fn frames(&self) -> Vec<Packet> {
        if !self.is_chained() {
            return vec![Packet::new(
                self.nad,
                self.pcb,
                self.apdu(&self.data, self.expected_length),
            )];
        }

        let chunks: Vec<&[u8]> = self.data.chunks(PACKET_SIZE).collect();
        let last = chunks.len() - 1;
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let (pcb, le) = if i == last {
                    (self.pcb, self.expected_length)
                } else {
                    (self.pcb | PCB_CHAINED, None)
                };
                Packet::new(self.nad, pcb, self.apdu(chunk, le))
            })
            .collect()
    }

    fn apdu(&self, data: &[u8], le: Option<u8>) -> Bytes {
        let (cla, ins) = self.command.class_and_instruction();
        let mut buf = BytesMut::with_capacity(4 + 3 + data.len() + 1);
        buf.put_slice(&[cla, ins, self.p1, self.p2]);
        if !data.is_empty() {
            if data.len() > u8::MAX as usize {
                buf.put_u8(0x00);
                buf.put_u16(data.len() as u16);
            } else {
                buf.put_u8(data.len() as u8);
            }
            buf.put_slice(data);
        }
        if let Some(le) = le {
            buf.put_u8(le);
        }
        buf.freeze()
    }
}

/// One logical reply: data plus the trailing status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VipaResponse {
    pub nad: u8,
    pub pcb: u8,
    pub data: Bytes,
    pub status_word: u16,
}

impl VipaResponse {
    pub fn status(&self) -> VipaStatus {
        VipaStatus::from(self.status_word)
    }

    /// Split a complete reply INF into data and status word.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidFrame` if INF is shorter than a status word.
    pub fn from_inf(nad: u8, pcb: u8, mut inf: Bytes) -> Result<Self> {
        if inf.len() < STATUS_WORD_LENGTH {
            return Err(Error::InvalidFrame(format!(
                "reply of {} bytes has no status word",
                inf.len()
            )));
        }
        let sw = inf.split_off(inf.len() - STATUS_WORD_LENGTH);
        Ok(Self {
            nad,
            pcb,
            data: inf,
            status_word: u16::from_be_bytes([sw[0], sw[1]]),
        })
    }

    /// Single reply packet, the form a terminal uses for short replies.
    pub fn to_packet(&self) -> Packet {
        let mut inf = BytesMut::with_capacity(self.data.len() + STATUS_WORD_LENGTH);
        inf.put_slice(&self.data);
        inf.put_u16(self.status_word);
        Packet::new(self.nad, self.pcb & !PCB_CHAINED, inf.freeze())
    }
}

/// Reassembles chained reply packets.
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    pending: Option<(u8, BytesMut)>,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A chain is partially collected.
    pub fn is_collecting(&self) -> bool {
        self.pending.is_some()
    }

    /// Feed one packet. Returns the reply once the final packet arrives.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidFrame` when a chain switches node address or
    /// the final data lacks a status word. The partial chain is discarded.
    pub fn push(&mut self, packet: Packet) -> Result<Option<VipaResponse>> {
        if let Some((nad, _)) = &self.pending
            && *nad != packet.nad
        {
            let expected = *nad;
            self.pending = None;
            return Err(Error::InvalidFrame(format!(
                "chained reply switched node address from {expected:#04x} to {:#04x}",
                packet.nad
            )));
        }

        if packet.is_chained() {
            let (_, buf) = self
                .pending
                .get_or_insert_with(|| (packet.nad, BytesMut::new()));
            buf.put_slice(&packet.inf);
            return Ok(None);
        }

        let inf = match self.pending.take() {
            Some((_, mut buf)) => {
                buf.put_slice(&packet.inf);
                buf.freeze()
            }
            None => packet.inf,
        };
        VipaResponse::from_inf(packet.nad, packet.pcb, inf).map(Some)
    }

    /// Drop any partial chain.
    pub fn reset(&mut self) {
        self.pending = None;
    }
}
