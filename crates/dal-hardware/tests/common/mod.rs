//! Scripted fake terminal for driver integration tests.
//!
//! The terminal sits on the far end of a `tokio::io::duplex` pipe, decodes
//! the packets the driver writes, records each logical command and answers
//! through a responder closure. A responder returning no packets leaves the
//! command unanswered, the way a terminal waiting on the cardholder does.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use dal_core::constants::PCB_CHAINED;
use dal_protocol::{Packet, Tlv, TlvCodec, VipaCodec, VipaCommandType};
use dal_hardware::VipaConnection;

pub const TEST_SERIAL: &str = "275-123-456";
pub const TEST_MODEL: &str = "P400";
pub const TEST_PAN: &str = "4111111111111111";

/// One logical command as the terminal received it.
#[derive(Debug, Clone)]
pub struct ReceivedCommand {
    pub nad: u8,
    pub command: Option<VipaCommandType>,
    pub p1: u8,
    pub p2: u8,
    /// Physical packets the command arrived in.
    pub frames: usize,
}

impl ReceivedCommand {
    pub fn is(&self, command: VipaCommandType) -> bool {
        self.command == Some(command)
    }
}

pub type Responder = Box<dyn FnMut(&ReceivedCommand) -> Vec<Packet> + Send>;

#[derive(Debug, Clone, Default)]
pub struct Received(Arc<Mutex<Vec<ReceivedCommand>>>);

impl Received {
    pub fn all(&self) -> Vec<ReceivedCommand> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, command: VipaCommandType) -> usize {
        self.all().iter().filter(|c| c.is(command)).count()
    }

    pub fn last(&self, command: VipaCommandType) -> Option<ReceivedCommand> {
        self.all().into_iter().rev().find(|c| c.is(command))
    }
}

/// Connection to a fake terminal driven by `responder`.
pub fn spawn_terminal(responder: Responder) -> (VipaConnection, Received) {
    let (connection, received, _hangup) = spawn_closable_terminal(responder);
    (connection, received)
}

/// Like [`spawn_terminal`]; cancelling the token drops the terminal's end of
/// the pipe, as an unplugged cable would.
pub fn spawn_closable_terminal(
    mut responder: Responder,
) -> (VipaConnection, Received, CancellationToken) {
    let (host, terminal) = tokio::io::duplex(8 * 1024);
    let received = Received::default();
    let log = received.clone();
    let hangup = CancellationToken::new();
    let unplugged = hangup.clone();

    tokio::spawn(async move {
        let (read_half, write_half) = tokio::io::split(terminal);
        let mut packets = FramedRead::new(read_half, VipaCodec::new());
        let mut replies = FramedWrite::new(write_half, VipaCodec::new());
        let mut frames = 0;

        loop {
            let packet = tokio::select! {
                _ = unplugged.cancelled() => break,
                next = packets.next() => match next {
                    Some(Ok(packet)) => packet,
                    _ => break,
                },
            };
            frames += 1;
            if packet.is_chained() {
                continue;
            }
            let inf = packet.inf();
            let command = ReceivedCommand {
                nad: packet.nad(),
                command: VipaCommandType::from_opcode(u16::from_be_bytes([inf[0], inf[1]])),
                p1: inf[2],
                p2: inf[3],
                frames,
            };
            frames = 0;
            log.0.lock().unwrap().push(command.clone());

            for reply in responder(&command) {
                if replies.send(reply).await.is_err() {
                    return;
                }
            }
        }
    });

    (VipaConnection::open("FAKE0", host), received, hangup)
}

/// Single-packet reply to `command` with `data` and `status_word`.
pub fn reply(command: &ReceivedCommand, data: &[u8], status_word: u16) -> Vec<Packet> {
    let mut inf = BytesMut::with_capacity(data.len() + 2);
    inf.put_slice(data);
    inf.put_u16(status_word);
    vec![Packet::new(command.nad, 0x00, inf.freeze())]
}

/// Reply split into chained packets of `chunk` bytes.
pub fn chained_reply(
    command: &ReceivedCommand,
    data: &[u8],
    status_word: u16,
    chunk: usize,
) -> Vec<Packet> {
    let mut inf = BytesMut::with_capacity(data.len() + 2);
    inf.put_slice(data);
    inf.put_u16(status_word);
    let pieces: Vec<Bytes> = inf.chunks(chunk).map(Bytes::copy_from_slice).collect();
    let last = pieces.len() - 1;
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| {
            let pcb = if i == last { 0x00 } else { PCB_CHAINED };
            Packet::new(command.nad, pcb, piece)
        })
        .collect()
}

pub fn device_info(serial: &str, model: &str) -> Bytes {
    TlvCodec::new().encode(&[Tlv::container(
        [0xEE],
        vec![
            Tlv::leaf([0xDF, 0x0D], model.as_bytes().to_vec()),
            Tlv::leaf([0x9F, 0x1E], serial.as_bytes().to_vec()),
            Tlv::leaf([0xDF, 0x7F], b"VOS3 1.0.4".to_vec()),
        ],
    )])
}

pub fn manual_entry_data(pan: &str) -> Bytes {
    TlvCodec::new().encode(&[Tlv::container(
        [0xE0],
        vec![
            Tlv::leaf([0x5A], pan.as_bytes().to_vec()),
            Tlv::leaf([0x5F, 0x24], b"2512".to_vec()),
        ],
    )])
}

pub fn card_status(icc: u8, msr: u8) -> Bytes {
    TlvCodec::new().encode(&[Tlv::container(
        [0xE0],
        vec![Tlv::leaf([0x48], vec![icc, msr])],
    )])
}

/// Answers every command with success; reset carries the test identity and
/// manual entry returns the test PAN.
pub fn standard_responder() -> Responder {
    Box::new(|command| match command.command {
        Some(VipaCommandType::ResetDevice) => {
            reply(command, &device_info(TEST_SERIAL, TEST_MODEL), 0x9000)
        }
        Some(VipaCommandType::ManualPanEntry) => {
            reply(command, &manual_entry_data(TEST_PAN), 0x9000)
        }
        Some(VipaCommandType::CardStatus) => reply(command, &card_status(0x01, 0x00), 0x9000),
        _ => reply(command, &[], 0x9000),
    })
}

/// Like [`standard_responder`], with `override_for` answering `command`.
pub fn responder_with(
    command: VipaCommandType,
    mut override_for: impl FnMut(&ReceivedCommand) -> Vec<Packet> + Send + 'static,
) -> Responder {
    let mut standard = standard_responder();
    Box::new(move |received| {
        if received.is(command) {
            override_for(received)
        } else {
            standard(received)
        }
    })
}
