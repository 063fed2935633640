//! Common helpers for protocol integration tests.
//!
//! Replies are built the way a terminal sends them: data followed by the
//! status word, split into chained packets when the test asks for it.

#![allow(dead_code)]

use bytes::{BufMut, Bytes, BytesMut};
use dal_core::constants::{DEFAULT_NODE_ADDRESS, PCB_CHAINED};
use dal_protocol::{Packet, Tlv, TlvCodec, VipaCodec};
use tokio_util::codec::Encoder;

/// Standard test serial number.
pub const TEST_SERIAL: &str = "275-123-456";

/// TLV body of a reset reply carrying device identification.
pub fn device_info_tlv(serial: &str, model: &str) -> Bytes {
    TlvCodec::new().encode(&[Tlv::container(
        [0xE1],
        vec![
            Tlv::leaf([0xDF, 0x0D], model.as_bytes().to_vec()),
            Tlv::leaf([0x9F, 0x1E], serial.as_bytes().to_vec()),
            Tlv::leaf([0xDF, 0x7F], b"VOS2 1.2.3".to_vec()),
        ],
    )])
}

/// Reply packets for `data` + `status_word`, chained in `chunk` sized pieces.
pub fn reply_packets(data: &[u8], status_word: u16, chunk: usize) -> Vec<Packet> {
    let mut inf = BytesMut::with_capacity(data.len() + 2);
    inf.put_slice(data);
    inf.put_u16(status_word);
    let inf = inf.freeze();

    let pieces: Vec<Bytes> = inf.chunks(chunk).map(Bytes::copy_from_slice).collect();
    let last = pieces.len() - 1;
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| {
            let pcb = if i == last { 0x00 } else { PCB_CHAINED };
            Packet::new(DEFAULT_NODE_ADDRESS, pcb, piece)
        })
        .collect()
}

/// Wire bytes of several packets back to back.
pub fn wire(packets: &[Packet]) -> BytesMut {
    let mut codec = VipaCodec::new();
    let mut buf = BytesMut::new();
    for packet in packets {
        codec
            .encode(packet.clone(), &mut buf)
            .expect("test packet encodes");
    }
    buf
}
