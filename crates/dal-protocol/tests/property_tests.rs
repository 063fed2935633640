//! Property-based tests for the TLV codec and command framer.
//!
//! Trees are generated with template tags on containers and non-template
//! tags on leaves, which is the shape the decoder reproduces.

mod common;

use bytes::Bytes;
use proptest::prelude::*;

use dal_core::constants::PACKET_SIZE;
use dal_protocol::{ResponseAssembler, Tlv, TlvCodec, VipaCommand, VipaCommandType};

/// Leaf tags: single-byte, two-byte and three-byte forms, none registered as templates.
fn leaf_tag() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        Just(vec![0x5A]),
        Just(vec![0x48]),
        Just(vec![0x9F, 0x1E]),
        Just(vec![0x5F, 0x24]),
        Just(vec![0xDF, 0x0D]),
        Just(vec![0xDF, 0xA2, 0x0E]),
    ]
}

fn template_tag() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        Just(vec![0xE0]),
        Just(vec![0xE1]),
        Just(vec![0xE4]),
        Just(vec![0xEE]),
        Just(vec![0xEF]),
    ]
}

/// Data length skewed toward the length-form boundaries.
fn leaf_data() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        4 => prop::collection::vec(any::<u8>(), 0..300),
        1 => prop::collection::vec(any::<u8>(), 60_000..=65_535),
    ]
}

fn tlv_tree() -> impl Strategy<Value = Tlv> {
    let leaf = (leaf_tag(), prop::collection::vec(any::<u8>(), 0..200))
        .prop_map(|(tag, data)| Tlv::leaf(tag, data));
    leaf.prop_recursive(4, 32, 6, |inner| {
        (template_tag(), prop::collection::vec(inner, 0..6))
            .prop_map(|(tag, children)| Tlv::container(tag, children))
    })
}

proptest! {
    /// Property: decode(encode(tree)) reproduces the tree.
    #[test]
    fn prop_tlv_round_trip(tree in prop::collection::vec(tlv_tree(), 0..4)) {
        let codec = TlvCodec::new();
        let bytes = codec.encode(&tree);
        prop_assert_eq!(codec.decode(&bytes).unwrap(), tree);
    }

    /// Property: leaves up to the two-byte length limit survive a round trip.
    #[test]
    fn prop_large_leaf_round_trip(tag in leaf_tag(), data in leaf_data()) {
        let tree = vec![Tlv::container([0xE0], vec![Tlv::leaf(tag, data)])];
        let codec = TlvCodec::new();
        prop_assert_eq!(codec.decode(&codec.encode(&tree)).unwrap(), tree);
    }

    /// Property: lenient decoding never panics on arbitrary input.
    #[test]
    fn prop_lenient_decode_total(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = TlvCodec::new().decode_lenient(&bytes);
    }

    /// Property: the framer emits ceil(len / PACKET_SIZE) packets, all but
    /// the last chained, and the chunks concatenate to the payload.
    #[test]
    fn prop_framer_chains_payload(len in 1usize..(PACKET_SIZE * 4)) {
        let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
        let frames = VipaCommand::new(VipaCommandType::DisplayHtml, 0, 0)
            .with_data(payload.clone())
            .frames();

        prop_assert_eq!(frames.len(), len.div_ceil(PACKET_SIZE));
        let last = frames.len() - 1;
        let mut joined = Vec::new();
        for (i, frame) in frames.iter().enumerate() {
            prop_assert_eq!(frame.is_chained(), i != last);
            let inf = frame.inf();
            let chunk_len = inf.len() - 4;
            // Lc is one byte up to 255 bytes, three bytes above
            let lc_len = if chunk_len > 256 { 3 } else { 1 };
            joined.extend_from_slice(&inf[4 + lc_len..]);
        }
        prop_assert_eq!(joined, payload);
    }

    /// Property: a reply split into any chunk size reassembles to the same data.
    #[test]
    fn prop_reply_reassembly(
        data in prop::collection::vec(any::<u8>(), 0..2048),
        chunk in 1usize..600,
    ) {
        let mut assembler = ResponseAssembler::new();
        let mut reply = None;
        for packet in common::reply_packets(&data, 0x9000, chunk) {
            reply = assembler.push(packet).unwrap();
        }
        let reply = reply.unwrap();
        prop_assert_eq!(reply.data, Bytes::from(data));
        prop_assert_eq!(reply.status_word, 0x9000);
    }
}
