// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Tests for the frame codec

use std::io::Cursor;

use tcpmpi::net::codec::{
    decode_header, deserialize_payload, encode_header, read_frame, serialize_payload, write_frame, Frame,
    FrameDecoder, Header, HEADER_LEN,
};
use tcpmpi::net::MessageKind;
use tcpmpi::Code;

// =========================================================================
// Blocking reads and writes
// =========================================================================

#[test]
fn test_frame_round_trip_sizes() {
    for len in [0usize, 1, 4096, 10_000_000] {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let frame = Frame::new(5, 42, 3, MessageKind::User, payload);

        let mut wire = Vec::new();
        write_frame(&mut wire, &frame).unwrap();
        assert_eq!(wire.len(), HEADER_LEN + len);

        let mut reader = Cursor::new(wire);
        let decoded = read_frame(&mut reader).unwrap().unwrap();
        assert_eq!(decoded, frame, "payload of {} bytes", len);
        assert!(read_frame(&mut reader).unwrap().is_none());
    }
    println!("✓ frames of 0, 1, 4096 and 10M bytes survive the wire");
}

#[test]
fn test_close_inside_a_frame_is_broken_connection() {
    let frame = Frame::new(1, 7, 0, MessageKind::User, vec![9; 64]);
    let mut wire = frame.to_bytes();
    wire.truncate(HEADER_LEN + 10);

    let err = read_frame(&mut Cursor::new(wire)).unwrap_err();
    assert_eq!(err.code(), Code::ConnectionBroken);

    let mut short_header = frame.to_bytes();
    short_header.truncate(HEADER_LEN / 2);
    let err = read_frame(&mut Cursor::new(short_header)).unwrap_err();
    assert_eq!(err.code(), Code::ConnectionBroken);
    println!("✓ truncated frames are reported as broken connections");
}

#[test]
fn test_negative_fields_survive() {
    let header = Header {
        sender: -1,
        tag: -1152,
        payload_len: 0,
        comm_id: 1 << 40,
        kind: MessageKind::Ping,
    };
    assert_eq!(decode_header(&encode_header(&header)).unwrap(), header);
    println!("✓ negative senders and tags are encoded as signed 64-bit values");
}

#[test]
fn test_unknown_kind_is_rejected() {
    let mut raw = encode_header(&Header {
        sender: 0,
        tag: 0,
        payload_len: 0,
        comm_id: 0,
        kind: MessageKind::User,
    });
    raw[32..40].copy_from_slice(&99i64.to_be_bytes());
    assert!(decode_header(&raw).is_err());
    println!("✓ unknown message kinds are rejected");
}

#[test]
fn test_out_of_range_rank_and_tag_are_rejected() {
    let header = Header {
        sender: 3,
        tag: 9,
        payload_len: 0,
        comm_id: 0,
        kind: MessageKind::User,
    };

    let mut raw = encode_header(&header);
    raw[0..8].copy_from_slice(&(1i64 << 32).to_be_bytes());
    let err = decode_header(&raw).unwrap_err();
    assert_eq!(err.code(), Code::ConnectionBroken);

    let mut raw = encode_header(&header);
    raw[8..16].copy_from_slice(&(i64::from(i32::MIN) - 1).to_be_bytes());
    assert_eq!(decode_header(&raw).unwrap_err().code(), Code::ConnectionBroken);

    // The extremes of i32 still decode
    let edge = Header {
        sender: i32::MAX,
        tag: i32::MIN,
        ..header
    };
    assert_eq!(decode_header(&encode_header(&edge)).unwrap(), edge);
    println!("✓ header ranks and tags outside i32 are broken frames, not truncated");
}

// =========================================================================
// Incremental decoding
// =========================================================================

#[test]
fn test_decoder_handles_byte_at_a_time() {
    let frames = vec![
        Frame::new(0, 1, 0, MessageKind::User, b"first".to_vec()),
        Frame::new(2, -16, 9, MessageKind::SyncUser, Vec::new()),
        Frame::new(3, 8, 0, MessageKind::User, vec![7; 300]),
    ];
    let wire: Vec<u8> = frames.iter().flat_map(|f| f.to_bytes()).collect();

    let mut decoder = FrameDecoder::new();
    let mut decoded = Vec::new();
    for byte in wire {
        decoder.push(&[byte]);
        while let Some(frame) = decoder.next_frame().unwrap() {
            decoded.push(frame);
        }
    }
    assert_eq!(decoded, frames);
    assert!(decoder.is_idle());
    println!("✓ decoder reassembles frames split at every byte");
}

#[test]
fn test_decoder_splits_coalesced_frames() {
    let a = Frame::new(1, 2, 0, MessageKind::User, vec![1, 2, 3]);
    let b = Frame::new(4, 5, 0, MessageKind::User, vec![6]);
    let mut wire = a.to_bytes();
    wire.extend(b.to_bytes());
    wire.extend_from_slice(&[0, 0, 0]);

    let mut decoder = FrameDecoder::new();
    decoder.push(&wire);
    assert_eq!(decoder.next_frame().unwrap(), Some(a));
    assert_eq!(decoder.next_frame().unwrap(), Some(b));
    assert_eq!(decoder.next_frame().unwrap(), None);
    assert_eq!(decoder.buffered(), 3);
    assert!(!decoder.is_idle());
    println!("✓ decoder splits coalesced frames and keeps the remainder");
}

// =========================================================================
// Payload serialization
// =========================================================================

#[test]
fn test_typed_payloads() {
    let value = (String::from("hello"), vec![1.5f64, -2.0], Some(7u8));
    let bytes = serialize_payload(&value).unwrap();
    let back: (String, Vec<f64>, Option<u8>) = deserialize_payload(&bytes).unwrap();
    assert_eq!(back, value);

    let err = deserialize_payload::<String>(&[1, 2]).unwrap_err();
    assert_eq!(err.code(), Code::SerializationError);
    println!("✓ typed payloads round-trip and garbage fails to decode");
}
