use bytes::BytesMut;
use parley_protocol::{
	DEFAULT_MAX_FRAME_SIZE, Frame, FrameType, FramingError, HistoryRequest, Record, decode_frame, encode_frame,
	encode_frame_default, try_decode_frame_from_buffer,
};

fn chat_record(text: &str, seq: u64) -> Record {
	Record {
		text: text.to_string(),
		from: "member-a".to_string(),
		seq,
		..Record::default()
	}
}

#[test]
fn envelope_roundtrip_through_framing() {
	let frame = Frame::chat(&chat_record("hello", 7));

	let bytes = encode_frame(&frame, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame");
	let (decoded, consumed) = decode_frame::<Frame>(&bytes, DEFAULT_MAX_FRAME_SIZE).expect("decode_frame");

	assert_eq!(consumed, bytes.len());
	assert_eq!(decoded.kind, FrameType::Chat);
	assert_eq!(decoded.decode_data::<Record>().expect("record"), chat_record("hello", 7));
}

#[test]
fn history_batch_survives_framing() {
	let batch = vec![chat_record("a", 0), chat_record("b", 1), chat_record("c", 2)];
	let bytes = encode_frame_default(&Frame::history(&batch)).expect("encode");

	let (decoded, _) = decode_frame::<Frame>(&bytes, DEFAULT_MAX_FRAME_SIZE).expect("decode");
	let got: Vec<Record> = decoded.decode_data().expect("batch");
	assert_eq!(got, batch);
}

#[test]
fn multiple_frames_decode_in_order_from_one_buffer() {
	let mut buf = BytesMut::new();
	for (i, kind) in ["first", "second", "third"].iter().enumerate() {
		let bytes = encode_frame_default(&Frame::chat(&chat_record(kind, i as u64))).expect("encode");
		buf.extend_from_slice(&bytes);
	}

	for expect in ["first", "second", "third"] {
		let frame = try_decode_frame_from_buffer::<Frame>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
			.expect("ok")
			.expect("some");
		assert_eq!(frame.decode_data::<Record>().expect("record").text, expect);
	}

	assert!(buf.is_empty());
}

#[test]
fn oversized_frame_is_rejected_before_parse() {
	let big = Frame::chat(&chat_record(&"x".repeat(1024), 0));
	let err = encode_frame(&big, 64).unwrap_err();
	assert!(matches!(err, FramingError::FrameTooLarge { .. }));
}

#[test]
fn history_request_payload_parses() {
	let bytes = encode_frame_default(&Frame {
		kind: FrameType::HistoryRequest,
		data: serde_json::to_value(HistoryRequest { to: 5 }).ok(),
		error: None,
	})
	.expect("encode");

	let (frame, _) = decode_frame::<Frame>(&bytes, DEFAULT_MAX_FRAME_SIZE).expect("decode");
	assert_eq!(frame.kind, FrameType::HistoryRequest);
	assert_eq!(frame.decode_data::<HistoryRequest>().expect("payload").to, 5);
}
