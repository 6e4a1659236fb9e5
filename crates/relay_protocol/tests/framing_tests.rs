use relay_protocol::pb::{self, envelope::Msg};
use relay_protocol::{DEFAULT_MAX_FRAME_SIZE, FrameBuffer, FramingError, PROTOCOL_VERSION, encode_frame, envelope};

fn send_env(request_id: &str, text: &str) -> pb::Envelope {
	envelope(
		request_id,
		Msg::Send(pb::SendMessage {
			message: Some(pb::InboundMessage {
				from: Some("alice".to_string()),
				to: Some("bob".to_string()),
				text: Some(text.to_string()),
				..pb::InboundMessage::default()
			}),
		}),
	)
}

#[test]
fn envelopes_split_into_single_bytes_reassemble_in_order() {
	let first = send_env("1", "hello");
	let second = envelope(
		"2",
		Msg::Join(pb::Join {
			target: Some(pb::Target {
				kind: Some(pb::target::Kind::RoomId("R1".to_string())),
			}),
		}),
	);

	let mut stream = encode_frame(&first, DEFAULT_MAX_FRAME_SIZE).expect("encode");
	stream.extend(encode_frame(&second, DEFAULT_MAX_FRAME_SIZE).expect("encode"));

	let mut fb = FrameBuffer::new(DEFAULT_MAX_FRAME_SIZE);
	let mut decoded = Vec::new();
	for byte in stream {
		fb.extend(&[byte]);
		while let Some(env) = fb.next_frame::<pb::Envelope>().expect("decode") {
			decoded.push(env);
		}
	}

	assert_eq!(decoded, vec![first, second]);
	assert!(fb.is_empty());
}

#[test]
fn envelope_helper_stamps_version() {
	let env = send_env("abc", "x");
	assert_eq!(env.version, PROTOCOL_VERSION);
	assert_eq!(env.request_id, "abc");
}

#[test]
fn unset_optional_shape_fields_stay_unset() {
	let env = send_env("1", "hi");
	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).expect("encode");
	let (back, used) = relay_protocol::decode_frame::<pb::Envelope>(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode");
	assert_eq!(used, frame.len());

	match back.msg {
		Some(Msg::Send(pb::SendMessage { message: Some(m) })) => {
			assert_eq!(m.sender, None);
			assert_eq!(m.room, None);
			assert_eq!(m.is_group, None);
			assert_eq!(m.text.as_deref(), Some("hi"));
		}
		other => panic!("expected Send, got: {other:?}"),
	}
}

#[test]
fn oversized_envelope_is_refused_at_encode() {
	let env = send_env("1", &"a".repeat(1024));
	match encode_frame(&env, 64) {
		Err(FramingError::FrameTooLarge { len, max: 64 }) => assert!(len > 64),
		other => panic!("expected FrameTooLarge, got: {other:?}"),
	}
}
