//! Property tests for the wire codec: round-trips and split-resilience
//! over arbitrary message sequences and arbitrary read boundaries.

use parley_proto::{encode_frame, ErrorCode, FrameDecoder, WireMessage};
use proptest::prelude::*;

fn arbitrary_message() -> impl Strategy<Value = WireMessage> {
    prop_oneof![
        (0i64..10_000, ".{0,200}").prop_map(|(group_id, content)| WireMessage::Chat {
            group_id,
            content,
            sender_id: None,
            sender_username: None,
            timestamp: None,
            message_id: None,
        }),
        ("[a-z0-9_-]{3,20}", ".{6,40}").prop_map(|(username, password)| {
            WireMessage::Login { username, password }
        }),
        any::<i64>().prop_map(|timestamp| WireMessage::Ping { timestamp }),
        ".{0,100}".prop_map(|message| WireMessage::NicknameRequest { message }),
        Just(WireMessage::Logout),
        ".{0,100}".prop_map(|message| WireMessage::Error {
            code: ErrorCode::Internal,
            message,
        }),
    ]
}

proptest! {
    /// decode(encode(o)) == o for any message.
    #[test]
    fn prop_frame_roundtrip(msg in arbitrary_message()) {
        let frame = encode_frame(&msg).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame);
        let decoded = decoder.next_frame().unwrap().unwrap();
        prop_assert_eq!(decoded, msg);
    }

    /// For any byte-split of an encoded stream of N frames, the decoder
    /// yields exactly N messages in order.
    #[test]
    fn prop_split_stream_yields_all_frames(
        msgs in proptest::collection::vec(arbitrary_message(), 1..8),
        splits in proptest::collection::vec(1usize..32, 0..64),
    ) {
        let mut stream = Vec::new();
        for msg in &msgs {
            stream.extend_from_slice(&encode_frame(msg).unwrap());
        }

        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        let mut offset = 0;
        let mut split_iter = splits.into_iter();

        while offset < stream.len() {
            let take = split_iter.next().unwrap_or(stream.len());
            let end = (offset + take).min(stream.len());
            decoder.extend(&stream[offset..end]);
            offset = end;
            while let Some(msg) = decoder.next_frame().unwrap() {
                decoded.push(msg);
            }
        }

        prop_assert_eq!(decoded, msgs);
    }
}
