//! Message codecs.
//!
//! A codec turns a [`Message`] into the bytes carried by a transport and
//! back. Decoding never panics: malformed input yields a [`DecodeError`]
//! carrying whatever request id could be salvaged, so the caller can decide
//! whether to answer with an exception or drop the frame.

use crate::message::Message;

/// Protocol name advertised for [`JsonCodec`] in MakeConnection.
pub const JSON_PROTOCOL: &str = "strata-json";

pub trait Codec: Send + Sync {
    /// Name advertised in the `protocol` property of invitations.
    fn name(&self) -> &'static str;

    fn encode(&self, msg: &Message) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Message, DecodeError>;
}

/// Self-describing JSON text encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        JSON_PROTOCOL
    }

    fn encode(&self, msg: &Message) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(msg)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message, DecodeError> {
        serde_json::from_slice(bytes).map_err(|e| DecodeError {
            reason: e.to_string(),
            id: salvage_id(bytes),
        })
    }
}

/// Pull a string `id` out of a frame that failed to decode as a [`Message`].
fn salvage_id(bytes: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    value.get("id")?.as_str().map(str::to_string)
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// A frame that could not be decoded.
#[derive(Debug, Clone, thiserror::Error)]
#[error("malformed frame: {reason}")]
pub struct DecodeError {
    pub reason: String,
    /// Request id recovered from the frame, if any.
    pub id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Op, keys};
    use proptest::prelude::*;

    fn any_message() -> impl Strategy<Value = Message> {
        (
            proptest::sample::select(Op::ALL.to_vec()),
            proptest::option::of(".*"),
            proptest::collection::btree_map(".*", ".*", 0..8),
            proptest::option::of(".*"),
        )
            .prop_map(|(op, id, properties, exception)| Message {
                op,
                id,
                properties,
                exception,
            })
    }

    proptest! {
        #[test]
        fn any_message_survives_encoding(msg in any_message()) {
            let bytes = JsonCodec.encode(&msg).unwrap();
            prop_assert_eq!(JsonCodec.decode(&bytes).unwrap(), msg);
        }

        #[test]
        fn typed_values_survive_encoding(
            count in any::<i64>(),
            ratio in any::<f64>().prop_filter("finite", |x| x.is_finite()),
            flag in any::<bool>(),
        ) {
            let msg = Message::new(Op::UpdatePropertiesRequest)
                .with_prop("count", count)
                .with_prop("ratio", ratio)
                .with_prop("flag", flag);
            let back = JsonCodec.decode(&JsonCodec.encode(&msg).unwrap()).unwrap();
            prop_assert_eq!(back.prop_as::<i64>("count"), Some(count));
            prop_assert_eq!(back.prop_as::<f64>("ratio"), Some(ratio));
            prop_assert_eq!(back.prop_as::<bool>("flag"), Some(flag));
        }
    }

    #[test]
    fn encode_decode_preserves_messages() {
        let codec = JsonCodec;
        let samples = [
            Message::new(Op::CloseSession),
            Message::new(Op::OpenSessionRequest)
                .with_id("1")
                .with_prop(keys::CLIENT_AUTH, "abc")
                .with_prop(keys::AUTH, "{\"aID\":\"x\"}"),
            Message::new(Op::UpdatePropertiesResponse)
                .with_id("item")
                .with_prop("Position", "<1.5,2,-3.25>")
                .with_prop("Scale", 0.30000000000000004f64)
                .with_prop("Visible", false)
                .with_prop("Count", u64::MAX),
            Message::new(Op::Request).with_id("").exception("boom \"quoted\"\n"),
        ];
        for msg in samples {
            let bytes = codec.encode(&msg).unwrap();
            assert_eq!(codec.decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn encoding_is_text() {
        let bytes = JsonCodec
            .encode(&Message::new(Op::AliveCheckRequest).with_id("7"))
            .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"AliveCheckRequest\""));
    }

    #[test]
    fn decode_error_salvages_id() {
        let err = JsonCodec
            .decode(br#"{"op":"NoSuchOp","id":"req-9"}"#)
            .unwrap_err();
        assert_eq!(err.id.as_deref(), Some("req-9"));

        let err = JsonCodec.decode(b"not json at all").unwrap_err();
        assert!(err.id.is_none());
        assert!(!err.reason.is_empty());
    }
}
