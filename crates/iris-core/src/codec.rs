//! Message codec: base64-wrapped JSON envelopes.
//!
//! Binary fields inside `data` (audio) travel as standard base64 strings;
//! [`encode_binary`] and [`decode_binary`] are the helpers for them.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use serde_json::Value;

use crate::envelope::{Envelope, RoutingContext};
use crate::errors::CodecError;

/// Build an envelope from a serializable payload and encode it for the wire.
///
/// The payload must serialize to a JSON object.
pub fn encode<T: Serialize + ?Sized>(
    msg_type: &str,
    payload: &T,
    context: &RoutingContext,
) -> Result<Vec<u8>, CodecError> {
    let data = match serde_json::to_value(payload) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            return Err(CodecError::Encoding(format!(
                "payload for {msg_type} must be an object, got {}",
                json_kind(&other)
            )))
        }
        Err(e) => return Err(CodecError::Encoding(e.to_string())),
    };
    encode_envelope(&Envelope::new(msg_type, data, context.clone()))
}

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(envelope).map_err(|e| CodecError::Encoding(e.to_string()))?;
    Ok(STANDARD.encode(json).into_bytes())
}

pub fn decode(wire: &[u8]) -> Result<Envelope, CodecError> {
    let raw = STANDARD.decode(wire.trim_ascii())?;
    serde_json::from_slice(&raw).map_err(|e| CodecError::Decoding(format!("invalid envelope: {e}")))
}

pub fn encode_binary(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_binary(encoded: &str) -> Result<Vec<u8>, CodecError> {
    Ok(STANDARD.decode(encoded.trim())?)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::RoutingTag;
    use serde::Serializer;
    use serde_json::json;

    fn context() -> RoutingContext {
        RoutingContext {
            client_name: "cli".into(),
            client: "mq_api".into(),
            ident: "1.000001-00000000".into(),
            routing: Some(RoutingTag {
                routing_key: "iris_test".into(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn roundtrip_preserves_payload() {
        let payload = json!({"utterances": ["what time is it"], "lang": "en-us"});
        let wire = encode("recognizer_loop:utterance", &payload, &context()).unwrap();
        let envelope = decode(&wire).unwrap();
        assert_eq!(envelope.msg_type, "recognizer_loop:utterance");
        assert_eq!(Value::Object(envelope.data), payload);
        assert_eq!(envelope.context, context());
    }

    #[test]
    fn roundtrip_preserves_binary_fields() {
        let audio: Vec<u8> = (0..=255u8).collect();
        let payload = json!({"lang": "en-us", "audio_data": encode_binary(&audio)});
        let wire = encode("neon.audio_input", &payload, &context()).unwrap();
        let envelope = decode(&wire).unwrap();
        let restored = decode_binary(envelope.data["audio_data"].as_str().unwrap()).unwrap();
        assert_eq!(restored, audio);
    }

    #[test]
    fn wire_is_base64_json() {
        let wire = encode("x", &json!({}), &context()).unwrap();
        let raw = STANDARD.decode(&wire).unwrap();
        let value: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["context"]["klat_data"]["routing_key"], "iris_test");
    }

    #[test]
    fn encoding_is_deterministic() {
        let payload = json!({"b": 1, "a": [1, 2]});
        let first = encode("x", &payload, &context()).unwrap();
        let second = encode("x", &payload, &context()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let err = encode("x", &json!([1, 2]), &context()).unwrap_err();
        assert!(matches!(err, CodecError::Encoding(_)));
        assert!(err.to_string().contains("array"));
    }

    #[test]
    fn unserializable_payload_is_rejected() {
        struct Opaque;
        impl Serialize for Opaque {
            fn serialize<S: Serializer>(&self, _s: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("opaque handle"))
            }
        }
        let err = encode("x", &Opaque, &context()).unwrap_err();
        assert!(matches!(err, CodecError::Encoding(_)));
    }

    #[test]
    fn malformed_base64_is_a_decoding_error() {
        let err = decode(b"%%% not base64 %%%").unwrap_err();
        assert!(matches!(err, CodecError::Decoding(_)));
    }

    #[test]
    fn malformed_inner_json_is_a_decoding_error() {
        let wire = STANDARD.encode(b"{\"msg_type\": ");
        let err = decode(wire.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("invalid envelope"));
    }

    #[test]
    fn trailing_newline_is_tolerated() {
        let mut wire = encode("x", &json!({}), &context()).unwrap();
        wire.push(b'\n');
        assert!(decode(&wire).is_ok());
    }
}
