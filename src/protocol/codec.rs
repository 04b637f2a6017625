//! JSON encoding and decoding of protocol envelopes.
//!
//! Encoding never fails. Decoding distinguishes text that is not JSON at all
//! (`MalformedPayload`) from JSON that lacks the required keys
//! (`SchemaMismatch`). Unknown keys are ignored.

use serde_json::{json, Map, Value};
use thiserror::Error;

use super::{CommandName, RequestEnvelope, ResponseBody, ResponseEnvelope, STATUS_OK};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    /// Valid JSON with missing or mistyped keys. `sequence` is set when the
    /// `s` key itself could still be read.
    #[error("schema mismatch: {detail}")]
    SchemaMismatch {
        detail: String,
        sequence: Option<u64>,
    },

    #[error("unknown command '{code}'")]
    UnknownCommand { code: String, sequence: u64 },
}

impl DecodeError {
    /// Sequence number recovered from the message, if any.
    pub const fn sequence(&self) -> Option<u64> {
        match self {
            Self::MalformedPayload(_) => None,
            Self::SchemaMismatch { sequence, .. } => *sequence,
            Self::UnknownCommand { sequence, .. } => Some(*sequence),
        }
    }

    fn mismatch(detail: impl Into<String>, sequence: Option<u64>) -> Self {
        Self::SchemaMismatch {
            detail: detail.into(),
            sequence,
        }
    }
}

pub fn encode_request(request: &RequestEnvelope) -> Vec<u8> {
    json!({
        "n": request.name.code(),
        "p": request.payload,
        "s": request.sequence,
    })
    .to_string()
    .into_bytes()
}

pub fn encode_response(response: &ResponseEnvelope) -> Vec<u8> {
    let mut obj = Map::new();
    obj.insert("c".into(), json!(response.status));
    match &response.body {
        ResponseBody::Success(result) => {
            obj.insert("r".into(), result.clone());
        }
        ResponseBody::Failure { kind, reason } => {
            obj.insert("e".into(), json!(kind));
            if let Some(reason) = reason {
                obj.insert("er".into(), json!(reason));
            }
        }
    }
    obj.insert("s".into(), json!(response.sequence));
    Value::Object(obj).to_string().into_bytes()
}

pub fn decode_request(bytes: &[u8]) -> Result<RequestEnvelope, DecodeError> {
    let obj = parse_object(bytes)?;
    let sequence = read_sequence(&obj)?;

    let code = match obj.get("n") {
        Some(Value::String(code)) => code,
        Some(_) => return Err(DecodeError::mismatch("'n' must be a string", Some(sequence))),
        None => return Err(DecodeError::mismatch("missing 'n'", Some(sequence))),
    };
    let name = CommandName::from_code(code).ok_or_else(|| DecodeError::UnknownCommand {
        code: code.clone(),
        sequence,
    })?;

    Ok(RequestEnvelope {
        name,
        payload: obj.get("p").cloned().unwrap_or(Value::Null),
        sequence,
    })
}

pub fn decode_response(bytes: &[u8]) -> Result<ResponseEnvelope, DecodeError> {
    let obj = parse_object(bytes)?;
    let sequence = read_sequence(&obj)?;
    let seq = Some(sequence);

    let status = obj
        .get("c")
        .and_then(Value::as_u64)
        .and_then(|c| u16::try_from(c).ok())
        .ok_or_else(|| DecodeError::mismatch("'c' must be a status code", seq))?;

    // Peers may emit explicit nulls for absent optional keys.
    let kind = optional_string(&obj, "e", seq)?;
    let reason = optional_string(&obj, "er", seq)?;
    let result = obj.get("r");

    let body = if status == STATUS_OK {
        if kind.is_some() {
            return Err(DecodeError::mismatch("success response carries 'e'", seq));
        }
        let result =
            result.ok_or_else(|| DecodeError::mismatch("success response without 'r'", seq))?;
        ResponseBody::Success(result.clone())
    } else {
        let kind =
            kind.ok_or_else(|| DecodeError::mismatch("error response without 'e'", seq))?;
        if result.is_some_and(|r| !r.is_null()) {
            return Err(DecodeError::mismatch("error response carries 'r'", seq));
        }
        ResponseBody::Failure { kind, reason }
    };

    Ok(ResponseEnvelope {
        sequence,
        status,
        body,
    })
}

fn parse_object(bytes: &[u8]) -> Result<Map<String, Value>, DecodeError> {
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Object(obj) => Ok(obj),
        _ => Err(DecodeError::mismatch("envelope is not an object", None)),
    }
}

fn read_sequence(obj: &Map<String, Value>) -> Result<u64, DecodeError> {
    match obj.get("s") {
        Some(value) => value
            .as_u64()
            .ok_or_else(|| DecodeError::mismatch("'s' must be an unsigned integer", None)),
        None => Err(DecodeError::mismatch("missing 's'", None)),
    }
}

fn optional_string(
    obj: &Map<String, Value>,
    key: &str,
    sequence: Option<u64>,
) -> Result<Option<String>, DecodeError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(DecodeError::mismatch(format!("'{key}' must be a string"), sequence)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, ErrorKind, WriteFileArgs};

    #[test]
    fn request_roundtrip() {
        let cmd = Command::WriteFile(WriteFileArgs {
            path: "/tmp/out.txt".into(),
            content: "line\n".into(),
            append: true,
        });
        let req = RequestEnvelope::new(&cmd, 1001);
        let decoded = decode_request(&encode_request(&req)).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn request_roundtrip_null_payload() {
        let req = RequestEnvelope::new(&Command::GetSystemInfo { categories: None }, 3);
        let bytes = encode_request(&req);
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"p\":null"));
        assert_eq!(decode_request(&bytes).unwrap(), req);
    }

    #[test]
    fn response_roundtrip_null_result() {
        let resp = ResponseEnvelope::success(9, Value::Null);
        assert_eq!(decode_response(&encode_response(&resp)).unwrap(), resp);
    }

    #[test]
    fn response_roundtrip_failure() {
        let resp = ResponseEnvelope::failure(10, ErrorKind::NotFound, "no such file: /x");
        let bytes = encode_response(&resp);
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["c"], 404);
        assert_eq!(value["e"], "NotFound");
        assert!(value.get("r").is_none());
        assert_eq!(decode_response(&bytes).unwrap(), resp);
    }

    #[test]
    fn not_json_is_malformed() {
        let err = decode_request(b"{not json").unwrap_err();
        assert!(matches!(err, DecodeError::MalformedPayload(_)));
        assert_eq!(err.sequence(), None);
    }

    #[test]
    fn non_integer_sequence_is_schema_mismatch() {
        let err = decode_request(br#"{"n":"rf","p":"/x","s":"12"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::SchemaMismatch { sequence: None, .. }));

        let err = decode_response(br#"{"c":200,"r":{},"s":-1}"#).unwrap_err();
        assert!(matches!(err, DecodeError::SchemaMismatch { .. }));
    }

    #[test]
    fn missing_name_keeps_sequence() {
        let err = decode_request(br#"{"p":"/x","s":12}"#).unwrap_err();
        assert_eq!(err.sequence(), Some(12));
    }

    #[test]
    fn unknown_command_carries_sequence() {
        let err = decode_request(br#"{"n":"ec","p":{},"s":44}"#).unwrap_err();
        match err {
            DecodeError::UnknownCommand { code, sequence } => {
                assert_eq!(code, "ec");
                assert_eq!(sequence, 44);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn extra_fields_are_ignored() {
        let req = decode_request(br#"{"n":"rf","p":"/x","s":1,"trace":"abc"}"#).unwrap();
        assert_eq!(req.name, CommandName::ReadFile);

        let resp = decode_response(br#"{"c":200,"r":{"content":"x"},"s":1,"took_ms":3}"#).unwrap();
        assert!(resp.is_success());
    }

    #[test]
    fn explicit_nulls_on_error_response_are_tolerated() {
        let resp =
            decode_response(br#"{"c":500,"e":"File read error","er":null,"r":null,"s":1001}"#)
                .unwrap();
        assert_eq!(resp.error_kind(), Some("File read error"));
        assert_eq!(resp.error_reason(), None);
        assert!(resp.result().is_none());
    }

    #[test]
    fn success_and_error_together_is_rejected() {
        let err = decode_response(br#"{"c":200,"r":{},"e":"NotFound","s":1}"#).unwrap_err();
        assert!(matches!(err, DecodeError::SchemaMismatch { sequence: Some(1), .. }));

        let err = decode_response(br#"{"c":404,"r":{"content":"x"},"e":"NotFound","s":1}"#)
            .unwrap_err();
        assert!(matches!(err, DecodeError::SchemaMismatch { .. }));
    }

    #[test]
    fn neither_result_nor_error_is_rejected() {
        assert!(decode_response(br#"{"c":200,"s":1}"#).is_err());
        assert!(decode_response(br#"{"c":500,"s":1}"#).is_err());
    }
}
