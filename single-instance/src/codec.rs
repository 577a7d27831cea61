use crate::Error;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::path::PathBuf;

/// Frames larger than this are rejected without parsing
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

pub(crate) const HEADER_LEN: usize = 4;
const WIRE_VERSION: u32 = 1;

/// Launch context of a secondary instance, delivered to the primary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffMessage {
    pub arguments: Vec<String>,
    pub working_directory: PathBuf,
    pub sent_at: DateTime<Utc>,
}

impl HandoffMessage {
    pub fn new(
        arguments: Vec<String>,
        working_directory: impl Into<PathBuf>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        HandoffMessage {
            arguments,
            working_directory: working_directory.into(),
            sent_at,
        }
    }

    /// Arguments (without the program name) and working directory of this
    /// process
    pub fn from_current_process() -> Result<Self, Error> {
        Ok(HandoffMessage {
            arguments: std::env::args_os()
                .skip(1)
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect(),
            working_directory: std::env::current_dir()?,
            sent_at: Utc::now(),
        })
    }
}

#[derive(Serialize)]
struct WireOut<'a> {
    version: u32,
    #[serde(flatten)]
    message: &'a HandoffMessage,
}

// Unknown fields from newer senders are ignored
#[derive(Deserialize)]
struct WireIn {
    version: u32,
    #[serde(flatten)]
    message: HandoffMessage,
}

/// Encode as a big endian length prefix followed by a JSON body
pub fn encode(message: &HandoffMessage) -> Result<Vec<u8>, Error> {
    let body = serde_json::to_vec(&WireOut {
        version: WIRE_VERSION,
        message,
    })?;
    if body.len() > MAX_FRAME_LEN {
        return Err(Error::MalformedPayload(format!(
            "payload of {} bytes exceeds the {} byte limit",
            body.len(),
            MAX_FRAME_LEN
        )));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a frame produced by [`encode`], bytes after the frame are ignored
pub fn decode(bytes: &[u8]) -> Result<HandoffMessage, Error> {
    let Some(header) = bytes.get(..HEADER_LEN) else {
        return Err(Error::MalformedPayload(format!(
            "truncated header, got {} bytes",
            bytes.len()
        )));
    };
    let len = body_len(header);
    if len > MAX_FRAME_LEN {
        return Err(Error::MalformedPayload(format!(
            "declared length {} exceeds the {} byte limit",
            len, MAX_FRAME_LEN
        )));
    }
    let Some(body) = bytes.get(HEADER_LEN..HEADER_LEN + len) else {
        return Err(Error::MalformedPayload(format!(
            "truncated body, expected {} bytes, got {}",
            len,
            bytes.len() - HEADER_LEN
        )));
    };

    let wire: WireIn = serde_json::from_slice(body)?;
    if wire.version > WIRE_VERSION {
        log::debug!(
            "Decoding handoff from a newer sender (version {}), unknown fields ignored",
            wire.version
        );
    }
    Ok(wire.message)
}

/// Body length declared by a frame header, `header` must hold at least
/// [`HEADER_LEN`] bytes
pub(crate) fn body_len(header: &[u8]) -> usize {
    u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message() -> HandoffMessage {
        HandoffMessage::new(
            vec!["--open".into(), "file.txt".into(), "ünïcödé arg".into()],
            "/home/user/documents",
            Utc.with_ymd_and_hms(2024, 5, 5, 12, 0, 0).unwrap()
                + chrono::Duration::nanoseconds(123_456_789),
        )
    }

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut bytes = (body.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(body);
        bytes
    }

    #[test]
    fn round_trip_keeps_message() {
        let original = message();
        let decoded = decode(&encode(&original).unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn empty_argument_list_round_trips() {
        let original = HandoffMessage::new(Vec::new(), "/", Utc::now());
        assert_eq!(decode(&encode(&original).unwrap()).unwrap(), original);
    }

    #[test]
    fn every_truncation_is_malformed() {
        let bytes = encode(&message()).unwrap();
        for len in 0..bytes.len() {
            assert!(
                matches!(decode(&bytes[..len]), Err(Error::MalformedPayload(_))),
                "truncated to {} bytes should be malformed",
                len
            );
        }
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let body = br#"{
            "version": 7,
            "arguments": ["a"],
            "working_directory": "/tmp",
            "sent_at": "2024-05-05T12:00:00Z",
            "desktop_startup_id": "xyz",
            "extra": {"nested": [1, 2, 3]}
        }"#;
        let decoded = decode(&frame(body)).unwrap();

        assert_eq!(decoded.arguments, vec!["a".to_string()]);
        assert_eq!(decoded.working_directory, PathBuf::from("/tmp"));
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut bytes = encode(&message()).unwrap();
        bytes.extend_from_slice(b"garbage");
        assert_eq!(decode(&bytes).unwrap(), message());
    }

    #[test]
    fn missing_fields_are_malformed() {
        let body = br#"{"version": 1, "arguments": ["a"]}"#;
        assert!(matches!(
            decode(&frame(body)),
            Err(Error::MalformedPayload(_))
        ));
    }

    #[test]
    fn corrupt_body_is_malformed() {
        assert!(matches!(
            decode(&frame(b"{not json")),
            Err(Error::MalformedPayload(_))
        ));
    }

    #[test]
    fn oversized_length_is_rejected_before_reading_body() {
        let bytes = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        assert!(matches!(decode(&bytes), Err(Error::MalformedPayload(_))));
    }
}
