//! Worker RPC wire framing (spec §6): `uint32 frameLen` (big-endian)
//! followed by a serialized [`Header`], followed optionally by a body.
//! Bodies are whatever type the caller supplies to [`encode_frame`] /
//! [`decode_body`]; the header alone is enough to route a response back to
//! its caller by id.

use crate::error::{CoreError, Result};
use crate::ids::RequestId;
use bincode::config::standard;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Request,
    Service,
}

/// Request body kinds named in spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Replicate,
    Delete,
    Find,
    FindAll,
    Echo,
    Sql,
    DirectorIndex,
    Status,
    Stop,
}

/// Worker-reported status enum (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    Success,
    Created,
    Queued,
    InProgress,
    IsCancelling,
    Bad,
    Failed,
    Cancelled,
}

/// Extended status naming a specific error, orthogonal to [`WorkerStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtendedWorkerStatus {
    None,
    FileSize,
    NoFolder,
    ForeignInstance,
    InvalidParam,
    InternalError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub id: RequestId,
    pub message_type: MessageType,
    pub request_kind: Option<RequestKind>,
    pub instance_id: String,
}

/// Encode `header` and an optional serializable `body` into one framed
/// message: `[u32 BE frameLen][bincode header][bincode body]`.
pub fn encode_frame<B: Serialize>(header: &Header, body: Option<&B>) -> Result<Vec<u8>> {
    let body_bytes = match body {
        Some(b) => bincode::serde::encode_to_vec(b, standard())?,
        None => Vec::new(),
    };
    encode_frame_raw(header, &body_bytes)
}

/// Like [`encode_frame`] but takes the body as already-encoded bytes,
/// copying them into the frame verbatim instead of running them through
/// `Serialize` again. Used to relay a body a caller already decoded (e.g.
/// a loopback transport echoing a request) without double-encoding it.
pub fn encode_frame_raw(header: &Header, body_bytes: &[u8]) -> Result<Vec<u8>> {
    let header_bytes = bincode::serde::encode_to_vec(header, standard())?;
    let frame_len = (header_bytes.len() + body_bytes.len()) as u32;
    let mut out = Vec::with_capacity(4 + frame_len as usize);
    out.extend_from_slice(&frame_len.to_be_bytes());
    // Header length is needed to split header/body back out; encode it
    // as a u32 prefix inside the frame payload.
    out.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(body_bytes);
    Ok(out)
}

/// Decode a complete frame (the `frameLen` prefix already stripped by the
/// transport) into its header and raw body bytes.
pub fn decode_frame(frame: &[u8]) -> Result<(Header, Vec<u8>)> {
    if frame.len() < 4 {
        return Err(CoreError::Transport("frame too short for header length prefix".into()));
    }
    let header_len = u32::from_be_bytes(frame[0..4].try_into().unwrap()) as usize;
    if frame.len() < 4 + header_len {
        return Err(CoreError::Transport("frame shorter than declared header length".into()));
    }
    let (header, _): (Header, usize) =
        bincode::serde::decode_from_slice(&frame[4..4 + header_len], standard())?;
    let body = frame[4 + header_len..].to_vec();
    Ok((header, body))
}

pub fn decode_body<B: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<B> {
    let (value, _) = bincode::serde::decode_from_slice(body, standard())?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_header_and_body() {
        let header = Header {
            id: RequestId::new(),
            message_type: MessageType::Request,
            request_kind: Some(RequestKind::Echo),
            instance_id: "worker1".to_string(),
        };
        let body = "hello".to_string();
        let encoded = encode_frame(&header, Some(&body)).unwrap();
        let frame_len = u32::from_be_bytes(encoded[0..4].try_into().unwrap());
        let payload = &encoded[4..];
        assert_eq!(payload.len() as u32, frame_len);

        let (decoded_header, decoded_body) = decode_frame(payload).unwrap();
        assert_eq!(decoded_header.id, header.id);
        assert_eq!(decoded_header.request_kind, header.request_kind);
        let decoded_body: String = decode_body(&decoded_body).unwrap();
        assert_eq!(decoded_body, body);
    }

    #[test]
    fn frame_round_trips_without_body() {
        let header = Header {
            id: RequestId::new(),
            message_type: MessageType::Service,
            request_kind: None,
            instance_id: "worker2".to_string(),
        };
        let encoded = encode_frame::<()>(&header, None).unwrap();
        let (decoded_header, body) = decode_frame(&encoded[4..]).unwrap();
        assert_eq!(decoded_header.instance_id, "worker2");
        assert!(body.is_empty());
    }
}
