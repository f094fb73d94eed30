//! Opaque pagination cursors.
//!
//! A cursor is the URL-safe base64 (no padding) encoding of `"<ms>|<id>"`,
//! i.e. the ordering key of the last item of the previous page.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::KernelError;
use crate::identity::{RunId, Seq};

/// One page of a listing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_cursor: None,
        }
    }
}

/// Position in the newest-first run listing: `(created_at, run_id)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunCursor {
    pub created_at_ms: i64,
    pub run_id: RunId,
}

impl RunCursor {
    pub fn encode(&self) -> String {
        encode_pair(self.created_at_ms, &self.run_id)
    }

    pub fn decode(token: &str) -> Result<Self, KernelError> {
        let (created_at_ms, run_id) = decode_pair(token)?;
        if run_id.is_empty() {
            return Err(invalid_cursor("empty run id"));
        }
        Ok(Self {
            created_at_ms,
            run_id,
        })
    }
}

/// Position in the oldest-first event listing: `(timestamp, sequence_id)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventCursor {
    pub timestamp_ms: i64,
    pub sequence_id: Seq,
}

impl EventCursor {
    pub fn encode(&self) -> String {
        encode_pair(self.timestamp_ms, &self.sequence_id.to_string())
    }

    pub fn decode(token: &str) -> Result<Self, KernelError> {
        let (timestamp_ms, id) = decode_pair(token)?;
        let sequence_id = id
            .parse::<Seq>()
            .map_err(|_| invalid_cursor("sequence id is not a number"))?;
        if i64::try_from(sequence_id).is_err() {
            return Err(invalid_cursor("sequence id out of range"));
        }
        Ok(Self {
            timestamp_ms,
            sequence_id,
        })
    }
}

fn encode_pair(ms: i64, id: &str) -> String {
    URL_SAFE_NO_PAD.encode(format!("{}|{}", ms, id))
}

fn decode_pair(token: &str) -> Result<(i64, String), KernelError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token.trim())
        .map_err(|_| invalid_cursor("not base64"))?;
    let text = String::from_utf8(bytes).map_err(|_| invalid_cursor("not utf-8"))?;
    let (ms, id) = text
        .split_once('|')
        .ok_or_else(|| invalid_cursor("missing separator"))?;
    let ms = ms
        .parse::<i64>()
        .map_err(|_| invalid_cursor("timestamp is not a number"))?;
    Ok((ms, id.to_string()))
}

fn invalid_cursor(detail: &str) -> KernelError {
    KernelError::Validation(format!("invalid cursor: {}", detail))
}
