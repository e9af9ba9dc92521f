//! JSON event protocol between canvas clients and the server.
//!
//! Wire format (one JSON object per WebSocket text frame):
//! ```text
//! { "event": "initial_board", "data": [["#FFFFFF", ...], ...] }   server → client, once
//! { "event": "change_color",  "data": { "x": 1, "y": 0, "color": "#FF0000" } }  both ways
//! { "event": "rejected",      "data": { "reason": "out_of_bounds", ... } }     server → originator
//! ```
//!
//! `initial_board` rows are ordered top to bottom (`y`), columns left to
//! right (`x`), so `board[y][x]` addresses a cell.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A full board snapshot: `height` rows of `width` colors.
pub type Grid = Vec<Vec<Color>>;

/// A cell color in canonical `#RRGGBB` form (upper-case hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color(String);

impl Color {
    /// Parse a `#RRGGBB` color. Hex digits are accepted in either case and
    /// normalized to upper case.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let hex = raw
            .strip_prefix('#')
            .ok_or_else(|| ProtocolError::InvalidColor(raw.to_string()))?;
        if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ProtocolError::InvalidColor(raw.to_string()));
        }
        Ok(Self(format!("#{}", hex.to_ascii_uppercase())))
    }

    /// Pure white, the reference fill color.
    pub fn white() -> Self {
        Self("#FFFFFF".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Color as packed `0xRRGGBB`.
    pub fn rgb(&self) -> u32 {
        u32::from_str_radix(&self.0[1..], 16).unwrap_or(0)
    }
}

impl std::fmt::Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Color {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Color::parse(&value)
    }
}

impl From<Color> for String {
    fn from(color: Color) -> Self {
        color.0
    }
}

impl std::str::FromStr for Color {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Color::parse(s)
    }
}

/// Inbound mutation request as sent by a client.
///
/// Coordinates are signed so that `-1` is reported as out of bounds rather
/// than as a parse failure; the color is raw so that a bad color can be
/// rejected with its coordinate attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeColorRequest {
    pub x: i64,
    pub y: i64,
    pub color: String,
}

impl ChangeColorRequest {
    pub fn new(x: i64, y: i64, color: impl Into<String>) -> Self {
        Self {
            x,
            y,
            color: color.into(),
        }
    }
}

/// An accepted, applied single-cell mutation (the broadcast delta).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellUpdate {
    pub x: u32,
    pub y: u32,
    pub color: Color,
}

/// Why a request from a session was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    OutOfBounds,
    InvalidColor,
    Malformed,
    NotSynced,
}

/// Rejection acknowledgment, sent to the originating session only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: RejectReason,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<i64>,
}

impl Rejection {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            reason: RejectReason::Malformed,
            message: message.into(),
            x: None,
            y: None,
        }
    }
}

/// Messages sent from the server to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    InitialBoard(Grid),
    ChangeColor(CellUpdate),
    Rejected(Rejection),
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Encode once for fan-out; every subscriber shares the same frame.
    pub fn encode_shared(&self) -> Result<Arc<str>, ProtocolError> {
        self.encode().map(Arc::from)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Messages sent from clients to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    ChangeColor(ChangeColorRequest),
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Missing fields, wrong field types and unknown events all decode to
    /// [`ProtocolError::Malformed`].
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame could not be parsed into a known message
    Malformed(String),
    /// Color is not `#RRGGBB`
    InvalidColor(String),
    Serialization(String),
    ConnectionFailed(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "Malformed message: {e}"),
            Self::InvalidColor(c) => write!(f, "Invalid color: {c:?}"),
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::ConnectionFailed(e) => write!(f, "Connection failed: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
