//! Wire types exchanged with the upstream message gateway.

use serde::{Deserialize, Serialize};

/// One page of channel history.
///
/// Messages are kept as loosely-typed JSON; [`crate::normalize`] turns them
/// into typed records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagePage {
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
    #[serde(default)]
    pub next_offset: Option<String>,
}

/// Raw bytes of a message's photo.
#[derive(Debug, Clone)]
pub struct MediaPayload {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}
