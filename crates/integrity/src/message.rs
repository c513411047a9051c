use serde::{
    Deserialize,
    Serialize,
};

use crate::table::EntityRecord;

/// Outbound anti-entropy messages, serialized as tagged JSON objects. The
/// `op` strings are the wire contract with peers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SyncMessage {
    IntegrityCheckGlobal {
        id: i64,
        begin: String,
        end: String,
        checksum: String,
    },
    IntegrityCheckLeft {
        id: i64,
        begin: String,
        end: String,
        checksum: String,
    },
    IntegrityCheckRight {
        id: i64,
        begin: String,
        end: String,
        checksum: String,
    },
    IntegrityClear {
        id: i64,
    },
    State {
        item: EntityRecord,
    },
}

#[derive(Deserialize)]
struct ResponseBody {
    id: i64,
    #[serde(default)]
    begin: Option<String>,
    #[serde(default)]
    end: Option<String>,
}

/// An inbound peer response: `<command> <json>`, where the JSON carries the
/// round id and, for range commands, the range bounds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncResponse {
    pub command: String,
    pub id: i64,
    pub begin: Option<String>,
    pub end: Option<String>,
}

impl SyncResponse {
    /// Parses a raw bus payload. Malformed payloads are logged at debug and
    /// discarded, matching how peers treat ours.
    pub fn parse(payload: &str) -> Option<Self> {
        let Some((command, json_arg)) = payload.split_once(' ') else {
            tracing::debug!("Synchronization response with no argument: {payload}");
            return None;
        };
        let body: ResponseBody = match serde_json::from_str(json_arg) {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!("Invalid synchronization response argument ({e}): {json_arg}");
                return None;
            },
        };
        Some(Self {
            command: command.to_owned(),
            id: body.id,
            begin: body.begin,
            end: body.end,
        })
    }
}
