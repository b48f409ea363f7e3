//! Durable key layout
//!
//! All of one workflow's state lives in a single KV namespace under
//! prefix-tagged, order-preserving string keys:
//!
//! | Key | Meaning | Value encoding |
//! |---|---|---|
//! | `name/NNNNNNNN` | name registry entry | raw string |
//! | `hist/<location key>` | history entry | JSON [`Entry`](super::Entry) |
//! | `msg/NNNNNNNNNNNNNNNNNNNN` | message | JSON [`Message`](super::Message) |
//! | `meta/<entry uuid>` | entry metadata | JSON |
//! | `wf/error` | workflow error | JSON |
//! | `wf/input` | workflow input | JSON |
//! | `wf/output` | workflow output | JSON |
//! | `wf/state` | workflow state | text enum |
//! | `wf/version` | schema version | text |
//!
//! Numeric components are zero-padded so the driver's lexicographic `list`
//! yields registry indices and message ids in numeric order. The engine
//! depends on that ordering for name-registry reconstruction and FIFO
//! message consumption.

use uuid::Uuid;

use crate::location::NameIndex;

/// Schema version written at `wf/version`.
pub const SCHEMA_VERSION: &str = "1";

pub const NAME_PREFIX: &str = "name/";
pub const HISTORY_PREFIX: &str = "hist/";
pub const MESSAGE_PREFIX: &str = "msg/";
pub const METADATA_PREFIX: &str = "meta/";

pub const WF_ERROR_KEY: &str = "wf/error";
pub const WF_INPUT_KEY: &str = "wf/input";
pub const WF_OUTPUT_KEY: &str = "wf/output";
pub const WF_STATE_KEY: &str = "wf/state";
pub const WF_VERSION_KEY: &str = "wf/version";

/// Key for one name registry slot.
pub fn name_key(idx: NameIndex) -> String {
    format!("{NAME_PREFIX}{idx:08}")
}

/// Key for one history entry, addressed by its rendered location key.
pub fn history_key(location_key: &str) -> String {
    format!("{HISTORY_PREFIX}{location_key}")
}

/// Key for one inbox message.
pub fn message_key(id: u64) -> String {
    format!("{MESSAGE_PREFIX}{id:020}")
}

/// Key for one entry's operational metadata.
pub fn metadata_key(id: Uuid) -> String {
    format!("{METADATA_PREFIX}{id}")
}

/// Parse the index out of a name registry key.
pub fn parse_name_key(key: &str) -> Option<NameIndex> {
    key.strip_prefix(NAME_PREFIX)?.parse().ok()
}

/// Parse the message id out of a message key.
pub fn parse_message_key(key: &str) -> Option<u64> {
    key.strip_prefix(MESSAGE_PREFIX)?.parse().ok()
}

/// Parse the entry id out of a metadata key.
pub fn parse_metadata_key(key: &str) -> Option<Uuid> {
    key.strip_prefix(METADATA_PREFIX)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_keys_sort_numerically() {
        assert!(name_key(2) < name_key(10));
        assert!(name_key(10) < name_key(100));
        assert_eq!(parse_name_key(&name_key(42)), Some(42));
    }

    #[test]
    fn test_message_keys_sort_numerically() {
        assert!(message_key(9) < message_key(11));
        assert_eq!(parse_message_key(&message_key(7)), Some(7));
    }

    #[test]
    fn test_metadata_key_round_trip() {
        let id = Uuid::now_v7();
        assert_eq!(parse_metadata_key(&metadata_key(id)), Some(id));
    }

    #[test]
    fn test_parse_rejects_foreign_prefixes() {
        assert_eq!(parse_name_key("msg/00000001"), None);
        assert_eq!(parse_message_key("name/00000001"), None);
    }
}
