//! Bidirectional dictionary between well-known JSON keys and small integers.
//!
//! The v1 table maps 104 Matrix client-server API keys onto positive
//! integers so that CBOR maps carry one- or two-byte keys instead of the
//! full strings. Both sides of a deployment must ship the same table.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::{GatewayError, Result};

/// A bijective mapping between string keys and non-negative integers,
/// precomputed in both directions. Entries are configuration and never
/// change after construction.
#[derive(Debug)]
pub struct KeyDictionary {
    forward: HashMap<String, u64>,
    reverse: HashMap<u64, String>,
}

impl KeyDictionary {
    /// Build a dictionary from `(key, value)` pairs, rejecting duplicates
    /// on either side.
    pub fn new(entries: &[(&str, u64)]) -> Result<Self> {
        let mut forward = HashMap::with_capacity(entries.len());
        let mut reverse = HashMap::with_capacity(entries.len());
        for &(key, value) in entries {
            if forward.insert(key.to_string(), value).is_some() {
                return Err(GatewayError::Config(format!(
                    "duplicate dictionary key {key:?}"
                )));
            }
            if reverse.insert(value, key.to_string()).is_some() {
                return Err(GatewayError::Config(format!(
                    "duplicate dictionary value {value}"
                )));
            }
        }
        Ok(Self { forward, reverse })
    }

    /// Integer for a string key, if the key is in the dictionary.
    pub fn encode(&self, key: &str) -> Option<u64> {
        self.forward.get(key).copied()
    }

    /// String for an integer key, if the integer is in the dictionary.
    pub fn decode(&self, value: u64) -> Option<&str> {
        self.reverse.get(&value).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// The v1 Matrix key dictionary.
    pub fn v1() -> Arc<KeyDictionary> {
        static DICT: OnceLock<Arc<KeyDictionary>> = OnceLock::new();
        DICT.get_or_init(|| {
            Arc::new(KeyDictionary::new(KEY_DICT_V1).expect("builtin key dictionary is valid"))
        })
        .clone()
    }
}

/// The v1 key table. Values are stable wire protocol; do not renumber.
pub const KEY_DICT_V1: &[(&str, u64)] = &[
    ("event_id", 1),
    ("type", 2),
    ("content", 3),
    ("state_key", 4),
    ("room_id", 5),
    ("sender", 6),
    ("user_id", 7),
    ("origin_server_ts", 8),
    ("unsigned", 9),
    ("prev_content", 10),
    ("age", 11),
    ("replaces_state", 12),
    ("membership", 13),
    ("displayname", 14),
    ("avatar_url", 15),
    ("is_direct", 16),
    ("reason", 17),
    ("third_party_invite", 18),
    ("next_batch", 19),
    ("prev_batch", 20),
    ("rooms", 21),
    ("join", 22),
    ("invite", 23),
    ("leave", 24),
    ("timeline", 25),
    ("state", 26),
    ("body", 27),
    ("msgtype", 28),
    ("format", 29),
    ("formatted_body", 30),
    ("url", 31),
    ("info", 32),
    ("mimetype", 33),
    ("size", 34),
    ("w", 35),
    ("h", 36),
    ("thumbnail_url", 37),
    ("thumbnail_info", 38),
    ("events", 39),
    ("limited", 40),
    ("ephemeral", 41),
    ("account_data", 42),
    ("to_device", 43),
    ("presence", 44),
    ("device_lists", 45),
    ("device_one_time_keys_count", 46),
    ("summary", 47),
    ("m.heroes", 48),
    ("m.joined_member_count", 49),
    ("m.invited_member_count", 50),
    ("notification_count", 51),
    ("highlight_count", 52),
    ("changed", 53),
    ("left", 54),
    ("currently_active", 55),
    ("last_active_ago", 56),
    ("status_msg", 57),
    ("typing", 58),
    ("user_ids", 59),
    ("read", 60),
    ("ts", 61),
    ("event_ids", 62),
    ("device_id", 63),
    ("device_keys", 64),
    ("one_time_keys", 65),
    ("algorithms", 66),
    ("algorithm", 67),
    ("sender_key", 68),
    ("session_id", 69),
    ("ciphertext", 70),
    ("signatures", 71),
    ("keys", 72),
    ("access_token", 73),
    ("refresh_token", 74),
    ("home_server", 75),
    ("well_known", 76),
    ("m.homeserver", 77),
    ("m.identity_server", 78),
    ("base_url", 79),
    ("identifier", 80),
    ("password", 81),
    ("medium", 82),
    ("address", 83),
    ("auth", 84),
    ("session", 85),
    ("flows", 86),
    ("stages", 87),
    ("completed", 88),
    ("params", 89),
    ("name", 90),
    ("topic", 91),
    ("alias", 92),
    ("room_alias_name", 93),
    ("visibility", 94),
    ("preset", 95),
    ("invite_3pid", 96),
    ("creation_content", 97),
    ("initial_state", 98),
    ("power_level_content_override", 99),
    ("filter", 100),
    ("timeout", 101),
    ("errcode", 102),
    ("error", 103),
    ("retry_after_ms", 104),
];
