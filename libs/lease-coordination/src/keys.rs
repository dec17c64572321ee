//! Key resolver for lease and liveness records.
//!
//! The resolver is a pure translator from session/node identity to store key.
//! No key strings are built anywhere else.

use config::KeyConfig;

use crate::error::{CoordinationError, CoordinationResult};
use crate::models::{NodeId, SessionId};

/// Escape marker for bytes outside the pass-through alphabet.
const ESCAPE: char = '=';

/// Encode a component into the KV-safe alphabet. `[A-Za-z0-9_-]` passes
/// through and every other byte, `.` and `=` included, becomes `=XX`
/// (uppercase hex), so distinct ids never share a key.
pub(crate) fn encode_key_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_') {
            out.push(char::from(byte));
        } else {
            out.push(ESCAPE);
            out.push_str(&format!("{byte:02X}"));
        }
    }
    out
}

fn is_valid_prefix(prefix: &str) -> bool {
    prefix
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyResolver {
    lease_prefix: String,
    node_prefix: String,
}

impl KeyResolver {
    /// Returns an error if a prefix is empty or contains characters the KV
    /// store does not accept in keys.
    pub fn new(keys: &KeyConfig) -> CoordinationResult<Self> {
        for prefix in [keys.lease_prefix(), keys.node_prefix()] {
            if prefix.is_empty() {
                return Err(CoordinationError::Config("key prefix is empty".into()));
            }
            if !is_valid_prefix(prefix) {
                return Err(CoordinationError::Config(format!(
                    "key prefix '{prefix}' contains characters outside [A-Za-z0-9._-]"
                )));
            }
        }
        Ok(Self {
            lease_prefix: keys.lease_prefix().to_owned(),
            node_prefix: keys.node_prefix().to_owned(),
        })
    }

    pub fn lease_key(&self, session: &SessionId) -> String {
        format!(
            "{}{}",
            self.lease_prefix,
            encode_key_component(session.as_str())
        )
    }

    pub fn node_key(&self, node: &NodeId) -> String {
        format!("{}{}", self.node_prefix, encode_key_component(node.as_str()))
    }

    pub fn lease_prefix(&self) -> &str {
        &self.lease_prefix
    }

    pub fn node_prefix(&self) -> &str {
        &self.node_prefix
    }

    /// Key used by the startup write self-test, outside both prefixes.
    pub fn probe_key(&self, nonce: &str) -> String {
        format!("pollkeeper.selftest.{}", encode_key_component(nonce))
    }
}

impl Default for KeyResolver {
    fn default() -> Self {
        let keys = KeyConfig::default();
        Self {
            lease_prefix: keys.lease_prefix().to_owned(),
            node_prefix: keys.node_prefix().to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_keys() {
        let keys = KeyResolver::default();
        assert_eq!(
            keys.lease_key(&SessionId::from("sess-1")),
            "poll.lease.sess-1"
        );
        assert_eq!(keys.node_key(&NodeId::from("api-1")), "poll.node.api-1");
    }

    #[test]
    fn test_components_are_escaped() {
        let keys = KeyResolver::default();
        assert_eq!(
            keys.lease_key(&SessionId::from("a b/c*>")),
            "poll.lease.a=20b=2Fc=2A=3E"
        );
        assert_eq!(keys.node_key(&NodeId::from("api.1")), "poll.node.api=2E1");
    }

    #[test]
    fn test_distinct_ids_get_distinct_keys() {
        let keys = KeyResolver::default();
        let encoded: std::collections::HashSet<_> = ["a b", "a_b", "a=20b", "a.b", "a=2Eb"]
            .into_iter()
            .map(|id| keys.lease_key(&SessionId::from(id)))
            .collect();
        assert_eq!(encoded.len(), 5);
        assert_ne!(
            keys.node_key(&NodeId::from("game 1")),
            keys.node_key(&NodeId::from("game_1"))
        );
    }

    #[test]
    fn test_multibyte_ids_are_escaped_per_byte() {
        assert_eq!(encode_key_component("é"), "=C3=A9");
    }

    #[test]
    fn test_custom_prefixes() {
        let cfg = KeyConfig::new("game.lease.".into(), "game.node.".into()).unwrap();
        let keys = KeyResolver::new(&cfg).unwrap();
        assert_eq!(keys.lease_prefix(), "game.lease.");
        assert_eq!(keys.node_key(&NodeId::from("n")), "game.node.n");
    }

    #[test]
    fn test_rejects_unsafe_prefix() {
        let cfg = KeyConfig::new("poll:lease:".into(), "poll.node.".into()).unwrap();
        assert!(matches!(
            KeyResolver::new(&cfg),
            Err(CoordinationError::Config(_))
        ));
    }

    #[test]
    fn test_probe_key_outside_prefixes() {
        let keys = KeyResolver::default();
        let probe = keys.probe_key("123");
        assert!(!probe.starts_with(keys.node_prefix()));
        assert!(!probe.starts_with(keys.lease_prefix()));
    }
}
