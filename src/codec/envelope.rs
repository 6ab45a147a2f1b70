//! Signed event envelopes, the wire shape of every relay message.
//!
//! The canonical event id is the SHA-256 of the JSON array
//! `[0, pubkey, created_at, kind, tags, content]` serialized without
//! extraneous whitespace; the schnorr signature covers that id, so any
//! changed byte invalidates the envelope.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::codec::keys::{verify_digest, PeerKeys};
use crate::error::{Error, Result};
use crate::unix_now;

/// Tag key naming the intended recipient.
pub const TAG_RECIPIENT: &str = "p";

/// Tag key carrying an expiration timestamp (unix seconds).
pub const TAG_EXPIRATION: &str = "expiration";

/// One relay message: id, author, timestamp, kind, tags, opaque content
/// and a schnorr signature over the id.
///
/// Unknown JSON fields are ignored on deserialize so the wire stays
/// forward compatible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// 32-byte canonical hash, hex-encoded
    pub id: String,
    /// Sender's x-only public key, hex-encoded
    pub pubkey: String,
    /// Unix seconds at creation
    pub created_at: u64,
    /// Event kind
    pub kind: u32,
    /// Tag list; each tag is a key followed by its values
    pub tags: Vec<Vec<String>>,
    /// Opaque content; encrypted frame payload for stream kinds
    pub content: String,
    /// 64-byte schnorr signature over `id`, hex-encoded
    pub sig: String,
}

impl Envelope {
    /// Builds and signs an envelope with `created_at = now`.
    pub fn build(
        keys: &PeerKeys,
        kind: u32,
        tags: Vec<Vec<String>>,
        content: String,
    ) -> Result<Self> {
        Self::build_at(keys, kind, tags, content, unix_now())
    }

    /// Builds and signs an envelope with an explicit timestamp.
    pub fn build_at(
        keys: &PeerKeys,
        kind: u32,
        tags: Vec<Vec<String>>,
        content: String,
        created_at: u64,
    ) -> Result<Self> {
        let pubkey = keys.public_hex();
        let digest = canonical_digest(&pubkey, created_at, kind, &tags, &content)?;
        let sig = keys.sign_digest(&digest)?;

        Ok(Self {
            id: hex::encode(digest),
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig,
        })
    }

    /// Recomputes the canonical id and checks the signature against the
    /// embedded public key.
    pub fn verify(&self) -> Result<()> {
        let digest = canonical_digest(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )?;
        if hex::encode(digest) != self.id {
            return Err(Error::crypto("event id does not match canonical hash"));
        }
        verify_digest(&digest, &self.sig, &self.pubkey)
    }

    /// The first `p` tag value, the intended recipient.
    pub fn recipient(&self) -> Option<&str> {
        self.tag_value(TAG_RECIPIENT)
    }

    /// The `expiration` tag parsed as unix seconds.
    pub fn expiration(&self) -> Option<u64> {
        self.tag_value(TAG_EXPIRATION)?.parse().ok()
    }

    fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(key))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// Serializes the envelope for the relay wire.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::malformed(e.to_string()))
    }

    /// Parses an envelope from relay JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::malformed(e.to_string()))
    }
}

/// A `["p", recipient]` tag.
pub fn recipient_tag(pubkey_hex: &str) -> Vec<String> {
    vec![TAG_RECIPIENT.to_string(), pubkey_hex.to_string()]
}

/// An `["expiration", unix]` tag.
pub fn expiration_tag(unix: u64) -> Vec<String> {
    vec![TAG_EXPIRATION.to_string(), unix.to_string()]
}

fn canonical_digest(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> Result<[u8; 32]> {
    let serialized = serde_json::to_string(&(0u8, pubkey, created_at, kind, tags, content))
        .map_err(|e| Error::malformed(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KIND_EPHEMERAL_STREAM;

    fn signed() -> (PeerKeys, Envelope) {
        let keys = PeerKeys::generate();
        let tags = vec![recipient_tag("ab".repeat(32).as_str())];
        let env = Envelope::build_at(
            &keys,
            KIND_EPHEMERAL_STREAM,
            tags,
            "armored-payload".into(),
            1_700_000_000,
        )
        .unwrap();
        (keys, env)
    }

    #[test]
    fn test_sign_then_verify() {
        let (_, env) = signed();
        env.verify().unwrap();
    }

    #[test]
    fn test_id_is_deterministic() {
        let keys = PeerKeys::generate();
        let build = || {
            Envelope::build_at(&keys, 1, vec![], "same content".into(), 1_700_000_000).unwrap()
        };
        assert_eq!(build().id, build().id);
    }

    #[test]
    fn test_any_changed_byte_invalidates() {
        let (_, env) = signed();

        let mut e = env.clone();
        e.content.push('x');
        assert!(e.verify().is_err());

        let mut e = env.clone();
        e.created_at += 1;
        assert!(e.verify().is_err());

        let mut e = env.clone();
        e.kind += 1;
        assert!(e.verify().is_err());

        let mut e = env;
        e.tags.push(vec!["e".into(), "0".repeat(64)]);
        assert!(e.verify().is_err());
    }

    #[test]
    fn test_recipient_and_expiration_tags() {
        let keys = PeerKeys::generate();
        let peer = "cd".repeat(32);
        let env = Envelope::build(
            &keys,
            crate::KIND_ANNOUNCE,
            vec![recipient_tag(&peer), expiration_tag(1_700_000_010)],
            String::new(),
        )
        .unwrap();

        assert_eq!(env.recipient(), Some(peer.as_str()));
        assert_eq!(env.expiration(), Some(1_700_000_010));
    }

    #[test]
    fn test_missing_tags_are_none() {
        let (_, env) = signed();
        assert_eq!(env.expiration(), None);
    }

    #[test]
    fn test_json_roundtrip_ignores_unknown_fields() {
        let (_, env) = signed();
        let mut value: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        value["some_future_field"] = serde_json::json!({"nested": true});

        let parsed = Envelope::from_json(&value.to_string()).unwrap();
        assert_eq!(parsed, env);
        parsed.verify().unwrap();
    }
}
