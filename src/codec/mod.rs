//! Event codec: key pairs, conversation-key encryption, signed
//! envelopes and session frames.
//!
//! [`MessageCodec`] ties the pieces together for one identity: it seals
//! frames toward a peer, opens frames received from a peer, and signs
//! outgoing envelopes. Conversation keys are cached per peer behind a
//! read-mostly lock.

mod conversation;
mod envelope;
mod frame;
mod keys;

pub use conversation::ConversationKey;
pub use envelope::{expiration_tag, recipient_tag, Envelope, TAG_EXPIRATION, TAG_RECIPIENT};
pub use frame::{FrameType, StreamFrame};
pub use keys::{parse_x_only, verify_digest, PeerKeys, SECP};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;

/// Codec bound to one identity.
///
/// Cheap to clone; clones share the key pair and the conversation-key
/// cache.
#[derive(Clone)]
pub struct MessageCodec {
    keys: Arc<PeerKeys>,
    conversations: Arc<RwLock<HashMap<String, ConversationKey>>>,
}

impl MessageCodec {
    /// Creates a codec around an identity key pair.
    pub fn new(keys: Arc<PeerKeys>) -> Self {
        Self {
            keys,
            conversations: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The identity's x-only public key, hex-encoded.
    pub fn public_hex(&self) -> String {
        self.keys.public_hex()
    }

    /// The identity key pair.
    pub fn keys(&self) -> &PeerKeys {
        &self.keys
    }

    /// The conversation key toward `peer_hex`, derived once and cached.
    pub fn conversation(&self, peer_hex: &str) -> Result<ConversationKey> {
        if let Some(key) = self.conversations.read().get(peer_hex) {
            return Ok(key.clone());
        }
        let key = ConversationKey::derive(&self.keys, peer_hex)?;
        self.conversations
            .write()
            .insert(peer_hex.to_string(), key.clone());
        Ok(key)
    }

    /// Serializes and encrypts a frame toward `peer_hex`, returning the
    /// armored string for an event's `content` field.
    pub fn seal_frame(&self, frame: &StreamFrame, peer_hex: &str) -> Result<String> {
        let plaintext = frame.to_bytes()?;
        self.conversation(peer_hex)?.seal(&plaintext)
    }

    /// Decrypts and parses a frame received from `peer_hex`.
    pub fn open_frame(&self, content: &str, peer_hex: &str) -> Result<StreamFrame> {
        let plaintext = self.conversation(peer_hex)?.open(content)?;
        StreamFrame::from_bytes(&plaintext)
    }

    /// Encrypts raw bytes toward `peer_hex` (certificate material).
    pub fn seal_bytes(&self, bytes: &[u8], peer_hex: &str) -> Result<String> {
        self.conversation(peer_hex)?.seal(bytes)
    }

    /// Decrypts raw bytes received from `peer_hex`.
    pub fn open_bytes(&self, content: &str, peer_hex: &str) -> Result<Vec<u8>> {
        self.conversation(peer_hex)?.open(content)
    }

    /// Builds a signed envelope authored by this identity.
    pub fn sign_event(&self, kind: u32, tags: Vec<Vec<String>>, content: String) -> Result<Envelope> {
        Envelope::build(&self.keys, kind, tags, content)
    }

    /// Seals a frame and wraps it in a signed stream event addressed to
    /// `peer_hex` with the single mandatory `p` tag.
    pub fn stream_event(&self, frame: &StreamFrame, peer_hex: &str) -> Result<Envelope> {
        let content = self.seal_frame(frame, peer_hex)?;
        self.sign_event(
            crate::KIND_EPHEMERAL_STREAM,
            vec![recipient_tag(peer_hex)],
            content,
        )
    }
}

impl std::fmt::Debug for MessageCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCodec")
            .field("pubkey", &self.public_hex())
            .finish()
    }
}
