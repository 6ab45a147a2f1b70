//! Peer key pairs for event signing.
//!
//! Every node (and every entry-side stream) signs its events with a
//! secp256k1 key pair; the 32-byte x-only public key, hex-lowercase, is
//! the node's address on the relay network. Secret bytes are zeroized
//! on drop.

use std::sync::LazyLock;

use secp256k1::rand::rngs::OsRng;
use secp256k1::{Keypair, Message, Secp256k1, SecretKey, XOnlyPublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Global secp256k1 context.
///
/// Creating a `Secp256k1` context precomputes signing and verification
/// tables, so it is built once and shared; the context is `Send + Sync`.
pub static SECP: LazyLock<Secp256k1<secp256k1::All>> = LazyLock::new(Secp256k1::new);

/// A secp256k1 key pair identified by its x-only public key.
#[derive(ZeroizeOnDrop)]
pub struct PeerKeys {
    /// The secret scalar (zeroized on drop)
    secret_bytes: [u8; 32],

    /// Cached x-only public key bytes (not sensitive)
    #[zeroize(skip)]
    pubkey_bytes: [u8; 32],
}

impl PeerKeys {
    /// Generates a new random key pair from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        let keypair = Keypair::new(&SECP, &mut OsRng);
        let secret_bytes = keypair.secret_key().secret_bytes();
        let (public_key, _parity) = keypair.x_only_public_key();

        Self {
            secret_bytes,
            pubkey_bytes: public_key.serialize(),
        }
    }

    /// Builds a key pair from 32 raw secret bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid secp256k1 scalar
    /// (zero, or not below the curve order).
    pub fn from_bytes(secret_bytes: [u8; 32]) -> Result<Self> {
        let secret_key =
            SecretKey::from_slice(&secret_bytes).map_err(|e| Error::Key(e.to_string()))?;
        let keypair = Keypair::from_secret_key(&SECP, &secret_key);
        let (public_key, _parity) = keypair.x_only_public_key();

        Ok(Self {
            secret_bytes,
            pubkey_bytes: public_key.serialize(),
        })
    }

    /// Builds a key pair from a 64-character hex secret, the format of
    /// the `NOSTR_PRIVATE_KEY` configuration variable.
    pub fn from_hex(secret_hex: &str) -> Result<Self> {
        let decoded = hex::decode(secret_hex.trim()).map_err(|e| Error::Key(e.to_string()))?;
        let mut secret_bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|_| Error::Key("secret key must be 32 bytes".into()))?;
        let result = Self::from_bytes(secret_bytes);
        secret_bytes.zeroize();
        result
    }

    /// The secret key as lowercase hex. Handle with care.
    #[must_use]
    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret_bytes)
    }

    /// The x-only public key as a 64-character lowercase hex string,
    /// the format used in event `pubkey` fields and `p` tags.
    #[must_use]
    pub fn public_hex(&self) -> String {
        hex::encode(self.pubkey_bytes)
    }

    /// The x-only public key as raw bytes.
    #[must_use]
    pub const fn public_bytes(&self) -> [u8; 32] {
        self.pubkey_bytes
    }

    /// Signs a 32-byte digest with a BIP-340 schnorr signature.
    ///
    /// Returns the 64-byte signature hex-encoded, the format of the
    /// event `sig` field.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Result<String> {
        let mut secret_copy = self.secret_bytes;
        let result = (|| {
            let secret_key =
                SecretKey::from_slice(&secret_copy).map_err(|e| Error::Key(e.to_string()))?;
            let keypair = Keypair::from_secret_key(&SECP, &secret_key);
            let message = Message::from_digest(*digest);
            let signature = SECP.sign_schnorr(&message, &keypair);
            Ok(hex::encode(signature.serialize()))
        })();
        secret_copy.zeroize();
        result
    }

    pub(crate) fn secret_key(&self) -> Result<SecretKey> {
        SecretKey::from_slice(&self.secret_bytes).map_err(|e| Error::Key(e.to_string()))
    }
}

impl std::fmt::Debug for PeerKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret key
        f.debug_struct("PeerKeys")
            .field("pubkey", &self.public_hex())
            .finish()
    }
}

/// Verifies a schnorr signature over a 32-byte digest.
pub fn verify_digest(digest: &[u8; 32], sig_hex: &str, pubkey_hex: &str) -> Result<()> {
    let sig_bytes = hex::decode(sig_hex).map_err(|e| Error::crypto(e.to_string()))?;
    let signature = secp256k1::schnorr::Signature::from_slice(&sig_bytes)
        .map_err(|e| Error::crypto(e.to_string()))?;
    let pubkey = parse_x_only(pubkey_hex)?;
    let message = Message::from_digest(*digest);
    SECP.verify_schnorr(&signature, &message, &pubkey)
        .map_err(|_| Error::crypto("schnorr verification failed"))
}

/// Parses a 64-character hex string into an x-only public key.
pub fn parse_x_only(pubkey_hex: &str) -> Result<XOnlyPublicKey> {
    let bytes = hex::decode(pubkey_hex).map_err(|e| Error::Key(e.to_string()))?;
    XOnlyPublicKey::from_slice(&bytes).map_err(|e| Error::Key(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_produces_valid_keypair() {
        let keys = PeerKeys::generate();
        assert_eq!(keys.public_hex().len(), 64);
        assert_eq!(keys.secret_hex().len(), 64);
    }

    #[test]
    fn test_hex_roundtrip() {
        let keys = PeerKeys::generate();
        let restored = PeerKeys::from_hex(&keys.secret_hex()).unwrap();
        assert_eq!(keys.public_hex(), restored.public_hex());
    }

    #[test]
    fn test_from_bytes_rejects_zero_scalar() {
        assert!(PeerKeys::from_bytes([0u8; 32]).is_err());
    }

    #[test]
    fn test_from_hex_rejects_short_input() {
        assert!(PeerKeys::from_hex("abcd").is_err());
        assert!(PeerKeys::from_hex("not hex at all").is_err());
    }

    #[test]
    fn test_sign_and_verify_digest() {
        let keys = PeerKeys::generate();
        let digest = [0x42u8; 32];
        let sig = keys.sign_digest(&digest).unwrap();
        assert_eq!(sig.len(), 128);
        verify_digest(&digest, &sig, &keys.public_hex()).unwrap();
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let keys = PeerKeys::generate();
        let other = PeerKeys::generate();
        let digest = [0x42u8; 32];
        let sig = keys.sign_digest(&digest).unwrap();
        assert!(verify_digest(&digest, &sig, &other.public_hex()).is_err());
    }

    #[test]
    fn test_verify_rejects_tampered_digest() {
        let keys = PeerKeys::generate();
        let digest = [0x42u8; 32];
        let sig = keys.sign_digest(&digest).unwrap();
        let mut tampered = digest;
        tampered[0] ^= 0x01;
        assert!(verify_digest(&tampered, &sig, &keys.public_hex()).is_err());
    }

    #[test]
    fn test_debug_does_not_leak_secret() {
        let keys = PeerKeys::generate();
        let debug = format!("{keys:?}");
        assert!(debug.contains("pubkey"));
        assert!(!debug.contains(&keys.secret_hex()));
    }
}
