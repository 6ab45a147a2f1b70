//! Bech32 profile tokens (`npub` / `nprofile`).
//!
//! `npub` is a bare x-only public key; `nprofile` adds a TLV list with
//! the key (type 0) and any number of preferred relay URLs (type 1).
//! Unknown TLV types are skipped for forward compatibility.

use bech32::{Bech32, Hrp};

use crate::error::{Error, Result};

const HRP_NPUB: &str = "npub";
const HRP_NPROFILE: &str = "nprofile";

const TLV_PUBKEY: u8 = 0;
const TLV_RELAY: u8 = 1;

/// A decoded profile token: a peer key and optional relay hints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    /// x-only public key, hex-encoded
    pub pubkey: String,
    /// Relay URLs embedded in the token, in order; empty for `npub`
    pub relays: Vec<String>,
}

/// Whether a destination string looks like a profile token.
pub fn is_profile_token(s: &str) -> bool {
    s.starts_with(HRP_NPUB) || s.starts_with(HRP_NPROFILE)
}

/// Decodes an `npub…` or `nprofile…` token.
pub fn decode(token: &str) -> Result<Profile> {
    let (hrp, data) =
        bech32::decode(token).map_err(|e| Error::resolution(format!("bech32: {e}")))?;

    match hrp.as_str() {
        HRP_NPUB => {
            if data.len() != 32 {
                return Err(Error::resolution(format!(
                    "npub payload is {} bytes, want 32",
                    data.len()
                )));
            }
            Ok(Profile {
                pubkey: hex::encode(data),
                relays: Vec::new(),
            })
        }
        HRP_NPROFILE => decode_profile_tlv(&data),
        other => Err(Error::resolution(format!("unknown token prefix {other}"))),
    }
}

/// Encodes a bare public key as `npub…`.
pub fn encode_npub(pubkey_hex: &str) -> Result<String> {
    let bytes = decode_pubkey_hex(pubkey_hex)?;
    encode(HRP_NPUB, &bytes)
}

/// Encodes a public key plus relay list as `nprofile…`.
pub fn encode_nprofile(pubkey_hex: &str, relays: &[String]) -> Result<String> {
    let pubkey = decode_pubkey_hex(pubkey_hex)?;

    let mut tlv = Vec::with_capacity(34 + relays.iter().map(|r| r.len() + 2).sum::<usize>());
    tlv.push(TLV_PUBKEY);
    tlv.push(32);
    tlv.extend_from_slice(&pubkey);
    for relay in relays {
        let len = u8::try_from(relay.len())
            .map_err(|_| Error::resolution("relay url exceeds 255 bytes"))?;
        tlv.push(TLV_RELAY);
        tlv.push(len);
        tlv.extend_from_slice(relay.as_bytes());
    }
    encode(HRP_NPROFILE, &tlv)
}

fn encode(hrp: &str, data: &[u8]) -> Result<String> {
    let hrp = Hrp::parse(hrp).map_err(|e| Error::resolution(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, data).map_err(|e| Error::resolution(e.to_string()))
}

fn decode_profile_tlv(data: &[u8]) -> Result<Profile> {
    let mut pubkey = None;
    let mut relays = Vec::new();

    let mut rest = data;
    while let [typ, len, tail @ ..] = rest {
        let len = *len as usize;
        if tail.len() < len {
            return Err(Error::resolution("truncated nprofile TLV"));
        }
        let (value, next) = tail.split_at(len);
        match *typ {
            TLV_PUBKEY if len == 32 => pubkey = Some(hex::encode(value)),
            TLV_PUBKEY => return Err(Error::resolution("nprofile pubkey must be 32 bytes")),
            TLV_RELAY => match std::str::from_utf8(value) {
                Ok(url) => relays.push(url.to_string()),
                Err(_) => return Err(Error::resolution("nprofile relay is not utf-8")),
            },
            _ => {} // unknown TLV types are skipped
        }
        rest = next;
    }

    Ok(Profile {
        pubkey: pubkey.ok_or_else(|| Error::resolution("nprofile without pubkey"))?,
        relays,
    })
}

fn decode_pubkey_hex(pubkey_hex: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(pubkey_hex).map_err(|e| Error::resolution(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| Error::resolution("public key must be 32 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PK: &str = "8f9738f576f61c64c94fdffb674f77e9e5f154bb63fa02f84a1d65f951961611";

    #[test]
    fn test_npub_roundtrip() {
        let npub = encode_npub(PK).unwrap();
        assert!(npub.starts_with("npub1"));

        let profile = decode(&npub).unwrap();
        assert_eq!(profile.pubkey, PK);
        assert!(profile.relays.is_empty());
    }

    #[test]
    fn test_nprofile_roundtrip_preserves_relay_order() {
        let relays = vec!["ws://r:6666".to_string(), "wss://relay.example".to_string()];
        let token = encode_nprofile(PK, &relays).unwrap();
        assert!(token.starts_with("nprofile1"));

        let profile = decode(&token).unwrap();
        assert_eq!(profile.pubkey, PK);
        assert_eq!(profile.relays, relays);
    }

    #[test]
    fn test_nprofile_without_relays() {
        let token = encode_nprofile(PK, &[]).unwrap();
        let profile = decode(&token).unwrap();
        assert_eq!(profile.pubkey, PK);
        assert!(profile.relays.is_empty());
    }

    #[test]
    fn test_is_profile_token() {
        assert!(is_profile_token("npub1whatever"));
        assert!(is_profile_token("nprofile1whatever"));
        assert!(!is_profile_token("example.com"));
        assert!(!is_profile_token("vvgkh0.nostr"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode("npub1!!!!").is_err());
        assert!(decode("bc1qxyz").is_err());
        assert!(decode("").is_err());
    }

    #[test]
    fn test_unknown_tlv_types_are_skipped() {
        // pubkey TLV followed by an unknown type-7 entry
        let mut tlv = vec![0u8, 32];
        tlv.extend_from_slice(&hex::decode(PK).unwrap());
        tlv.extend_from_slice(&[7, 2, 0xAA, 0xBB]);

        let hrp = Hrp::parse("nprofile").unwrap();
        let token = bech32::encode::<Bech32>(hrp, &tlv).unwrap();

        let profile = decode(&token).unwrap();
        assert_eq!(profile.pubkey, PK);
    }

    #[test]
    fn test_truncated_tlv_is_rejected() {
        let tlv = vec![0u8, 32, 0xAA]; // claims 32 bytes, has 1
        let hrp = Hrp::parse("nprofile").unwrap();
        let token = bech32::encode::<Bech32>(hrp, &tlv).unwrap();
        assert!(decode(&token).is_err());
    }
}
