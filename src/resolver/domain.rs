//! Synthetic `.nostr` hostnames.
//!
//! Syntax (case-insensitive): `<relay-label>(.<relay-label>)*.<pubkey-label>.nostr`
//! where every label is base32 in the RFC 4648 hex alphabet (`0-9a-v`),
//! unpadded. The last label before the TLD decodes to the 32-byte
//! x-only public key; each earlier label decodes to one relay URL.
//! A relay label that fails to decode is dropped, not fatal.

use base32::Alphabet;

use crate::codec::parse_x_only;
use crate::error::{Error, Result};

const TLD: &str = "nostr";
const B32: Alphabet = Alphabet::Rfc4648Hex { padding: false };

/// Whether a hostname belongs to the synthetic TLD.
pub fn is_nostr_host(host: &str) -> bool {
    host.rsplit('.').next().is_some_and(|tld| tld.eq_ignore_ascii_case(TLD))
}

/// Splits a destination into host and optional port.
///
/// `"example.com:80"` → `("example.com", Some(80))`; a trailing segment
/// that does not parse as a port is treated as part of the host.
pub fn split_host_port(destination: &str) -> (&str, Option<u16>) {
    match destination.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) if !host.is_empty() => (host, Some(port)),
            _ => (destination, None),
        },
        None => (destination, None),
    }
}

/// Decodes a `.nostr` hostname into `(pubkey_hex, relay_hints)`.
///
/// Relay hints preserve label order. Fails only when the public-key
/// label itself is unusable.
pub fn decode_nostr_host(host: &str) -> Result<(String, Vec<String>)> {
    let host = host.to_ascii_lowercase();
    let stripped = host
        .strip_suffix(".nostr")
        .ok_or_else(|| Error::resolution(format!("{host} is not a .nostr name")))?;

    let mut labels: Vec<&str> = stripped.split('.').collect();
    let pubkey_label = labels
        .pop()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| Error::resolution("missing public-key label"))?;

    let pubkey_bytes = decode_label(pubkey_label)
        .ok_or_else(|| Error::resolution("public-key label is not base32hex"))?;
    if pubkey_bytes.len() != 32 {
        return Err(Error::resolution(format!(
            "public-key label decodes to {} bytes, want 32",
            pubkey_bytes.len()
        )));
    }
    let pubkey_hex = hex::encode(&pubkey_bytes);
    // reject x coordinates that are not on the curve
    parse_x_only(&pubkey_hex).map_err(|e| Error::resolution(e.to_string()))?;

    let relays = labels
        .into_iter()
        .filter_map(decode_label)
        .filter_map(|bytes| String::from_utf8(bytes).ok())
        .collect();

    Ok((pubkey_hex, relays))
}

/// Encodes a public key and relay list as a `.nostr` hostname, the form
/// an exit advertises for itself.
pub fn encode_nostr_host(pubkey_hex: &str, relays: &[String]) -> Result<String> {
    let pubkey = hex::decode(pubkey_hex).map_err(|e| Error::resolution(e.to_string()))?;
    if pubkey.len() != 32 {
        return Err(Error::resolution("public key must be 32 bytes"));
    }

    let mut labels: Vec<String> = relays.iter().map(|r| encode_label(r.as_bytes())).collect();
    labels.push(encode_label(&pubkey));
    labels.push(TLD.to_string());
    Ok(labels.join("."))
}

fn decode_label(label: &str) -> Option<Vec<u8>> {
    base32::decode(B32, &label.to_ascii_uppercase())
}

fn encode_label(bytes: &[u8]) -> String {
    base32::encode(B32, bytes).to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PeerKeys;

    fn pubkey_hex() -> String {
        PeerKeys::generate().public_hex()
    }

    #[test]
    fn test_host_roundtrip_with_relays() {
        let pk = pubkey_hex();
        let relays = vec!["ws://r:6666".to_string(), "wss://relay.example".to_string()];
        let host = encode_nostr_host(&pk, &relays).unwrap();
        assert!(host.ends_with(".nostr"));

        let (pubkey, hints) = decode_nostr_host(&host).unwrap();
        assert_eq!(pubkey, pk);
        assert_eq!(hints, relays);
    }

    #[test]
    fn test_host_roundtrip_bare_key() {
        let pk = pubkey_hex();
        let host = encode_nostr_host(&pk, &[]).unwrap();
        let (pubkey, hints) = decode_nostr_host(&host).unwrap();
        assert_eq!(pubkey, pk);
        assert!(hints.is_empty());
    }

    #[test]
    fn test_decoding_is_case_insensitive() {
        let pk = pubkey_hex();
        let host = encode_nostr_host(&pk, &["ws://r:6666".to_string()]).unwrap();
        let (pubkey, hints) = decode_nostr_host(&host.to_ascii_uppercase()).unwrap();
        assert_eq!(pubkey, pk);
        assert_eq!(hints, vec!["ws://r:6666".to_string()]);
    }

    #[test]
    fn test_undecodable_relay_label_is_dropped() {
        let pk = pubkey_hex();
        let good = encode_nostr_host(&pk, &["ws://r:6666".to_string()]).unwrap();
        // splice a label containing characters outside 0-9a-v
        let host = format!("zzz!.{good}");

        let (pubkey, hints) = decode_nostr_host(&host).unwrap();
        assert_eq!(pubkey, pk);
        assert_eq!(hints, vec!["ws://r:6666".to_string()]);
    }

    #[test]
    fn test_bad_pubkey_label_is_fatal() {
        assert!(decode_nostr_host("notbase32!.nostr").is_err());
        // decodes fine but to the wrong length
        let short = base32::encode(B32, b"short").to_ascii_lowercase();
        assert!(decode_nostr_host(&format!("{short}.nostr")).is_err());
    }

    #[test]
    fn test_is_nostr_host() {
        assert!(is_nostr_host("abc.nostr"));
        assert!(is_nostr_host("ABC.NOSTR"));
        assert!(!is_nostr_host("example.com"));
        assert!(!is_nostr_host("nostr.example.com"));
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("example.com:80"), ("example.com", Some(80)));
        assert_eq!(split_host_port("example.com"), ("example.com", None));
        assert_eq!(split_host_port("a.nostr:3338"), ("a.nostr", Some(3338)));
        // not a port number: keep the whole string as host
        assert_eq!(split_host_port("npub1x:yz"), ("npub1x:yz", None));
    }
}
