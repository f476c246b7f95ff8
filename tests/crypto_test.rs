//! Unit tests for the sealing layer.
//!
//! Covers key transport encoding, the staged/active cipher lifecycle, and
//! tamper rejection for both the box and the signature.

use quintet::crypto::{parse_public_hex, parse_verify_hex, Cipher, ConnectionKeys, CryptoError};

fn staged_pair() -> (Cipher, Cipher) {
    let mut a = Cipher::new();
    let mut b = Cipher::new();
    a.stage(&b.public_hex(), &b.verify_hex()).unwrap();
    b.stage(&a.public_hex(), &a.verify_hex()).unwrap();
    (a, b)
}

#[test]
fn test_keys_unique_per_connection() {
    let k1 = ConnectionKeys::generate();
    let k2 = ConnectionKeys::generate();
    assert_ne!(k1.public_hex(), k2.public_hex());
    assert_ne!(k1.verify_hex(), k2.verify_hex());
}

#[test]
fn test_hex_transport_round_trip() {
    let keys = ConnectionKeys::generate();
    assert!(parse_public_hex(&keys.public_hex()).is_ok());
    assert!(parse_verify_hex(&keys.verify_hex()).is_ok());
}

#[test]
fn test_bad_hex_rejected() {
    assert!(matches!(
        parse_public_hex("not hex"),
        Err(CryptoError::InvalidPublicKey)
    ));
    // Right alphabet, wrong length.
    assert!(parse_public_hex("abcd").is_err());
    assert!(parse_verify_hex("abcd").is_err());
}

#[test]
fn test_seal_open_both_directions() {
    let (mut a, mut b) = staged_pair();
    assert!(a.activate());
    assert!(b.activate());

    let to_b = a.seal(b"from a").unwrap();
    assert_eq!(b.open(&to_b).unwrap(), b"from a");

    let to_a = b.seal(b"from b").unwrap();
    assert_eq!(a.open(&to_a).unwrap(), b"from b");
}

#[test]
fn test_wrong_keys_cannot_open() {
    let (mut a, _) = staged_pair();
    let (mut c, mut d) = staged_pair();
    a.activate();
    c.activate();
    d.activate();

    let wire = a.seal(b"for b only").unwrap();
    assert!(d.open(&wire).is_err());
    assert!(c.open(&wire).is_err());
}

#[test]
fn test_truncated_payload_rejected() {
    let (mut a, mut b) = staged_pair();
    a.activate();
    b.activate();

    assert!(matches!(b.open(&[0u8; 7]), Err(CryptoError::Truncated(7))));
    let wire = a.seal(b"x").unwrap();
    assert!(b.open(&wire[..30]).is_err());
}

#[test]
fn test_staged_is_not_active() {
    let (a, _) = staged_pair();
    assert!(a.ready());
    assert!(!a.is_active());
    // Staged but inactive: traffic still passes through untouched.
    assert_eq!(a.seal(b"clear").unwrap(), b"clear");
}
