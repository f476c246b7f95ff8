//! Per-connection key material and sealing.
//!
//! Every connection generates a fresh X25519 secret and an Ed25519 signing
//! key. After the key exchange completes, outbound payloads are signed and
//! then sealed with the X25519 + XSalsa20-Poly1305 box between the local
//! secret and the remote public key. Activation is monotonic: once a staged
//! box becomes active it stays active until the connection closes.

use crypto_box::aead::{Aead, AeadCore};
use crypto_box::{Nonce, PublicKey as BoxPublicKey, SalsaBox, SecretKey as BoxSecretKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

/// X25519 public key length, raw bytes.
pub const BOX_KEY_SIZE: usize = 32;

/// XSalsa20-Poly1305 nonce length. Prepended to each sealed payload.
pub const NONCE_SIZE: usize = 24;

/// Detached Ed25519 signature length. Prepended to the inner payload.
pub const SIGNATURE_SIZE: usize = 64;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid verify key")]
    InvalidVerifyKey,

    #[error("sealed payload too short: {0} bytes")]
    Truncated(usize),

    #[error("decryption failed")]
    OpenFailed,

    #[error("encryption failed")]
    SealFailed,

    #[error("signature verification failed")]
    BadSignature,
}

/// Key material generated once per connection.
pub struct ConnectionKeys {
    secret: BoxSecretKey,
    signing: SigningKey,
}

impl ConnectionKeys {
    pub fn generate() -> Self {
        Self {
            secret: BoxSecretKey::generate(&mut OsRng),
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Hex encoding of the public encryption key, as sent in the key exchange.
    pub fn public_hex(&self) -> String {
        hex::encode(self.secret.public_key().as_bytes())
    }

    /// Hex encoding of the public verification key.
    pub fn verify_hex(&self) -> String {
        hex::encode(self.signing.verifying_key().as_bytes())
    }

    fn sign(&self, payload: &[u8]) -> Signature {
        self.signing.sign(payload)
    }
}

/// Parse a remote public encryption key from its hex transport form.
pub fn parse_public_hex(s: &str) -> Result<BoxPublicKey, CryptoError> {
    let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidPublicKey)?;
    let raw: [u8; BOX_KEY_SIZE] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    Ok(BoxPublicKey::from(raw))
}

/// Parse a remote verification key from its hex transport form.
pub fn parse_verify_hex(s: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidVerifyKey)?;
    let raw: [u8; BOX_KEY_SIZE] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidVerifyKey)?;
    VerifyingKey::from_bytes(&raw).map_err(|_| CryptoError::InvalidVerifyKey)
}

/// Cipher state for one connection: local keys plus, once the exchange has
/// run, the staged and active boxes.
///
/// `staged` holds a box constructed from both key pairs that is not yet used
/// for I/O. The negotiation confirms both sides are ready before `activate`
/// promotes it. Once active, the box is never cleared.
pub struct Cipher {
    keys: ConnectionKeys,
    remote_ver: Option<VerifyingKey>,
    staged: Option<SalsaBox>,
    active: bool,
}

impl Cipher {
    pub fn new() -> Self {
        Self {
            keys: ConnectionKeys::generate(),
            remote_ver: None,
            staged: None,
            active: false,
        }
    }

    pub fn public_hex(&self) -> String {
        self.keys.public_hex()
    }

    pub fn verify_hex(&self) -> String {
        self.keys.verify_hex()
    }

    /// Store the remote keys and build the staged box. Does not activate.
    pub fn stage(&mut self, pub_hex: &str, ver_hex: &str) -> Result<(), CryptoError> {
        let remote_pub = parse_public_hex(pub_hex)?;
        self.remote_ver = Some(parse_verify_hex(ver_hex)?);
        self.staged = Some(SalsaBox::new(&remote_pub, &self.keys.secret));
        Ok(())
    }

    /// True when a box is staged but not yet carrying traffic.
    pub fn ready(&self) -> bool {
        self.staged.is_some() && !self.active
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Promote the staged box. Returns false when nothing is staged or the
    /// box already went live.
    pub fn activate(&mut self) -> bool {
        if self.ready() {
            self.active = true;
            true
        } else {
            false
        }
    }

    /// Sign and seal an outbound payload. Passthrough while inactive.
    ///
    /// Wire layout: `nonce(24) ‖ box(sig(64) ‖ payload)`.
    pub fn seal(&self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if !self.active {
            return Ok(payload.to_vec());
        }
        let sbox = self.staged.as_ref().ok_or(CryptoError::SealFailed)?;

        let mut signed = Vec::with_capacity(SIGNATURE_SIZE + payload.len());
        signed.extend_from_slice(&self.keys.sign(payload).to_bytes());
        signed.extend_from_slice(payload);

        let nonce = SalsaBox::generate_nonce(&mut OsRng);
        let ciphertext = sbox
            .encrypt(&nonce, signed.as_slice())
            .map_err(|_| CryptoError::SealFailed)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open and verify an inbound payload. Passthrough while inactive.
    pub fn open(&self, wire: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if !self.active {
            return Ok(wire.to_vec());
        }
        let sbox = self.staged.as_ref().ok_or(CryptoError::OpenFailed)?;
        if wire.len() < NONCE_SIZE {
            return Err(CryptoError::Truncated(wire.len()));
        }

        let nonce = Nonce::from_slice(&wire[..NONCE_SIZE]);
        let signed = sbox
            .decrypt(nonce, &wire[NONCE_SIZE..])
            .map_err(|_| CryptoError::OpenFailed)?;

        if signed.len() < SIGNATURE_SIZE {
            return Err(CryptoError::Truncated(signed.len()));
        }
        let sig_bytes: [u8; SIGNATURE_SIZE] = signed[..SIGNATURE_SIZE]
            .try_into()
            .map_err(|_| CryptoError::BadSignature)?;
        let signature = Signature::from_bytes(&sig_bytes);
        let payload = &signed[SIGNATURE_SIZE..];

        let remote_ver = self.remote_ver.as_ref().ok_or(CryptoError::BadSignature)?;
        remote_ver
            .verify(payload, &signature)
            .map_err(|_| CryptoError::BadSignature)?;

        Ok(payload.to_vec())
    }
}

impl Default for Cipher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged_pair() -> (Cipher, Cipher) {
        let mut a = Cipher::new();
        let mut b = Cipher::new();
        a.stage(&b.public_hex(), &b.verify_hex()).unwrap();
        b.stage(&a.public_hex(), &a.verify_hex()).unwrap();
        (a, b)
    }

    #[test]
    fn passthrough_before_activation() {
        let (a, _) = staged_pair();
        assert_eq!(a.seal(b"hello").unwrap(), b"hello");
        assert_eq!(a.open(b"hello").unwrap(), b"hello");
    }

    #[test]
    fn seal_open_round_trip() {
        let (mut a, mut b) = staged_pair();
        assert!(a.activate());
        assert!(b.activate());

        let wire = a.seal(b"payload").unwrap();
        assert_ne!(wire, b"payload");
        assert_eq!(b.open(&wire).unwrap(), b"payload");
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let (mut a, mut b) = staged_pair();
        a.activate();
        b.activate();

        let mut wire = a.seal(b"payload").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        assert!(matches!(b.open(&wire), Err(CryptoError::OpenFailed)));
    }

    #[test]
    fn activation_is_monotonic() {
        let (mut a, _) = staged_pair();
        assert!(a.ready());
        assert!(a.activate());
        assert!(!a.ready());
        assert!(!a.activate());
        assert!(a.is_active());
    }

    #[test]
    fn activate_without_stage_fails() {
        let mut c = Cipher::new();
        assert!(!c.activate());
        assert!(!c.is_active());
    }
}
