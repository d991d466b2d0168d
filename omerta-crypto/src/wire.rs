//! Wire-format cryptography: network key derivation and the two AEAD constructions used
//! by the packet codec (see the core's `codec` module for the byte layout).
//!
//! The header uses a hand-rolled ChaCha20 + truncated Poly1305 construction, the same
//! shape as the legacy Salsa20/Poly1305 mode used for `HELLO`-equivalent packets in
//! earlier mesh generations: the first block of keystream is spent on the one-time
//! Poly1305 key, and the remaining keystream encrypts the header fields. The payload
//! uses stock ChaCha20-Poly1305 (RFC 8439) with its 16-byte tag.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20poly1305::aead::{Aead, KeyInit as AeadKeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce as AeadNonce};
use hkdf::Hkdf;
use poly1305::universal_hash::UniversalHash;
use poly1305::{Key as PolyKey, Poly1305};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::secret::Secret;

pub const NETWORK_KEY_SIZE: usize = 32;
pub const NETWORK_HASH_SIZE: usize = 8;
pub const NONCE_SIZE: usize = 12;
pub const HEADER_TAG_SIZE: usize = 8;
pub const PAYLOAD_TAG_SIZE: usize = 16;

const HEADER_KEY_INFO: &[u8] = b"omerta-header-v2";

/// Compute `networkId` (hex) and `networkHash` (raw bytes, travels inside the header)
/// from a 32-byte network key: both are the first 8 bytes of SHA-256(networkKey).
pub fn network_id_and_hash(network_key: &[u8; NETWORK_KEY_SIZE]) -> ([u8; NETWORK_HASH_SIZE], String) {
    let digest = Sha256::digest(network_key);
    let mut hash = [0u8; NETWORK_HASH_SIZE];
    hash.copy_from_slice(&digest[..NETWORK_HASH_SIZE]);
    (hash, hex::encode(hash))
}

/// Derive the header encryption key from the network key via HKDF-SHA256.
pub fn derive_header_key(network_key: &[u8; NETWORK_KEY_SIZE]) -> Secret<32> {
    let hk = Hkdf::<Sha256>::new(None, network_key);
    let mut out = [0u8; 32];
    hk.expand(HEADER_KEY_INFO, &mut out).expect("32 bytes is a valid HKDF-SHA256 output length");
    Secret::new(out)
}

/// The payload key is the network key itself, used directly with ChaCha20-Poly1305.
pub fn payload_key(network_key: &[u8; NETWORK_KEY_SIZE]) -> Secret<32> {
    Secret::new(*network_key)
}

/// Payload nonces are derived from the header nonce that travels on the wire by
/// flipping the low bit of its last byte, so only one nonce need be transmitted.
pub fn payload_nonce_from_header_nonce(header_nonce: &[u8; NONCE_SIZE]) -> [u8; NONCE_SIZE] {
    let mut n = *header_nonce;
    n[NONCE_SIZE - 1] ^= 0x01;
    n
}

pub fn random_header_nonce() -> [u8; NONCE_SIZE] {
    crate::random::bytes_secure::<NONCE_SIZE>()
}

/// Seals the encrypted header region: returns (ciphertext, 8-byte truncated Poly1305 tag).
pub fn seal_header(key: &Secret<32>, nonce: &[u8; NONCE_SIZE], header_plaintext: &[u8]) -> (Vec<u8>, [u8; HEADER_TAG_SIZE]) {
    let (mut cipher, poly_key) = header_cipher_and_poly_key(key, nonce);
    let mut ciphertext = header_plaintext.to_vec();
    cipher.apply_keystream(&mut ciphertext);
    let tag = Poly1305::new(PolyKey::from_slice(&poly_key)).compute_unpadded(&ciphertext);
    let mut tag8 = [0u8; HEADER_TAG_SIZE];
    tag8.copy_from_slice(&tag[..HEADER_TAG_SIZE]);
    (ciphertext, tag8)
}

/// Opens the encrypted header region. Returns `None` on tag mismatch (`HeaderAuthFail`).
///
/// The tag MUST be checked before the ciphertext is decrypted: callers rely on this to
/// implement the rejection order in the dispatcher (magic/version/header-auth before any
/// attempt to interpret header contents).
pub fn open_header(key: &Secret<32>, nonce: &[u8; NONCE_SIZE], ciphertext: &[u8], tag: &[u8; HEADER_TAG_SIZE]) -> Option<Vec<u8>> {
    let (mut cipher, poly_key) = header_cipher_and_poly_key(key, nonce);
    let computed = Poly1305::new(PolyKey::from_slice(&poly_key)).compute_unpadded(ciphertext);
    if !bool::from(computed[..HEADER_TAG_SIZE].ct_eq(tag)) {
        return None;
    }
    let mut plaintext = ciphertext.to_vec();
    cipher.apply_keystream(&mut plaintext);
    Some(plaintext)
}

fn header_cipher_and_poly_key(key: &Secret<32>, nonce: &[u8; NONCE_SIZE]) -> (chacha20::ChaCha20, [u8; 32]) {
    let mut cipher = chacha20::ChaCha20::new(key.as_bytes().into(), nonce.into());
    let mut poly_key = [0u8; 32];
    cipher.apply_keystream(&mut poly_key);
    (cipher, poly_key)
}

/// Seals the payload region with ChaCha20-Poly1305 (RFC 8439), returning ciphertext||tag.
pub fn seal_payload(key: &Secret<32>, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .encrypt(AeadNonce::from_slice(nonce), Payload { msg: plaintext, aad: b"" })
        .expect("chacha20poly1305 encryption does not fail for valid key/nonce sizes")
}

/// Opens a payload region sealed by [`seal_payload`]. Returns `None` on auth failure
/// (`PayloadAuthFail`).
pub fn open_payload(key: &Secret<32>, nonce: &[u8; NONCE_SIZE], ciphertext_and_tag: &[u8]) -> Option<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .decrypt(AeadNonce::from_slice(nonce), Payload { msg: ciphertext_and_tag, aad: b"" })
        .ok()
}
