use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::random;

pub const PEER_ID_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

/// A peer's long-lived identity: an Ed25519 keypair. `peerId` in the wire format and
/// the data model is simply the raw 32-byte public key.
///
/// Identities are generated once per node and are not rotated by the core (see
/// Non-goals: key rotation on a live network is out of scope).
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a fresh identity from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        random::fill_bytes_secure(&mut seed);
        let signing_key = SigningKey::from_bytes(&seed);
        Self { signing_key }
    }

    /// Reconstruct an identity from a previously persisted 32-byte Ed25519 seed.
    pub fn from_secret_bytes(seed: &[u8; 32]) -> Self {
        Self { signing_key: SigningKey::from_bytes(seed) }
    }

    /// The bytes that should be written to disk to restore this identity later.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Raw public key bytes. This is the peer's `peerId`.
    pub fn peer_id(&self) -> PeerId {
        PeerId(self.signing_key.verifying_key().to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(message).to_bytes()
    }
}

/// A peer identifier: the raw bytes of a peer's Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; PEER_ID_SIZE]);

impl PeerId {
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() == PEER_ID_SIZE {
            let mut a = [0u8; PEER_ID_SIZE];
            a.copy_from_slice(b);
            Some(Self(a))
        } else {
            None
        }
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let v = hex::decode(s).ok()?;
        Self::from_bytes(&v)
    }

    /// Verify a signature made over `message` by the peer identified by this id.
    pub fn verify(&self, message: &[u8], signature: &[u8; SIGNATURE_SIZE]) -> bool {
        let Ok(vk) = VerifyingKey::from_bytes(&self.0) else { return false };
        let sig = Signature::from_bytes(signature);
        vk.verify(message, &sig).is_ok()
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}
