//! Ephemeral X25519 key agreement used by Cloister's two flows (negotiating a fresh
//! network key and sharing an existing one via invite). Every key here is single-use:
//! generated for one session, zeroized the moment the session concludes.

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::secret::Secret;

pub const EPHEMERAL_PUBLIC_KEY_SIZE: usize = 32;

const NETWORK_KEY_INFO: &[u8] = b"omerta-network-key";
const INVITE_KEY_INFO: &[u8] = b"omerta-invite-key";

/// A one-time X25519 keypair. `EphemeralSecret` already zeroizes its scalar on drop;
/// wrapping it here keeps Cloister from having to know the underlying crate.
pub struct EphemeralKeypair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralKeypair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; EPHEMERAL_PUBLIC_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Consumes this keypair's secret scalar to agree on a shared secret with `their_public`.
    /// Consuming (rather than borrowing) mirrors `EphemeralSecret`'s one-shot design: a
    /// session performs exactly one Diffie-Hellman per ephemeral keypair.
    pub fn agree(self, their_public: &[u8; EPHEMERAL_PUBLIC_KEY_SIZE]) -> Secret<32> {
        let their_public = PublicKey::from(*their_public);
        Secret::new(*self.secret.diffie_hellman(&their_public).as_bytes())
    }
}

/// Derive the negotiated network key for a fresh Cloister session from the raw ECDH
/// shared secret.
pub fn derive_network_key(shared_secret: &Secret<32>) -> Secret<32> {
    hkdf_derive(shared_secret, NETWORK_KEY_INFO)
}

/// Derive the transport key used to wrap an existing network key during an invite share.
pub fn derive_invite_key(shared_secret: &Secret<32>) -> Secret<32> {
    hkdf_derive(shared_secret, INVITE_KEY_INFO)
}

fn hkdf_derive(shared_secret: &Secret<32>, info: &[u8]) -> Secret<32> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret.as_bytes());
    let mut out = [0u8; 32];
    hk.expand(info, &mut out).expect("32 bytes is a valid HKDF-SHA256 output length");
    Secret::new(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_produces_matching_shared_secrets() {
        let a = EphemeralKeypair::generate();
        let b = EphemeralKeypair::generate();
        let a_pub = a.public_bytes();
        let b_pub = b.public_bytes();
        let shared_a = a.agree(&b_pub);
        let shared_b = b.agree(&a_pub);
        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn network_key_and_invite_key_derivations_differ() {
        let a = EphemeralKeypair::generate();
        let b_pub = EphemeralKeypair::generate().public_bytes();
        let shared = a.agree(&b_pub);
        let network_key = derive_network_key(&shared);
        let invite_key = derive_invite_key(&shared);
        assert_ne!(network_key, invite_key);
    }
}
