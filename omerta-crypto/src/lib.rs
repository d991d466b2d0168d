//! Cryptographic primitives for OmertaMesh: identity keys, wire-format AEAD, and the
//! ephemeral key agreement used by Cloister. Kept free of any networking or I/O so it
//! can be reasoned about (and audited) on its own.

pub mod ephemeral;
pub mod identity;
pub mod random;
pub mod secret;
pub mod wire;

pub use identity::{Identity, PeerId, PEER_ID_SIZE, SIGNATURE_SIZE};
pub use secret::Secret;
