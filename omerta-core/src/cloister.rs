//! Cloister (spec.md §4.12): the in-band key-agreement service. Both flows are
//! ephemeral-X25519 + HKDF-SHA256; this module is the protocol state machine and
//! message wire shapes, independent of how the messages actually travel (the node
//! wires it to the Channel Service's reserved `cloister-*`/`invite-*` channels).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use omerta_crypto::ephemeral::{self, EphemeralKeypair};
use omerta_crypto::wire::{self, NONCE_SIZE};
use omerta_crypto::{PeerId, Secret};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const CONFIRMATION_CONSTANT: &[u8] = b"omerta-cloister-confirmed";
const SESSION_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    NetworkKey,
    InviteKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloisterRequest {
    pub request_id: u64,
    pub network_name: String,
    pub a_pub: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloisterResponse {
    pub request_id: u64,
    pub accepted: bool,
    pub b_pub: [u8; 32],
    pub confirmation_nonce: [u8; NONCE_SIZE],
    pub encrypted_confirmation: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteKeyExchangeRequest {
    pub request_id: u64,
    pub a_pub: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteKeyExchangeResponse {
    pub request_id: u64,
    pub b_pub: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvitePayload {
    pub request_id: u64,
    pub nonce: [u8; NONCE_SIZE],
    /// `sealed(inviteKey, networkKey || networkName)`.
    pub sealed: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteFinalAck {
    pub request_id: u64,
    pub ok: bool,
}

/// Result of a completed negotiation, handed to the node layer to persist and emit as
/// a `CloisterResult` event.
#[derive(Debug, Clone)]
pub struct CloisterResult {
    pub network_key: Secret<32>,
    pub network_id_hex: String,
    pub shared_with: PeerId,
}

struct PendingSession {
    keypair: Option<EphemeralKeypair>,
    purpose: Purpose,
    created_at: Instant,
}

/// Tracks pending sessions for both flows. A single map suffices since request ids are
/// drawn from the same space and a session is only ever in one flow.
pub struct CloisterService {
    sessions: Mutex<HashMap<u64, PendingSession>>,
    next_id: Mutex<u64>,
}

impl CloisterService {
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()), next_id: Mutex::new(0) }
    }

    fn fresh_id(&self) -> u64 {
        let mut n = self.next_id.lock();
        *n += 1;
        *n
    }

    fn take_session(&self, request_id: u64, now: Instant) -> Result<PendingSession> {
        let mut sessions = self.sessions.lock();
        let session = sessions.remove(&request_id).ok_or(Error::SessionExpired)?;
        if now.saturating_duration_since(session.created_at) > SESSION_TTL {
            return Err(Error::SessionExpired);
        }
        Ok(session)
    }

    pub fn expire_stale(&self, now: Instant) {
        self.sessions.lock().retain(|_, s| now.saturating_duration_since(s.created_at) <= SESSION_TTL);
    }

    // ---- Negotiate a new network key ----

    /// Initiator side: begins a negotiation, returns the request to send on
    /// `cloister-negotiate`.
    pub fn negotiate_new_network_key(&self, network_name: String) -> CloisterRequest {
        let request_id = self.fresh_id();
        let keypair = EphemeralKeypair::generate();
        let a_pub = keypair.public_bytes();
        self.sessions.lock().insert(request_id, PendingSession { keypair: Some(keypair), purpose: Purpose::NetworkKey, created_at: Instant::now() });
        CloisterRequest { request_id, network_name, a_pub }
    }

    /// Responder side: handles an incoming `CloisterRequest`, deriving the new network
    /// key immediately (auto-accept, per spec.md's end-to-end scenario 4) and returning
    /// both the wire response and the result to persist locally.
    pub fn handle_negotiate_request(&self, from: PeerId, request: &CloisterRequest) -> (CloisterResponse, CloisterResult) {
        let keypair = EphemeralKeypair::generate();
        let b_pub = keypair.public_bytes();
        let shared = keypair.agree(&request.a_pub);
        let network_key = ephemeral::derive_network_key(&shared);
        let (_, network_id_hex) = wire::network_id_and_hash(network_key.as_bytes());

        let nonce = wire::random_header_nonce();
        let encrypted_confirmation = wire::seal_payload(&network_key, &nonce, CONFIRMATION_CONSTANT);

        let response =
            CloisterResponse { request_id: request.request_id, accepted: true, b_pub, confirmation_nonce: nonce, encrypted_confirmation };
        let result = CloisterResult { network_key, network_id_hex, shared_with: from };
        (response, result)
    }

    /// Initiator side: consumes the pending session (destroying its ephemeral secret),
    /// verifies the confirmation, and returns the agreed result.
    pub fn handle_negotiate_response(&self, from: PeerId, response: &CloisterResponse) -> Result<CloisterResult> {
        let mut session = self.take_session(response.request_id, Instant::now())?;
        if session.purpose != Purpose::NetworkKey {
            return Err(Error::PeerMismatch);
        }
        if !response.accepted {
            return Err(Error::CloisterRejected("responder declined".into()));
        }
        let keypair = session.keypair.take().ok_or(Error::KeyExchangeFailed)?;
        let shared = keypair.agree(&response.b_pub);
        let network_key = ephemeral::derive_network_key(&shared);

        let confirmed = wire::open_payload(&network_key, &response.confirmation_nonce, &response.encrypted_confirmation)
            .ok_or(Error::ConfirmationMismatch)?;
        if confirmed != CONFIRMATION_CONSTANT {
            return Err(Error::ConfirmationMismatch);
        }

        let (_, network_id_hex) = wire::network_id_and_hash(network_key.as_bytes());
        Ok(CloisterResult { network_key, network_id_hex, shared_with: from })
    }

    // ---- Share an existing invite ----

    pub fn start_invite_share(&self) -> InviteKeyExchangeRequest {
        let request_id = self.fresh_id();
        let keypair = EphemeralKeypair::generate();
        let a_pub = keypair.public_bytes();
        self.sessions.lock().insert(request_id, PendingSession { keypair: Some(keypair), purpose: Purpose::InviteKey, created_at: Instant::now() });
        InviteKeyExchangeRequest { request_id, a_pub }
    }

    pub fn handle_invite_key_exchange_request(&self, request: &InviteKeyExchangeRequest) -> (InviteKeyExchangeResponse, Secret<32>) {
        let keypair = EphemeralKeypair::generate();
        let b_pub = keypair.public_bytes();
        let shared = keypair.agree(&request.a_pub);
        let invite_key = ephemeral::derive_invite_key(&shared);
        (InviteKeyExchangeResponse { request_id: request.request_id, b_pub }, invite_key)
    }

    /// Initiator side, round 1 completion: derives `inviteKey` and immediately builds
    /// round 2's sealed payload carrying the existing network key.
    pub fn handle_invite_key_exchange_response(
        &self,
        response: &InviteKeyExchangeResponse,
        network_key_to_share: &Secret<32>,
        network_name: Option<&str>,
    ) -> Result<InvitePayload> {
        let mut session = self.take_session(response.request_id, Instant::now())?;
        if session.purpose != Purpose::InviteKey {
            return Err(Error::PeerMismatch);
        }
        let keypair = session.keypair.take().ok_or(Error::KeyExchangeFailed)?;
        let shared = keypair.agree(&response.b_pub);
        let invite_key = ephemeral::derive_invite_key(&shared);

        let mut plaintext = network_key_to_share.as_bytes().to_vec();
        if let Some(name) = network_name {
            plaintext.extend_from_slice(name.as_bytes());
        }
        let nonce = wire::random_header_nonce();
        let sealed = wire::seal_payload(&invite_key, &nonce, &plaintext);
        Ok(InvitePayload { request_id: response.request_id, nonce, sealed })
    }

    /// Responder side, round 2: opens the sealed network key using the `inviteKey`
    /// derived in round 1, and returns the shared network key plus an ack to send back.
    pub fn handle_invite_payload(&self, invite_key: &Secret<32>, payload: &InvitePayload) -> Result<(Secret<32>, InviteFinalAck)> {
        let plaintext = wire::open_payload(invite_key, &payload.nonce, &payload.sealed).ok_or(Error::KeyExchangeFailed)?;
        if plaintext.len() < 32 {
            return Err(Error::KeyExchangeFailed);
        }
        let network_key = Secret::new(plaintext[..32].try_into().unwrap());
        Ok((network_key, InviteFinalAck { request_id: payload.request_id, ok: true }))
    }
}

impl Default for CloisterService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omerta_crypto::Identity;

    #[test]
    fn negotiate_produces_identical_keys_on_both_sides() {
        let initiator = CloisterService::new();
        let responder_peer = Identity::generate().peer_id();
        let initiator_peer = Identity::generate().peer_id();

        let request = initiator.negotiate_new_network_key("priv".to_string());

        // Responder has no CloisterService state to track (auto-accept derives
        // immediately).
        let responder = CloisterService::new();
        let (response, responder_result) = responder.handle_negotiate_request(initiator_peer, &request);

        let initiator_result = initiator.handle_negotiate_response(responder_peer, &response).unwrap();

        assert_eq!(initiator_result.network_key, responder_result.network_key);
        assert_eq!(initiator_result.network_id_hex, responder_result.network_id_hex);
    }

    #[test]
    fn tampered_confirmation_is_rejected() {
        let initiator = CloisterService::new();
        let responder = CloisterService::new();
        let peer = Identity::generate().peer_id();

        let request = initiator.negotiate_new_network_key("priv".to_string());
        let (mut response, _) = responder.handle_negotiate_request(peer, &request);
        response.encrypted_confirmation[0] ^= 0x01;

        let err = initiator.handle_negotiate_response(peer, &response).unwrap_err();
        assert!(matches!(err, Error::ConfirmationMismatch));
    }

    #[test]
    fn unknown_request_id_is_session_expired() {
        let initiator = CloisterService::new();
        let peer = Identity::generate().peer_id();
        let bogus = CloisterResponse {
            request_id: 999_999,
            accepted: true,
            b_pub: [0u8; 32],
            confirmation_nonce: [0u8; NONCE_SIZE],
            encrypted_confirmation: vec![],
        };
        assert!(matches!(initiator.handle_negotiate_response(peer, &bogus), Err(Error::SessionExpired)));
    }

    #[test]
    fn invite_share_round_trip_delivers_identical_key() {
        let initiator = CloisterService::new();
        let responder = CloisterService::new();
        let existing_key = Secret::new([42u8; 32]);

        let req = initiator.start_invite_share();
        let (resp, invite_key_responder) = responder.handle_invite_key_exchange_request(&req);
        let invite_payload = initiator.handle_invite_key_exchange_response(&resp, &existing_key, Some("shared-net")).unwrap();
        let (delivered_key, ack) = responder.handle_invite_payload(&invite_key_responder, &invite_payload).unwrap();

        assert_eq!(delivered_key, existing_key);
        assert!(ack.ok);
    }

    #[test]
    fn expire_stale_removes_old_sessions() {
        let service = CloisterService::new();
        let _req = service.negotiate_new_network_key("n".to_string());
        assert_eq!(service.sessions.lock().len(), 1);
        service.expire_stale(Instant::now() + SESSION_TTL + Duration::from_secs(1));
        assert_eq!(service.sessions.lock().len(), 0);
    }
}
