//! Key exchange that establishes the symmetric session key.
//!
//! The client holds the server's long-term X25519 public key (compiled in, or
//! configured). It generates an ephemeral pair, derives a bootstrap key from the shared
//! secret, and sends its public key in the clear next to a request sealed under that
//! bootstrap key. The server derives the same secret, proves it saw the client nonce and
//! returns its own nonce. Both sides then derive the session key from the secret and
//! both nonces.
//!
//! Handshake state lives in per-attempt structures that are wiped on drop, so concurrent
//! attempts never share secrets.

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::{ExchangeRequest, ExchangeResponse};
use crate::transport::session_store::SessionKeyMaterial;
use crate::utils::crypto::{compute_shared_secret, derive_key, generate_key_pair, SymmetricKey};
use crate::utils::time::current_timestamp;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::time::Duration;
use x25519_dalek::StaticSecret;
use zeroize::Zeroize;

use tracing::{debug, instrument, warn};

/// Requests older than this are refused by the responder
pub const MAX_REQUEST_AGE_SECS: u64 = 30;

/// Future clock skew tolerated on request timestamps
const FUTURE_TOLERANCE_MS: u64 = 2000;

const EXCHANGE_LABEL: &[u8] = b"bootstrap exchange key";

/// Client-side handshake state, valid for one exchange attempt
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct ClientHandshakeState {
    public: [u8; 32],
    shared: [u8; 32],
    exchange_key: SymmetricKey,
    client_nonce: [u8; 16],
}

impl ClientHandshakeState {
    /// Ephemeral public key, sent in the clear with the request
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public
    }

    /// Key sealing both legs of the exchange
    pub fn exchange_key(&self) -> &SymmetricKey {
        &self.exchange_key
    }
}

/// Generate a cryptographically secure random nonce
fn generate_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Compute hash of a nonce for verification
fn hash_nonce(nonce: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.finalize().into()
}

/// Bootstrap key both sides derive from the exchange's shared secret
pub fn exchange_key_from_shared(shared: &[u8; 32]) -> SymmetricKey {
    derive_key(EXCHANGE_LABEL, &[shared])
}

/// Derive a session key from a shared secret and nonces
fn derive_session_key(shared: &[u8], client_nonce: &[u8], server_nonce: &[u8]) -> SymmetricKey {
    let mut hasher = Sha256::new();
    hasher.update(shared);
    hasher.update(b"client_nonce");
    hasher.update(client_nonce);
    hasher.update(b"server_nonce");
    hasher.update(server_nonce);
    hasher.finalize().into()
}

/// Verify that a timestamp is recent enough
pub fn verify_timestamp(timestamp: u64, max_age_seconds: u64) -> bool {
    let current = match current_timestamp() {
        Ok(time) => time,
        Err(_) => return false,
    };
    if timestamp > current + FUTURE_TOLERANCE_MS {
        return false;
    }
    !(current > timestamp && current - timestamp > max_age_seconds * 1000)
}

/// Start an exchange against `server_public`.
///
/// # Returns
/// The per-attempt state and the request to seal under [`ClientHandshakeState::exchange_key`].
#[instrument(skip(server_public))]
pub fn client_exchange_init(
    server_public: &[u8; 32],
) -> Result<(ClientHandshakeState, ExchangeRequest)> {
    let pair = generate_key_pair();
    let mut shared = compute_shared_secret(pair.private(), server_public);
    let exchange_key = exchange_key_from_shared(&shared);
    let nonce = generate_nonce();
    let timestamp = current_timestamp()?;

    let state = ClientHandshakeState {
        public: *pair.public(),
        shared,
        exchange_key,
        client_nonce: nonce,
    };
    shared.zeroize();

    debug!("Client initiating key exchange");
    Ok((state, ExchangeRequest { nonce, timestamp }))
}

/// Check the server's proof and derive the session material.
///
/// `default_ttl` applies when the server does not announce a lifetime.
#[instrument(skip(state, response))]
pub fn client_exchange_finish(
    state: ClientHandshakeState,
    response: &ExchangeResponse,
    default_ttl: Duration,
) -> Result<SessionKeyMaterial> {
    if hash_nonce(&state.client_nonce) != response.nonce_proof {
        warn!("Server nonce proof mismatch");
        return Err(ProtocolError::HandshakeError(
            constants::ERR_NONCE_VERIFICATION_FAILED.into(),
        ));
    }

    let session_key = derive_session_key(&state.shared, &state.client_nonce, &response.server_nonce);
    let ttl = match response.ttl_secs {
        0 => default_ttl,
        secs => Duration::from_secs(secs),
    };

    debug!(ttl_secs = ttl.as_secs(), "Session key derived");
    SessionKeyMaterial::new(state.shared.to_vec(), state.public.to_vec(), session_key, ttl)
}

/// Responder side: the bootstrap key for packets from `client_public`
pub fn server_exchange_key(server_secret: &StaticSecret, client_public: &[u8; 32]) -> SymmetricKey {
    let mut shared = compute_shared_secret(server_secret, client_public);
    let key = exchange_key_from_shared(&shared);
    shared.zeroize();
    key
}

/// Responder side: answer a request and derive the same session material as the client.
///
/// # Errors
/// Returns `HandshakeError` for stale or future-dated requests
#[instrument(skip(server_secret, client_public, request))]
pub fn server_exchange_respond(
    server_secret: &StaticSecret,
    client_public: &[u8; 32],
    request: &ExchangeRequest,
    ttl: Duration,
) -> Result<(ExchangeResponse, SessionKeyMaterial)> {
    if !verify_timestamp(request.timestamp, MAX_REQUEST_AGE_SECS) {
        return Err(ProtocolError::HandshakeError(
            constants::ERR_INVALID_TIMESTAMP.into(),
        ));
    }

    let mut shared = compute_shared_secret(server_secret, client_public);
    let server_nonce = generate_nonce();
    let session_key = derive_session_key(&shared, &request.nonce, &server_nonce);
    let material = SessionKeyMaterial::new(shared.to_vec(), client_public.to_vec(), session_key, ttl)?;
    shared.zeroize();

    let response = ExchangeResponse {
        server_nonce,
        nonce_proof: hash_nonce(&request.nonce),
        ttl_secs: ttl.as_secs(),
    };
    Ok((response, material))
}
