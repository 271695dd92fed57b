use {
    base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD},
    rand::RngCore,
    sha2::{Digest, Sha256},
};

use crate::types::PkceCodes;

/// Verifier entropy bounds: 32 bytes encode to 43 chars, 96 bytes to 128,
/// the RFC 7636 length limits.
const MIN_VERIFIER_BYTES: usize = 32;
const MAX_VERIFIER_BYTES: usize = 96;

const STATE_BYTES: usize = 32;

/// Generate a PKCE S256 pair from `verifier_bytes` of OS randomness.
pub fn generate_pkce(verifier_bytes: usize) -> PkceCodes {
    let mut bytes = vec![0u8; verifier_bytes.clamp(MIN_VERIFIER_BYTES, MAX_VERIFIER_BYTES)];
    rand::rng().fill_bytes(&mut bytes);
    pkce_from_bytes(&bytes)
}

/// Build the pair from caller-supplied random bytes.
pub fn pkce_from_bytes(bytes: &[u8]) -> PkceCodes {
    let verifier = URL_SAFE_NO_PAD.encode(bytes);
    let challenge = challenge_for(&verifier);
    PkceCodes {
        verifier,
        challenge,
    }
}

/// `base64url(SHA-256(verifier))`, unpadded.
pub fn challenge_for(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Generate a random CSRF state parameter.
pub fn generate_state() -> String {
    let mut bytes = [0u8; STATE_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    state_from_bytes(&bytes)
}

pub fn state_from_bytes(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}
