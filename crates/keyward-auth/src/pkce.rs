//! PKCE (RFC 7636) verifier/challenge pairs and CSRF state values.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{AuthError, Result};

const VERIFIER_BYTES: usize = 32;
const STATE_BYTES: usize = 32;

fn random_token(len: usize) -> Result<String> {
    let mut buf = vec![0u8; len];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| AuthError::config("system random number generator unavailable"))?;
    Ok(URL_SAFE_NO_PAD.encode(&buf))
}

/// A 43-character base64url code verifier.
pub fn generate_code_verifier() -> Result<String> {
    random_token(VERIFIER_BYTES)
}

/// The S256 challenge for `verifier`.
pub fn code_challenge(verifier: &str) -> String {
    let hash = digest::digest(&digest::SHA256, verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash.as_ref())
}

/// An unguessable `state` value.
pub fn generate_state() -> Result<String> {
    random_token(STATE_BYTES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc7636_appendix_b_vector() {
        assert_eq!(
            code_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn verifier_length_and_alphabet() {
        let verifier = generate_code_verifier().unwrap();
        assert_eq!(verifier.len(), 43);
        assert!(
            verifier
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn states_are_unique() {
        let a = generate_state().unwrap();
        let b = generate_state().unwrap();
        assert_ne!(a, b);
    }
}
