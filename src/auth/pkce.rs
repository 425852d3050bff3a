//! PKCE S256 challenge generation
//!
//! This module implements the Proof Key for Code Exchange (PKCE) extension
//! to OAuth 2.0 as defined in RFC 7636, specifically the `S256` challenge
//! method required by OAuth 2.1.
//!
//! # How PKCE works
//!
//! 1. The client generates a high-entropy random string called the `code_verifier`.
//! 2. The client computes a SHA-256 hash of the verifier and base64url-encodes
//!    it to produce the `code_challenge`.
//! 3. The authorization request includes `code_challenge` and
//!    `code_challenge_method=S256`.
//! 4. The token exchange request includes the original `code_verifier`.
//! 5. The authorization server recomputes the challenge and compares it to
//!    the value sent in step 3, proving possession of the verifier.
//!
//! # References
//!
//! - RFC 7636 <https://www.rfc-editor.org/rfc/rfc7636>
//! - OAuth 2.1 draft <https://datatracker.ietf.org/doc/draft-ietf-oauth-v2-1/>

use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::error::Result;

// ---------------------------------------------------------------------------
// PkceChallenge
// ---------------------------------------------------------------------------

/// A PKCE S256 challenge pair consisting of a verifier and its derived
/// challenge value.
///
/// Created by [`generate`].  The verifier travels with the pending
/// authorization in the state store; the challenge is embedded in the
/// authorization URL.
///
/// # Examples
///
/// ```
/// use tollgate::auth::pkce::generate;
///
/// let challenge = generate().expect("PKCE generation must not fail");
/// assert_eq!(challenge.method, "S256");
/// assert_eq!(challenge.verifier.len(), 43);
/// ```
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    /// The code verifier: a base64url-encoded (no padding) random string of
    /// exactly 43 characters derived from 32 random bytes.
    ///
    /// This value is sent to the token endpoint in the `code_verifier`
    /// parameter during the authorization code exchange.
    pub verifier: String,

    /// The code challenge: the base64url-encoded (no padding) SHA-256 digest
    /// of the UTF-8 representation of [`Self::verifier`].
    ///
    /// This value is sent to the authorization endpoint in the
    /// `code_challenge` parameter.
    pub challenge: String,

    /// The challenge method.  Always `"S256"` for challenges produced by this
    /// module.
    pub method: String,
}

// ---------------------------------------------------------------------------
// Public functions
// ---------------------------------------------------------------------------

/// Generates a fresh PKCE S256 challenge.
///
/// The verifier is 32 cryptographically random bytes encoded as a
/// base64url string without padding (43 characters).  The challenge is the
/// base64url-encoded SHA-256 digest of the verifier string's UTF-8 bytes,
/// as specified in RFC 7636 section 4.2.
///
/// # Returns
///
/// A [`PkceChallenge`] containing `verifier`, `challenge`, and `method`.
///
/// # Errors
///
/// This function is infallible in practice; it returns a `Result` so that
/// callers can use `?` uniformly.
///
/// # Examples
///
/// ```
/// use tollgate::auth::pkce::generate;
///
/// let pkce = generate().unwrap();
///
/// // Verifier is exactly 43 base64url characters (32 bytes * 4/3 rounded).
/// assert_eq!(pkce.verifier.len(), 43);
///
/// // Method is always S256.
/// assert_eq!(pkce.method, "S256");
///
/// // Verifier and challenge are distinct strings.
/// assert_ne!(pkce.verifier, pkce.challenge);
/// ```
pub fn generate() -> Result<PkceChallenge> {
    use rand::RngCore as _;

    // Step 1: 32 cryptographically random bytes.
    let mut random_bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut random_bytes);

    // Step 2: base64url-encode (no padding) to produce the verifier.
    let verifier = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes);

    // Step 3: SHA-256 of the UTF-8 bytes of the verifier string
    //         (RFC 7636 section 4.2: ASCII(BASE64URL(SHA256(ASCII(code_verifier)))))
    let digest = Sha256::digest(verifier.as_bytes());

    // Step 4: base64url-encode (no padding) the digest bytes.
    let challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest.as_slice());

    Ok(PkceChallenge {
        verifier,
        challenge,
        method: "S256".to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
