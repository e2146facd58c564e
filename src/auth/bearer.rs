#![forbid(unsafe_code)]

// Bearer-token check for the control surface.

use crate::auth::types::AuthError;
use axum::http::{header, HeaderMap};
use sha2::{Digest, Sha256};

/// Validates `Authorization: Bearer <token>` against the configured token.
///
/// Both sides are hashed before comparing so the comparison time does not
/// depend on how many leading bytes match.
pub fn authorize(headers: &HeaderMap, expected: &str) -> Result<(), AuthError> {
    let provided = headers.get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(AuthError::MissingToken)?;

    if Sha256::digest(provided.as_bytes()) != Sha256::digest(expected.as_bytes()) {
        return Err(AuthError::InvalidToken);
    }
    Ok(())
}
