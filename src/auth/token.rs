#![forbid(unsafe_code)]

// Test access tokens: `{secret}:{user_id}`.
//
// Simulated clients authenticate against the sync backend with a shared test
// secret instead of a real identity provider. The backend accepts any user id
// prefixed by the secret.

pub fn test_access_token(secret: &str, user_id: &str) -> String {
    format!("{secret}:{user_id}")
}

/// Returns the user id carried by a test token, if it was minted with `secret`.
pub fn parse_test_access_token<'a>(token: &'a str, secret: &str) -> Option<&'a str> {
    if secret.is_empty() {
        return None;
    }
    token
        .strip_prefix(secret)
        .and_then(|rest| rest.strip_prefix(':'))
        .filter(|user_id| !user_id.is_empty())
}
