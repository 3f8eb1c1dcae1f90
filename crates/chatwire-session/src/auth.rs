//! Account login, including the TOTP second factor.

use chatwire_api::{ApiClient, ApiError};

/// Login error.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The account has 2FA enabled and no code was given. Retry with a code.
    #[error("Account has 2FA enabled")]
    MfaRequired,
    #[error("Failed to login: {0}")]
    Login(#[source] ApiError),
    #[error("Failed to login with 2FA: {0}")]
    Totp(#[source] ApiError),
    #[error("Login response carried no token")]
    MissingToken,
}

/// Log in with email and password, answering a 2FA challenge with `code`.
///
/// An empty `code` means none is available: if the account asks for one the
/// call fails with [`AuthError::MfaRequired`] without a second request.
///
/// # Errors
/// Returns error if either exchange fails or the account needs a code.
pub async fn login(
    api: &ApiClient,
    email: &str,
    password: &str,
    code: &str,
) -> Result<String, AuthError> {
    let first = api.login(email, password).await.map_err(AuthError::Login)?;

    if !first.mfa {
        return non_empty(first.token).ok_or(AuthError::MissingToken);
    }

    if code.is_empty() {
        return Err(AuthError::MfaRequired);
    }

    tracing::debug!("Login requires 2FA, sending TOTP code");
    let ticket = first.ticket.unwrap_or_default();
    let second = api.totp(code, &ticket).await.map_err(AuthError::Totp)?;

    non_empty(second.token).ok_or(AuthError::MissingToken)
}

fn non_empty(token: Option<String>) -> Option<String> {
    token.filter(|t| !t.is_empty())
}
