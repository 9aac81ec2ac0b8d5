use crate::{secrets::SecretRepository, BookingFormError};
use async_once_cell::OnceCell;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, time::Duration};
use tracing::warn;

pub const TURNSTILE_CREDENTIALS_NAME: &str = "turnstile-credentials";
const TURNSTILE_VERIFY_URL: &str = "https://challenges.cloudflare.com/turnstile/v0/siteverify";
const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for Cloudflare Turnstile's siteverify endpoint.
///
/// A verification outcome of `success: false` means the submitter failed the
/// challenge. Anything which prevents obtaining an outcome at all (missing
/// secret, transport failure, unparseable response) is an error in its own
/// right and must never let a submission pass unverified.
pub struct TurnstileVerifier<SecretRepositoryT: SecretRepository> {
    secrets_repository: SecretRepositoryT,
    credentials: OnceCell<TurnstileCredentials>,
}

impl<SecretRepositoryT: SecretRepository> TurnstileVerifier<SecretRepositoryT> {
    pub fn new(secrets_repository: SecretRepositoryT) -> Self {
        Self {
            secrets_repository,
            credentials: Default::default(),
        }
    }

    pub async fn verify_token(
        &self,
        token: &str,
        remote_ip: &str,
    ) -> Result<(), TurnstileError> {
        let credentials = self
            .credentials
            .get_or_try_init(
                self.secrets_repository
                    .get_secret(TURNSTILE_CREDENTIALS_NAME),
            )
            .await
            .map_err(|error| {
                warn!("Could not retrieve Turnstile credentials {TURNSTILE_CREDENTIALS_NAME}: {error}");
                TurnstileError::MissingSecret(error.to_string())
            })?;
        let response = Client::new()
            .post(Self::verification_url().as_ref())
            .timeout(VERIFY_TIMEOUT)
            .form(&TurnstileVerifyPayload {
                secret: &credentials.secret,
                response: token,
                remoteip: remote_ip,
            })
            .send()
            .await
            .map_err(TurnstileError::Transport)?;
        let outcome: TurnstileOutcome = response
            .json()
            .await
            .map_err(|error| TurnstileError::InvalidResponse(error.to_string()))?;
        if outcome.success {
            Ok(())
        } else {
            Err(TurnstileError::Rejected(outcome.error_codes))
        }
    }

    fn verification_url() -> Cow<'static, str> {
        std::env::var("TURNSTILE_VERIFY_URL")
            .map(Cow::Owned)
            .unwrap_or(TURNSTILE_VERIFY_URL.into())
    }
}

#[derive(Deserialize, Clone)]
struct TurnstileCredentials {
    #[serde(rename = "TURNSTILE_SECRET")]
    secret: String,
}

#[derive(Serialize)]
struct TurnstileVerifyPayload<'a> {
    secret: &'a str,
    response: &'a str,
    remoteip: &'a str,
}

#[derive(Deserialize)]
struct TurnstileOutcome {
    success: bool,
    #[serde(rename = "error-codes", default)]
    error_codes: Vec<String>,
}

#[derive(Debug)]
pub enum TurnstileError {
    Rejected(Vec<String>),
    MissingSecret(String),
    Transport(reqwest::Error),
    InvalidResponse(String),
}

impl TurnstileError {
    pub fn into_booking_form_error(self) -> BookingFormError {
        match self {
            TurnstileError::Rejected(codes) => BookingFormError::TurnstileRejected(codes),
            TurnstileError::MissingSecret(detail) => {
                BookingFormError::ServerError(format!("Turnstile secret unavailable: {detail}"))
            }
            TurnstileError::Transport(error) => BookingFormError::ServerError(format!(
                "Error calling Turnstile verification: {error}"
            )),
            TurnstileError::InvalidResponse(detail) => BookingFormError::ServerError(format!(
                "Unparseable Turnstile verification response: {detail}"
            )),
        }
    }
}

impl std::fmt::Display for TurnstileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnstileError::Rejected(codes) => write!(f, "Verification rejected: {codes:?}"),
            TurnstileError::MissingSecret(detail) => write!(f, "Missing secret: {detail}"),
            TurnstileError::Transport(error) => write!(f, "Transport error: {error}"),
            TurnstileError::InvalidResponse(detail) => write!(f, "Invalid response: {detail}"),
        }
    }
}

impl std::error::Error for TurnstileError {}
