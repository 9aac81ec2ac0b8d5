mod compose;
mod mailchannels;
mod secrets;
mod turnstile;

use async_once_cell::OnceCell;
use compose::RecipientSet;
use lambda_http::{
    http::{Method, StatusCode},
    run, service_fn, Body, Error, Request, RequestPayloadExt, Response,
};
use mailchannels::{MailChannelsClient, MailChannelsError};
use secrets::{AwsSecretsManagerSecretRepository, SecretRepository};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{
    fmt::Display,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::{error, info, warn};
use turnstile::TurnstileVerifier;

const MAILCHANNELS_API_KEY_NAME: &str = "mailchannels-api-key";

/// Submissions completed faster than a human plausibly fills the form are
/// treated as automated.
const MIN_FILL_TIME: Duration = Duration::from_millis(3000);

const DEFAULT_REQUIRED_FIELDS: [RequiredField; 5] = [
    RequiredField::FirstName,
    RequiredField::LastName,
    RequiredField::Email,
    RequiredField::Phone,
    RequiredField::Date,
];

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .without_time()
        .init();

    let handler = BookingRequestHandler::<AwsSecretsManagerSecretRepository>::new().await;
    run(service_fn(|event| handler.handle(event))).await
}

struct BookingRequestHandler<SecretRepositoryT: SecretRepository> {
    secrets_repository: SecretRepositoryT,
    turnstile_verifier: TurnstileVerifier<SecretRepositoryT>,
    mailer: MailChannelsClient,
    api_key: OnceCell<MailChannelsApiKey>,
    required_fields: Vec<RequiredField>,
    recipients: RecipientSet,
}

impl<SecretRepositoryT: SecretRepository> BookingRequestHandler<SecretRepositoryT> {
    async fn new() -> Self
    where
        SecretRepositoryT: Clone,
    {
        let secrets_repository = SecretRepositoryT::open().await;
        Self {
            secrets_repository: secrets_repository.clone(),
            turnstile_verifier: TurnstileVerifier::new(secrets_repository),
            mailer: MailChannelsClient::new(),
            api_key: Default::default(),
            required_fields: required_fields_from_environment(),
            recipients: RecipientSet::from_environment(),
        }
    }

    async fn handle(&self, event: Request) -> Result<Response<Body>, Error> {
        let method = event.method();
        if method == Method::GET {
            Ok(json_response(
                StatusCode::OK,
                json!({"ok": true, "hint": "POST JSON to this endpoint."}),
            ))
        } else if method == Method::OPTIONS {
            Ok(preflight_response())
        } else if method == Method::POST {
            self.handle_submission(event).await
        } else {
            Ok(json_response(
                StatusCode::METHOD_NOT_ALLOWED,
                json!({"error": "method_not_allowed"}),
            ))
        }
    }

    async fn handle_submission(&self, event: Request) -> Result<Response<Body>, Error> {
        let remote_ip = caller_ip(&event);
        let request = match event.payload::<BookingRequest>() {
            Ok(Some(request)) => request,
            Ok(None) => {
                let error = BookingFormError::ServerError("Missing request payload".into());
                error.log();
                return Ok(error.into_response());
            }
            Err(parse_error) => {
                let error = BookingFormError::ServerError(format!(
                    "Malformed request payload: {parse_error}"
                ));
                error.log();
                return Ok(error.into_response());
            }
        };
        match self.process_submission(&request, &remote_ip).await {
            Ok(outcome) => Ok(outcome.into_response()),
            Err(error) => {
                error.log();
                Ok(error.into_response())
            }
        }
    }

    async fn process_submission(
        &self,
        request: &BookingRequest,
        remote_ip: &str,
    ) -> Result<SubmissionOutcome, BookingFormError> {
        let booking = request.validate(&self.required_fields)?;

        if request.is_suspected_bot() {
            info!("Suspected automated submission, silently accepting");
            return Ok(SubmissionOutcome::SilentlyDiscarded);
        }

        let Some(token) = booking.turnstile_token else {
            return Err(BookingFormError::TurnstileMissing);
        };
        self.turnstile_verifier
            .verify_token(token, remote_ip)
            .await
            .map_err(|error| error.into_booking_form_error())?;

        if self.recipients.is_empty() {
            return Err(BookingFormError::MissingRecipients);
        }
        let api_key = self.api_key().await?;

        let requested_dates = compose::format_requested_dates(booking.date, booking.date_end);
        let internal =
            compose::internal_notification(&booking, &self.recipients, &requested_dates);
        let guest = compose::guest_acknowledgement(&booking, &self.recipients, &requested_dates);

        match self.mailer.send(api_key, &internal).await {
            Ok(()) => {}
            Err(MailChannelsError::Rejected { status, detail }) => {
                return Err(BookingFormError::InternalSendRejected { status, detail });
            }
            Err(MailChannelsError::Transport(error)) => {
                return Err(BookingFormError::ServerError(format!(
                    "Error sending internal notification: {error}"
                )));
            }
        }

        // The acknowledgement is a courtesy; its failure never demotes a
        // delivered internal notification to an error.
        if let Err(error) = self.mailer.send(api_key, &guest).await {
            warn!("Guest acknowledgement failed: {error}");
            return Ok(SubmissionOutcome::GuestAcknowledgementFailed(
                error.to_string(),
            ));
        }

        Ok(SubmissionOutcome::Delivered)
    }

    async fn api_key(&self) -> Result<&str, BookingFormError> {
        let api_key = self
            .api_key
            .get_or_try_init(
                self.secrets_repository
                    .get_secret::<MailChannelsApiKey>(MAILCHANNELS_API_KEY_NAME),
            )
            .await
            .map_err(|error| {
                warn!("Could not retrieve MailChannels API key {MAILCHANNELS_API_KEY_NAME}: {error}");
                BookingFormError::MissingApiKey
            })?;
        Ok(api_key.api_key.as_str())
    }
}

#[derive(Deserialize, Debug)]
struct BookingRequest {
    first_name: Option<String>,
    last_name: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    date: Option<String>,
    date_end: Option<String>,
    message: Option<String>,
    /// Honeypot. Humans never see the field, so any value marks a bot.
    company: Option<String>,
    /// Epoch milliseconds recorded by the form when it was first rendered.
    /// Historical clients sent this both as a number and as a string.
    started_ms: Option<Value>,
    turnstile_token: Option<String>,
}

impl BookingRequest {
    fn validate(
        &self,
        required_fields: &[RequiredField],
    ) -> Result<ValidatedBooking, BookingFormError> {
        for field in required_fields {
            if self
                .field_value(*field)
                .map(str::trim)
                .unwrap_or("")
                .is_empty()
            {
                return Err(BookingFormError::MissingField(field.name()));
            }
        }
        Ok(ValidatedBooking {
            first_name: trimmed(&self.first_name).unwrap_or(""),
            last_name: trimmed(&self.last_name).unwrap_or(""),
            email: trimmed(&self.email).unwrap_or(""),
            phone: trimmed(&self.phone),
            date: trimmed(&self.date),
            date_end: trimmed(&self.date_end),
            message: trimmed(&self.message),
            turnstile_token: trimmed(&self.turnstile_token),
        })
    }

    fn field_value(&self, field: RequiredField) -> Option<&str> {
        match field {
            RequiredField::FirstName => self.first_name.as_deref(),
            RequiredField::LastName => self.last_name.as_deref(),
            RequiredField::Email => self.email.as_deref(),
            RequiredField::Phone => self.phone.as_deref(),
            RequiredField::Date => self.date.as_deref(),
        }
    }

    fn is_suspected_bot(&self) -> bool {
        if self
            .company
            .as_deref()
            .is_some_and(|value| !value.trim().is_empty())
        {
            return true;
        }
        if let Some(started) = self.started_millis() {
            let elapsed = current_epoch_millis().saturating_sub(started);
            if elapsed < MIN_FILL_TIME.as_millis() as i64 {
                return true;
            }
        }
        false
    }

    fn started_millis(&self) -> Option<i64> {
        match self.started_ms.as_ref()? {
            Value::Number(number) => number.as_f64().map(|value| value as i64),
            Value::String(text) => text.trim().parse::<f64>().ok().map(|value| value as i64),
            _ => None,
        }
    }
}

fn trimmed(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|trimmed| !trimmed.is_empty())
}

struct ValidatedBooking<'a> {
    first_name: &'a str,
    last_name: &'a str,
    email: &'a str,
    phone: Option<&'a str>,
    date: Option<&'a str>,
    date_end: Option<&'a str>,
    message: Option<&'a str>,
    turnstile_token: Option<&'a str>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RequiredField {
    FirstName,
    LastName,
    Email,
    Phone,
    Date,
}

impl RequiredField {
    fn name(self) -> &'static str {
        match self {
            RequiredField::FirstName => "first_name",
            RequiredField::LastName => "last_name",
            RequiredField::Email => "email",
            RequiredField::Phone => "phone",
            RequiredField::Date => "date",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "first_name" => Some(RequiredField::FirstName),
            "last_name" => Some(RequiredField::LastName),
            "email" => Some(RequiredField::Email),
            "phone" => Some(RequiredField::Phone),
            "date" => Some(RequiredField::Date),
            _ => None,
        }
    }
}

fn required_fields_from_environment() -> Vec<RequiredField> {
    let Ok(raw) = std::env::var("REQUIRED_FIELDS") else {
        return DEFAULT_REQUIRED_FIELDS.to_vec();
    };
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .filter_map(|name| {
            let field = RequiredField::from_name(name);
            if field.is_none() {
                warn!("Ignoring unknown required field {name}");
            }
            field
        })
        .collect()
}

fn current_epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

fn caller_ip(event: &Request) -> String {
    if let Some(ip) = header_value(event, "CF-Connecting-IP") {
        return ip;
    }
    header_value(event, "X-Forwarded-For")
        .and_then(|forwarded| {
            forwarded
                .split(',')
                .next()
                .map(|first| first.trim().to_string())
        })
        .unwrap_or_default()
}

fn header_value(event: &Request, name: &str) -> Option<String> {
    event
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

fn json_response(status: StatusCode, body: Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(body.to_string().into())
        .unwrap()
}

fn preflight_response() -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "POST, OPTIONS, GET")
        .header("Access-Control-Allow-Headers", "Content-Type")
        .body(Body::Empty)
        .unwrap()
}

enum SubmissionOutcome {
    Delivered,
    GuestAcknowledgementFailed(String),
    /// Suspected bot. Reported as success so automated clients cannot tell
    /// they were detected.
    SilentlyDiscarded,
}

impl SubmissionOutcome {
    fn into_response(self) -> Response<Body> {
        match self {
            SubmissionOutcome::Delivered | SubmissionOutcome::SilentlyDiscarded => {
                json_response(StatusCode::OK, json!({"ok": true}))
            }
            SubmissionOutcome::GuestAcknowledgementFailed(detail) => json_response(
                StatusCode::OK,
                json!({"ok": true, "warn": "guest_ack_failed", "detail": detail}),
            ),
        }
    }
}

#[derive(Debug)]
enum BookingFormError {
    MissingField(&'static str),
    TurnstileMissing,
    TurnstileRejected(Vec<String>),
    MissingRecipients,
    MissingApiKey,
    InternalSendRejected { status: u16, detail: String },
    ServerError(String),
}

impl BookingFormError {
    fn log(&self) {
        match self {
            BookingFormError::MissingField(field) => {
                info!("Rejected submission with missing field {field}");
            }
            BookingFormError::TurnstileMissing => {
                info!("Rejected submission without Turnstile token");
            }
            BookingFormError::TurnstileRejected(codes) => {
                info!("Turnstile rejected submission: {codes:?}");
            }
            BookingFormError::MissingRecipients => {
                error!("TO_EMAILS is empty, cannot deliver booking requests");
            }
            BookingFormError::MissingApiKey => {
                error!("MailChannels API key is not configured");
            }
            BookingFormError::InternalSendRejected { status, detail } => {
                error!("MailChannels rejected internal notification with status {status}: {detail}");
            }
            BookingFormError::ServerError(description) => {
                error!("Internal error processing booking request: {description}");
            }
        }
    }

    fn into_response(self) -> Response<Body> {
        match self {
            BookingFormError::MissingField(field) => json_response(
                StatusCode::BAD_REQUEST,
                json!({"error": format!("Missing field: {field}")}),
            ),
            BookingFormError::TurnstileMissing => json_response(
                StatusCode::BAD_REQUEST,
                json!({"error": "turnstile_missing"}),
            ),
            BookingFormError::TurnstileRejected(codes) => json_response(
                StatusCode::BAD_REQUEST,
                json!({"error": "turnstile_failed", "detail": codes}),
            ),
            BookingFormError::MissingRecipients => json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "missing_to_emails"}),
            ),
            BookingFormError::MissingApiKey => json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "missing_api_key"}),
            ),
            BookingFormError::InternalSendRejected { status, detail } => json_response(
                StatusCode::BAD_GATEWAY,
                json!({
                    "error": "mailchannels_failed_internal",
                    "status": status,
                    "detail": detail,
                }),
            ),
            BookingFormError::ServerError(description) => json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "server_error", "detail": description}),
            ),
        }
    }
}

impl Display for BookingFormError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingFormError::MissingField(field) => write!(f, "Missing field: {field}"),
            BookingFormError::TurnstileMissing => write!(f, "Turnstile token missing"),
            BookingFormError::TurnstileRejected(codes) => {
                write!(f, "Turnstile verification failed: {codes:?}")
            }
            BookingFormError::MissingRecipients => write!(f, "No recipients configured"),
            BookingFormError::MissingApiKey => write!(f, "No MailChannels API key configured"),
            BookingFormError::InternalSendRejected { status, detail } => {
                write!(f, "Internal notification rejected ({status}): {detail}")
            }
            BookingFormError::ServerError(description) => {
                write!(f, "Server error: {description}")
            }
        }
    }
}

impl std::error::Error for BookingFormError {}

#[derive(Deserialize)]
struct MailChannelsApiKey {
    #[serde(rename = "MC_API_KEY")]
    api_key: String,
}

#[derive(Debug)]
enum EnvironmentError {
    MissingSecret(&'static str),
}

impl Display for EnvironmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvironmentError::MissingSecret(key) => write!(f, "Missing secret {key}"),
        }
    }
}

impl std::error::Error for EnvironmentError {}
