use axum::{
    body::Body,
    extract::{Form, State},
    http::{header, StatusCode},
    response::Response,
    routing::post,
    Router,
};
use log::debug;
use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::net::TcpListener;

const TURNSTILE_PORT: u16 = 5283;
const VERIFY_PATH: &str = "/turnstile/v0/siteverify";

#[derive(Clone)]
pub struct FakeTurnstile {
    required_secret: Cow<'static, str>,
    required_token: Option<String>,
    failure_codes: Option<Vec<String>>,
    return_invalid_response: bool,
    verifications: Arc<AtomicUsize>,
}

#[derive(Deserialize)]
struct VerifyRequestPayload {
    secret: String,
    response: String,
    #[serde(rename = "remoteip", default)]
    _remoteip: String,
}

#[derive(Serialize)]
struct VerifyResponsePayload {
    success: bool,
    #[serde(rename = "error-codes")]
    error_codes: Vec<String>,
}

impl FakeTurnstile {
    pub fn new(required_secret: impl Into<Cow<'static, str>>) -> Self {
        Self {
            required_secret: required_secret.into(),
            required_token: None,
            failure_codes: None,
            return_invalid_response: false,
            verifications: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn setup_environment() {
        std::env::set_var(
            "TURNSTILE_VERIFY_URL",
            format!("http://localhost:{TURNSTILE_PORT}{VERIFY_PATH}"),
        );
    }

    pub fn require_token(self, required_token: impl AsRef<str>) -> Self {
        Self {
            required_token: Some(required_token.as_ref().into()),
            ..self
        }
    }

    pub fn return_failure(self, codes: Vec<String>) -> Self {
        Self {
            failure_codes: Some(codes),
            ..self
        }
    }

    pub fn return_invalid_response(self) -> Self {
        Self {
            return_invalid_response: true,
            ..self
        }
    }

    pub fn verifications(&self) -> usize {
        self.verifications.load(Ordering::SeqCst)
    }

    /// Binds the listener before returning, so the verifier cannot race a
    /// not-yet-started fake.
    pub async fn start(&self) {
        let app = Router::new()
            .route(VERIFY_PATH, post(verify))
            .with_state(self.clone());
        let listener = TcpListener::bind(format!("0.0.0.0:{TURNSTILE_PORT}"))
            .await
            .unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
    }
}

async fn verify(
    State(state): State<FakeTurnstile>,
    Form(payload): Form<VerifyRequestPayload>,
) -> Response {
    debug!("Got verification request for token {}", payload.response);
    state.verifications.fetch_add(1, Ordering::SeqCst);
    if state.return_invalid_response {
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from("Invalid response"))
            .unwrap();
    }
    if let Some(codes) = &state.failure_codes {
        return failure_response(codes.clone());
    }
    if payload.secret != state.required_secret {
        return failure_response(vec!["invalid-input-secret".into()]);
    }
    if state
        .required_token
        .as_ref()
        .is_some_and(|required| payload.response != *required)
    {
        return failure_response(vec!["invalid-input-response".into()]);
    }
    json_response(VerifyResponsePayload {
        success: true,
        error_codes: vec![],
    })
}

fn failure_response(error_codes: Vec<String>) -> Response {
    json_response(VerifyResponsePayload {
        success: false,
        error_codes,
    })
}

fn json_response(payload: VerifyResponsePayload) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_string(&payload).unwrap()))
        .unwrap()
}
