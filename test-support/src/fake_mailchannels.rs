use axum::{
    body::Body,
    extract::{Json, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
    routing::post,
    Router,
};
use log::debug;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

const MAILCHANNELS_PORT: u16 = 4567;
const SEND_PATH: &str = "/tx/v1/send";

pub const REJECTION_BODY: &str = "simulated provider rejection";

/// Stand-in for the MailChannels send endpoint. Records every delivery
/// attempt, accepted or not, so tests can assert on exactly which messages
/// the handler tried to submit.
#[derive(Clone)]
pub struct FakeMailChannels {
    sends: Arc<Mutex<Vec<RecordedSend>>>,
    reject_all: bool,
    accept_limit: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct RecordedSend {
    pub api_key: String,
    pub message: Value,
}

impl FakeMailChannels {
    pub fn new() -> Self {
        Self {
            sends: Arc::new(Mutex::new(Vec::new())),
            reject_all: false,
            accept_limit: None,
        }
    }

    pub fn setup_environment() {
        std::env::set_var(
            "MAILCHANNELS_SEND_URL",
            format!("http://localhost:{MAILCHANNELS_PORT}{SEND_PATH}"),
        );
    }

    pub fn reject_all(self) -> Self {
        Self {
            reject_all: true,
            ..self
        }
    }

    /// Accepts the first `limit` sends and rejects the rest.
    pub fn accept_only(self, limit: usize) -> Self {
        Self {
            accept_limit: Some(limit),
            ..self
        }
    }

    pub fn attempts(&self) -> Vec<RecordedSend> {
        self.sends.lock().unwrap().clone()
    }

    /// Binds the listener before returning, so the dispatcher cannot race a
    /// not-yet-started fake.
    pub async fn start(&self) {
        let app = Router::new()
            .route(SEND_PATH, post(send))
            .with_state(self.clone());
        let listener = TcpListener::bind(format!("0.0.0.0:{MAILCHANNELS_PORT}"))
            .await
            .unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
    }
}

impl Default for FakeMailChannels {
    fn default() -> Self {
        Self::new()
    }
}

async fn send(
    State(state): State<FakeMailChannels>,
    headers: HeaderMap,
    Json(message): Json<Value>,
) -> Response {
    debug!("Got send request: {message}");
    let api_key = headers
        .get("X-Api-Key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let index = {
        let mut sends = state.sends.lock().unwrap();
        sends.push(RecordedSend { api_key, message });
        sends.len() - 1
    };
    let rejected =
        state.reject_all || state.accept_limit.is_some_and(|limit| index >= limit);
    if rejected {
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from(REJECTION_BODY))
            .unwrap()
    } else {
        Response::builder()
            .status(StatusCode::ACCEPTED)
            .body(Body::empty())
            .unwrap()
    }
}
