use reqwest::Client;
use serde::Serialize;
use std::{borrow::Cow, time::Duration};

const MAILCHANNELS_SEND_URL: &str = "https://api.mailchannels.net/tx/v1/send";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const TEXT_HTML: &str = "text/html; charset=utf-8";

/// One message as the MailChannels Email API accepts it. Constructed per
/// request and discarded once dispatched.
#[derive(Serialize, Debug)]
pub struct OutboundMessage {
    pub personalizations: Vec<Personalization>,
    pub from: EmailAddress,
    pub subject: String,
    pub reply_to: EmailAddress,
    pub content: Vec<ContentPart>,
}

#[derive(Serialize, Debug)]
pub struct Personalization {
    pub to: Vec<EmailAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bcc: Option<Vec<EmailAddress>>,
}

#[derive(Serialize, Debug)]
pub struct EmailAddress {
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl EmailAddress {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
        }
    }

    pub fn named(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: Some(name.into()),
        }
    }
}

#[derive(Serialize, Debug)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub content_type: &'static str,
    pub value: String,
}

impl ContentPart {
    pub fn plain(value: String) -> Self {
        Self {
            content_type: TEXT_PLAIN,
            value,
        }
    }

    pub fn html(value: String) -> Self {
        Self {
            content_type: TEXT_HTML,
            value,
        }
    }
}

pub struct MailChannelsClient {
    client: Client,
}

impl MailChannelsClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Submits one message. A non-2xx answer carries the provider's
    /// diagnostic body, which callers surface to the operator.
    pub async fn send(
        &self,
        api_key: &str,
        message: &OutboundMessage,
    ) -> Result<(), MailChannelsError> {
        let response = self
            .client
            .post(Self::send_url().as_ref())
            .timeout(SEND_TIMEOUT)
            .header("X-Api-Key", api_key)
            .json(message)
            .send()
            .await
            .map_err(MailChannelsError::Transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let detail = response.text().await.unwrap_or_default();
        Err(MailChannelsError::Rejected {
            status: status.as_u16(),
            detail,
        })
    }

    fn send_url() -> Cow<'static, str> {
        std::env::var("MAILCHANNELS_SEND_URL")
            .map(Cow::Owned)
            .unwrap_or(MAILCHANNELS_SEND_URL.into())
    }
}

#[derive(Debug)]
pub enum MailChannelsError {
    Rejected { status: u16, detail: String },
    Transport(reqwest::Error),
}

impl std::fmt::Display for MailChannelsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MailChannelsError::Rejected { status, detail } => {
                write!(f, "MailChannels rejected message with status {status}: {detail}")
            }
            MailChannelsError::Transport(error) => {
                write!(f, "Error reaching MailChannels: {error}")
            }
        }
    }
}

impl std::error::Error for MailChannelsError {}
