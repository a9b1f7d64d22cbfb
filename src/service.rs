use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scrobble::ScrobbleEvent;

/// Uniform submission failure. Transport errors, bad statuses and
/// rejections all land here and are equally retryable.
#[derive(Debug, Error)]
#[error("submission failed: {reason}")]
pub struct SubmitError {
    reason: String,
}

impl SubmitError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Where planned scrobbles go. A zero timeout means no timeout.
pub trait ScrobbleSink {
    fn submit(&self, events: &[ScrobbleEvent], timeout: Duration) -> Result<(), SubmitError>;
}

pub struct HttpSubmitter {
    base_url: String,
    session_key: String,
    client: Client,
}

impl HttpSubmitter {
    pub fn new(base_url: &str, session_key: &str) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed building HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            session_key: session_key.to_string(),
            client,
        })
    }
}

impl ScrobbleSink for HttpSubmitter {
    fn submit(&self, events: &[ScrobbleEvent], timeout: Duration) -> Result<(), SubmitError> {
        let body = SubmitBody {
            tracklist: events.iter().map(wire_track).collect(),
            session_key: &self.session_key,
        };
        let url = format!("{}/scrobble", self.base_url);
        log::debug!("submitting {} events to {url}", events.len());
        let mut request = self
            .client
            .post(&url)
            .bearer_auth(&self.session_key)
            .json(&body);
        if !timeout.is_zero() {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .map_err(|err| SubmitError::new(format!("request failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SubmitError::new(format!("service answered {status}")));
        }
        let parsed: SubmitResponse = response
            .json()
            .map_err(|err| SubmitError::new(format!("unreadable response: {err}")))?;
        if !parsed.success {
            return Err(SubmitError::new("service reported failure"));
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct SubmitBody<'a> {
    tracklist: Vec<WireTrack<'a>>,
    #[serde(rename = "sessionKey")]
    session_key: &'a str,
}

#[derive(Serialize)]
struct WireTrack<'a> {
    track: &'a str,
    artist: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    album: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration: Option<u32>,
    timestamp: i64,
}

#[derive(Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    success: bool,
}

fn wire_track(event: &ScrobbleEvent) -> WireTrack<'_> {
    WireTrack {
        track: &event.title,
        artist: &event.artist,
        album: event.album.as_deref(),
        duration: if event.duration_ms > 0 {
            Some(event.duration_ms / 1000)
        } else {
            None
        },
        timestamp: event.timestamp,
    }
}
