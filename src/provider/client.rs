/// Lyrics/analysis provider HTTP client implementation.
///
/// This module provides `ProviderClient` for making synchronous HTTP requests to the
/// external analysis service, along with error types and a builder for configuration.
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::AnalysisPayload;

/// Minimum trimmed length of a search query.
pub const MIN_SEARCH_QUERY_LEN: usize = 3;

const DEFAULT_BASE_URL: &str = "http://localhost:8000";
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Errors that can occur when talking to the analysis provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network-related errors (connection failures, DNS resolution, etc.)
    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),

    /// Request or response timeout errors
    #[error("Request timed out")]
    Timeout(#[source] reqwest::Error),

    /// Non-2xx HTTP response
    #[error("HTTP error: status {status}")]
    Http { status: u16 },

    /// Response body could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(#[source] serde_json::Error),

    /// Provider-level errors and rejected input
    #[error("Provider API error: {message}")]
    Api { message: String },

    /// Invalid URL configuration error
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl ProviderError {
    fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ProviderError::Timeout(error)
        } else {
            ProviderError::Network(error)
        }
    }

    /// Returns `true` for transient errors (HTTP 5xx, network errors, timeouts).
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Network(_) | ProviderError::Timeout(_) => true,
            ProviderError::Http { status } => (500..600).contains(status),
            ProviderError::Serialization(_)
            | ProviderError::Api { .. }
            | ProviderError::InvalidUrl(_) => false,
        }
    }
}

/// Body of a search response: `{ "results": [...] }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub results: Vec<Value>,
}

/// Body of an analyze response: `{ "analysis": {...}, "lyrics": "..." }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LyricsAnalysis {
    pub analysis: AnalysisPayload,
    #[serde(default)]
    pub lyrics: String,
}

/// Request body for `POST /re_analyze`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReanalysisRequest {
    /// The head version's stored analysis, passed through as parsed JSON.
    pub old_analysis: Value,
    pub new_comment: String,
    pub artist: String,
    pub track: String,
}

/// Operations the analysis provider offers.
///
/// This trait enables fakes in unit tests and keeps the reanalysis workflow
/// independent of the HTTP transport.
pub trait AnalysisProvider: Send + Sync {
    /// Searches lyrics by free-text query.
    fn search(&self, query: &str) -> Result<SearchResponse, ProviderError>;

    /// Fetches lyrics and a first analysis for a song.
    fn analyze(&self, artist: &str, track: &str) -> Result<LyricsAnalysis, ProviderError>;

    /// Merges a comment into an existing analysis and returns the updated one.
    fn re_analyze(&self, request: &ReanalysisRequest) -> Result<AnalysisPayload, ProviderError>;
}

/// Builder for constructing `ProviderClient` instances.
///
/// # Examples
///
/// ```
/// use scalpel::provider::ProviderClientBuilder;
///
/// let client = ProviderClientBuilder::new()
///     .base_url("http://localhost:8000")
///     .build()
///     .expect("Failed to create client");
/// assert_eq!(client.base_url(), "http://localhost:8000");
/// ```
#[derive(Debug, Default)]
pub struct ProviderClientBuilder {
    base_url: Option<String>,
    timeout: Option<Duration>,
}

impl ProviderClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the provider base URL (e.g. "http://localhost:8000").
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Sets the per-request timeout. Defaults to 60 seconds.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds the `ProviderClient`.
    ///
    /// Falls back to `http://localhost:8000` when no base URL was given.
    /// A trailing slash on the base URL is dropped.
    pub fn build(self) -> Result<ProviderClient, ProviderError> {
        let base_url = self
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        reqwest::Url::parse(&base_url)
            .map_err(|e| ProviderError::InvalidUrl(format!("{}: {}", base_url, e)))?;

        let client = reqwest::blocking::Client::builder()
            .timeout(
                self.timeout
                    .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            )
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(ProviderError::Network)?;

        Ok(ProviderClient { client, base_url })
    }
}

/// Synchronous HTTP client for the analysis provider.
pub struct ProviderClient {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl ProviderClient {
    /// Returns the base URL configured for this client.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Checks that the provider answers HTTP at all.
    ///
    /// Any HTTP status counts as reachable; only transport failures do not.
    pub fn ping(&self) -> Result<u16, ProviderError> {
        let response = self
            .client
            .get(&self.base_url)
            .send()
            .map_err(ProviderError::from_reqwest)?;
        Ok(response.status().as_u16())
    }

    fn get_json<T>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, ProviderError>
    where
        T: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);

        retry_with_backoff(|| {
            debug!(%url, "provider GET");
            let response = self
                .client
                .get(&url)
                .query(query)
                .send()
                .map_err(ProviderError::from_reqwest)?;
            decode_response(response)
        })
    }
}

impl AnalysisProvider for ProviderClient {
    fn search(&self, query: &str) -> Result<SearchResponse, ProviderError> {
        let query = validate_search_query(query)?;
        self.get_json("/search_lyrics", &[("q", query)])
    }

    fn analyze(&self, artist: &str, track: &str) -> Result<LyricsAnalysis, ProviderError> {
        self.get_json(
            "/analyze_lyrics",
            &[("artist", artist.trim()), ("track", track.trim())],
        )
    }

    fn re_analyze(&self, request: &ReanalysisRequest) -> Result<AnalysisPayload, ProviderError> {
        let url = format!("{}/re_analyze", self.base_url);
        debug!(%url, artist = %request.artist, track = %request.track, "provider POST");

        // Not idempotent on the provider side, so no retry here.
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .map_err(ProviderError::from_reqwest)?;
        decode_response(response)
    }
}

/// Trims a search query and rejects ones shorter than [`MIN_SEARCH_QUERY_LEN`].
pub fn validate_search_query(query: &str) -> Result<&str, ProviderError> {
    let trimmed = query.trim();
    if trimmed.chars().count() < MIN_SEARCH_QUERY_LEN {
        return Err(ProviderError::Api {
            message: format!(
                "Search query must be at least {} characters",
                MIN_SEARCH_QUERY_LEN
            ),
        });
    }
    Ok(trimmed)
}

fn decode_response<T>(response: reqwest::blocking::Response) -> Result<T, ProviderError>
where
    T: serde::de::DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        return Err(ProviderError::Http {
            status: status.as_u16(),
        });
    }

    let body = response.text().map_err(ProviderError::from_reqwest)?;
    serde_json::from_str(&body).map_err(ProviderError::Serialization)
}

/// Retries an operation with exponential backoff.
///
/// Retries up to 3 times with delays of 1s, 2s, and 4s, only on transient
/// errors (see [`ProviderError::is_transient`]).
pub fn retry_with_backoff<F, T>(f: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Result<T, ProviderError>,
{
    retry_with_delays(f, &[1, 2, 4])
}

fn retry_with_delays<F, T>(mut f: F, delays_secs: &[u64]) -> Result<T, ProviderError>
where
    F: FnMut() -> Result<T, ProviderError>,
{
    let mut last_error = match f() {
        Ok(result) => return Ok(result),
        Err(e) if !e.is_transient() => return Err(e),
        Err(e) => e,
    };

    for &delay_secs in delays_secs {
        warn!(error = %last_error, delay_secs, "provider call failed, retrying");
        thread::sleep(Duration::from_secs(delay_secs));

        match f() {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => last_error = e,
        }
    }

    Err(last_error)
}
