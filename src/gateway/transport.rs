//! HTTP transport abstraction for the gateway.
//!
//! The dispatcher and reconciler talk to the network through the
//! [`Transport`] trait so tests can script outcomes without a server.
//! The live implementation rides on `reqwest`.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// A transport-level failure, classified for error reporting.
///
/// HTTP responses with error statuses are not transport errors; they come
/// back as ordinary [`RawResponse`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
  /// The call exceeded its timeout
  Timeout,
  /// The server actively refused the connection
  ConnectionRefused,
  /// Any other network-level failure
  Other(String),
}

impl TransportError {
  /// Human-readable category surfaced in error envelopes.
  pub fn category(&self) -> &'static str {
    match self {
      Self::Timeout => "request timed out",
      Self::ConnectionRefused => "server offline",
      Self::Other(_) => "network error",
    }
  }
}

impl fmt::Display for TransportError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Timeout => write!(f, "request timed out"),
      Self::ConnectionRefused => write!(f, "connection refused"),
      Self::Other(e) => write!(f, "network error: {}", e),
    }
  }
}

impl std::error::Error for TransportError {}

/// A fully-resolved outbound request.
#[derive(Debug, Clone)]
pub struct RawRequest {
  /// Absolute target URL
  pub url: String,
  /// Uppercased HTTP method
  pub method: String,
  /// Serialized body, if any
  pub body: Option<String>,
  /// Normalized headers
  pub headers: HashMap<String, String>,
  /// Hard deadline for the whole exchange
  pub timeout: Duration,
}

/// A raw HTTP exchange result.
#[derive(Debug, Clone)]
pub struct RawResponse {
  /// HTTP status code
  pub status: u16,
  /// Response body; empty when `oversized`
  pub body: String,
  /// The body exceeded the ceiling and was discarded mid-read
  pub oversized: bool,
}

impl RawResponse {
  /// A complete response with the given status and body.
  pub fn new(status: u16, body: impl Into<String>) -> Self {
    Self {
      status,
      body: body.into(),
      oversized: false,
    }
  }
}

/// Network layer the gateway dispatches through.
#[async_trait]
pub trait Transport: Send + Sync {
  /// Issue one HTTP exchange, honoring the request's timeout.
  async fn send(&self, request: &RawRequest) -> std::result::Result<RawResponse, TransportError>;
}

/// Live transport backed by `reqwest`.
pub struct HttpTransport {
  client: reqwest::Client,
  /// Ceiling on decoded response bodies
  body_limit: usize,
}

impl HttpTransport {
  /// Build a transport with the given response-body ceiling.
  pub fn new(body_limit: usize) -> Result<Self> {
    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client, body_limit })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: &RawRequest) -> std::result::Result<RawResponse, TransportError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| TransportError::Other(format!("invalid method {}: {}", request.method, e)))?;

    let mut builder = self
      .client
      .request(method, &request.url)
      .timeout(request.timeout);

    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }

    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let mut response = builder.send().await.map_err(classify)?;
    let status = response.status().as_u16();

    // Read the body incrementally so an oversized response never fully
    // lands in memory.
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(classify)? {
      if body.len() + chunk.len() > self.body_limit {
        return Ok(RawResponse {
          status,
          body: String::new(),
          oversized: true,
        });
      }
      body.extend_from_slice(&chunk);
    }

    Ok(RawResponse::new(
      status,
      String::from_utf8_lossy(&body).into_owned(),
    ))
  }
}

/// Map a reqwest failure onto the gateway's error taxonomy.
fn classify(error: reqwest::Error) -> TransportError {
  if error.is_timeout() {
    TransportError::Timeout
  } else if error.is_connect() {
    TransportError::ConnectionRefused
  } else {
    TransportError::Other(error.to_string())
  }
}

/// A scriptable transport for tests.
///
/// Outcomes are consumed in push order; unscripted calls succeed with an
/// empty JSON object while online, and every call fails with
/// [`TransportError::ConnectionRefused`] while offline. All requests are
/// recorded for inspection.
#[cfg(test)]
pub struct MockTransport {
  scripted: std::sync::Mutex<std::collections::VecDeque<std::result::Result<RawResponse, TransportError>>>,
  offline: std::sync::atomic::AtomicBool,
  requests: std::sync::Mutex<Vec<RawRequest>>,
}

#[cfg(test)]
impl MockTransport {
  pub fn new() -> Self {
    Self {
      scripted: std::sync::Mutex::new(std::collections::VecDeque::new()),
      offline: std::sync::atomic::AtomicBool::new(false),
      requests: std::sync::Mutex::new(Vec::new()),
    }
  }

  /// Queue a successful response.
  pub fn push_response(&self, response: RawResponse) {
    self.scripted.lock().unwrap().push_back(Ok(response));
  }

  /// Queue a transport failure.
  pub fn push_error(&self, error: TransportError) {
    self.scripted.lock().unwrap().push_back(Err(error));
  }

  /// Toggle the simulated network.
  pub fn set_offline(&self, offline: bool) {
    self
      .offline
      .store(offline, std::sync::atomic::Ordering::SeqCst);
  }

  /// Requests seen so far, in order.
  pub fn requests(&self) -> Vec<RawRequest> {
    self.requests.lock().unwrap().clone()
  }
}

#[cfg(test)]
#[async_trait]
impl Transport for MockTransport {
  async fn send(&self, request: &RawRequest) -> std::result::Result<RawResponse, TransportError> {
    self.requests.lock().unwrap().push(request.clone());

    if self.offline.load(std::sync::atomic::Ordering::SeqCst) {
      return Err(TransportError::ConnectionRefused);
    }

    match self.scripted.lock().unwrap().pop_front() {
      Some(outcome) => outcome,
      None => Ok(RawResponse::new(200, "{}")),
    }
  }
}
