//! The request/response contract between the UI and the gateway.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A logical outbound request issued by the presentation layer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Call {
  /// Target URL, absolute or relative to the central server
  pub url: String,
  /// HTTP method; reads (GET) when unspecified
  #[serde(default)]
  pub method: Option<String>,
  /// Request payload, serialized by the gateway
  #[serde(default)]
  pub data: Option<Value>,
  /// Extra headers to send
  #[serde(default)]
  pub headers: Option<HashMap<String, String>>,
}

impl Call {
  /// Build a read for a URL with no payload or headers.
  #[allow(dead_code)]
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      method: None,
      data: None,
      headers: None,
    }
  }

  /// The effective HTTP method, uppercased, defaulting to GET.
  pub fn effective_method(&self) -> String {
    self
      .method
      .as_deref()
      .map(|m| m.trim().to_uppercase())
      .filter(|m| !m.is_empty())
      .unwrap_or_else(|| "GET".to_string())
  }
}

/// The uniform response envelope every call resolves to, online or not.
///
/// The gateway never lets a failure escape as an error: every outcome is
/// folded into a status code, optional data/error, and the two offline
/// flags the UI uses to render "working offline" affordances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
  /// HTTP status, or a synthetic equivalent
  pub status: u16,
  /// Parsed response body, when one was available
  #[serde(skip_serializing_if = "Option::is_none")]
  pub data: Option<Value>,
  /// Human-readable failure category
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  /// The data came from the local read-cache, not the server
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub served_from_cache: bool,
  /// The write was queued for later delivery, not yet delivered
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub deferred: bool,
}

impl Envelope {
  /// A live response with optional parsed data.
  pub fn response(status: u16, data: Option<Value>) -> Self {
    let error = if (200..300).contains(&status) {
      None
    } else {
      Some("request failed".to_string())
    };
    Self {
      status,
      data,
      error,
      served_from_cache: false,
      deferred: false,
    }
  }

  /// A synthetic success carrying a cached body.
  pub fn from_cache(data: Value) -> Self {
    Self {
      status: 200,
      data: Some(data),
      error: None,
      served_from_cache: true,
      deferred: false,
    }
  }

  /// A synthetic success acknowledging a queued write.
  pub fn deferred() -> Self {
    Self {
      status: 200,
      data: None,
      error: None,
      served_from_cache: false,
      deferred: true,
    }
  }

  /// A client-side failure (bad input, nothing was sent).
  pub fn client_error(message: impl Into<String>) -> Self {
    Self {
      status: 400,
      data: None,
      error: Some(message.into()),
      served_from_cache: false,
      deferred: false,
    }
  }

  /// A server-unreachable failure with a classified category.
  pub fn unreachable(category: impl Into<String>) -> Self {
    Self {
      status: 500,
      data: None,
      error: Some(category.into()),
      served_from_cache: false,
      deferred: false,
    }
  }

  /// Whether the status is in the success class.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Queue-depth snapshot exposed to the UI for pending-sync indicators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
  /// Number of writes awaiting delivery
  pub pending_count: i64,
}
