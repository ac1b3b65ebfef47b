//! The request dispatcher: the single choke point every outbound call
//! passes through.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use url::Url;

use super::envelope::{Call, Envelope};
use super::transport::{RawRequest, RawResponse, TransportError};
use super::Gateway;

/// Query parameters the web stack appends to defeat intermediary caches.
/// Stripped before a URL is used as a cache key.
const CACHE_BUSTING_PARAMS: &[&str] = &["_", "_t", "_ts", "timestamp"];

impl Gateway {
  /// Execute one logical request and fold every possible outcome into an
  /// envelope. This method never fails past its boundary: network errors
  /// become cache hits, deferrals, or classified error envelopes.
  pub async fn execute(&self, call: &Call) -> Envelope {
    let method = call.effective_method();

    let url = match self.resolve_url(&call.url) {
      Ok(url) => url,
      Err(e) => return Envelope::client_error(format!("invalid url: {}", e)),
    };

    let headers = normalize_headers(call.headers.as_ref());

    // A body that cannot be serialized never reaches the network
    let body = match call.data.as_ref().map(serde_json::to_string).transpose() {
      Ok(body) => body,
      Err(e) => return Envelope::client_error(format!("unserializable request body: {}", e)),
    };

    let request = RawRequest {
      url: url.to_string(),
      method: method.clone(),
      body,
      headers,
      timeout: self.config.request_timeout(),
    };

    match self.transport.send(&request).await {
      Ok(response) => {
        let envelope = envelope_from_response(&response);

        if method == "GET" && envelope.is_success() && !is_health_check(&url) {
          self.cache_response(&url, &envelope);
        }

        // The server answered, so queued writes may be deliverable now
        self.kick_reconciler();

        envelope
      }
      Err(error) => self.fall_back(request, &url, &method, error),
    }
  }

  /// Offline fallback: cached reads, deferred writes, classified errors.
  /// A secondary store fault surfaces the original network error.
  fn fall_back(
    &self,
    request: RawRequest,
    url: &Url,
    method: &str,
    error: TransportError,
  ) -> Envelope {
    if method == "GET" {
      let key = normalize_cache_url(url);
      match self.store.get_cache(&key) {
        Ok(Some(body)) => match serde_json::from_str(&body) {
          Ok(data) => {
            debug!(url = %key, "serving read from cache");
            return Envelope::from_cache(data);
          }
          Err(e) => warn!(url = %key, "discarding unreadable cache entry: {}", e),
        },
        Ok(None) => {}
        Err(e) => warn!("cache unavailable: {e:#}"),
      }
    } else if method != "HEAD" {
      match self
        .store
        .enqueue(&request.url, method, request.body.as_deref(), &request.headers)
      {
        Ok(id) => {
          info!(id, method, url = %request.url, "deferred write for later delivery");
          return Envelope::deferred();
        }
        Err(e) => warn!("could not defer write: {e:#}"),
      }
    }

    debug!(%error, method, url = %request.url, "request failed with no offline fallback");
    Envelope::unreachable(error.category())
  }

  /// Complete a relative URL against the resolved server address.
  fn resolve_url(&self, raw: &str) -> Result<Url> {
    match Url::parse(raw) {
      Ok(url) => Ok(url),
      Err(url::ParseError::RelativeUrlWithoutBase) => self
        .server
        .base_url()
        .join(raw)
        .map_err(|e| eyre!("Failed to resolve {} against the server base: {}", raw, e)),
      Err(e) => Err(eyre!("Failed to parse url {}: {}", raw, e)),
    }
  }

  /// Memoize a successful read under its normalized URL. Storage faults
  /// degrade to connectivity-only behavior.
  fn cache_response(&self, url: &Url, envelope: &Envelope) {
    let Some(data) = &envelope.data else {
      return;
    };

    let key = normalize_cache_url(url);
    match serde_json::to_string(data) {
      Ok(body) => {
        if let Err(e) = self.store.put_cache(&key, &body) {
          warn!(url = %key, "could not cache response: {e:#}");
        }
      }
      Err(e) => warn!(url = %key, "could not serialize response for caching: {}", e),
    }
  }

  /// Fire-and-forget reconciliation after a successful call.
  fn kick_reconciler(&self) {
    let gateway = self.clone();
    tokio::spawn(async move {
      gateway.reconcile().await;
    });
  }
}

/// Build an envelope from a raw HTTP exchange.
///
/// Oversized bodies were discarded mid-read and are reported with an error
/// marker instead of data; unparseable bodies degrade to a status-only
/// envelope.
fn envelope_from_response(response: &RawResponse) -> Envelope {
  if response.oversized {
    let mut envelope = Envelope::response(response.status, None);
    envelope.error = Some("response too large".to_string());
    return envelope;
  }

  let data = if response.body.trim().is_empty() {
    None
  } else {
    serde_json::from_str(&response.body).ok()
  };

  Envelope::response(response.status, data)
}

/// Lowercase header names, force a JSON content type, and give a bare
/// `authorization` value its bearer prefix.
fn normalize_headers(extra: Option<&HashMap<String, String>>) -> HashMap<String, String> {
  let mut headers: HashMap<String, String> = HashMap::new();

  if let Some(extra) = extra {
    for (name, value) in extra {
      headers.insert(name.to_lowercase(), value.clone());
    }
  }

  headers.insert("content-type".to_string(), "application/json".to_string());

  if let Some(auth) = headers.get_mut("authorization") {
    if !auth.to_lowercase().starts_with("bearer ") {
      *auth = format!("Bearer {}", auth);
    }
  }

  headers
}

/// Strip cache-busting query parameters so functionally identical reads
/// share one cache key.
fn normalize_cache_url(url: &Url) -> String {
  let kept: Vec<(String, String)> = url
    .query_pairs()
    .filter(|(name, _)| !CACHE_BUSTING_PARAMS.contains(&name.as_ref()))
    .map(|(name, value)| (name.into_owned(), value.into_owned()))
    .collect();

  let mut normalized = url.clone();
  normalized.set_query(None);

  if !kept.is_empty() {
    let mut pairs = normalized.query_pairs_mut();
    for (name, value) in &kept {
      pairs.append_pair(name, value);
    }
  }

  normalized.to_string()
}

/// Health probes are noise; they never populate the cache.
fn is_health_check(url: &Url) -> bool {
  url
    .path_segments()
    .and_then(|mut segments| segments.next_back())
    .map(|last| matches!(last, "health" | "healthz" | "ping"))
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{GatewayConfig, ResolvedServerConfig, ServerConfig};
  use crate::gateway::transport::MockTransport;
  use crate::store::{NoopStore, SqliteStore, Store};
  use serde_json::json;
  use std::sync::Arc;

  fn test_gateway(store: Arc<dyn Store>) -> (Gateway, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let server = ResolvedServerConfig::resolve(
      &ServerConfig {
        host: "central.local".to_string(),
        port: 9000,
        tls: false,
      },
      None,
      None,
    )
    .unwrap();

    let gateway = Gateway::new(
      store,
      transport.clone(),
      server,
      GatewayConfig::default(),
    );

    (gateway, transport)
  }

  fn sqlite_gateway() -> (Gateway, Arc<MockTransport>, Arc<SqliteStore>) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let (gateway, transport) = test_gateway(store.clone());
    (gateway, transport, store)
  }

  #[tokio::test]
  async fn test_relative_url_resolves_against_server_base() {
    let (gateway, transport, _store) = sqlite_gateway();

    gateway.execute(&Call::get("/api/items")).await;

    let sent = transport.requests();
    assert_eq!(sent[0].url, "http://central.local:9000/api/items");
    assert_eq!(sent[0].method, "GET");

    gateway.execute(&Call::get("http://elsewhere:1234/x")).await;
    assert_eq!(transport.requests()[1].url, "http://elsewhere:1234/x");
  }

  #[tokio::test]
  async fn test_headers_are_normalized() {
    let (gateway, transport, _store) = sqlite_gateway();

    let mut headers = HashMap::new();
    headers.insert("Authorization".to_string(), "abc123".to_string());
    let call = Call {
      headers: Some(headers),
      ..Call::get("/items")
    };

    gateway.execute(&call).await;

    let sent = &transport.requests()[0];
    assert_eq!(sent.headers.get("content-type").unwrap(), "application/json");
    assert_eq!(sent.headers.get("authorization").unwrap(), "Bearer abc123");
  }

  #[tokio::test]
  async fn test_existing_bearer_prefix_is_kept() {
    let mut headers = HashMap::new();
    headers.insert("authorization".to_string(), "Bearer tok".to_string());

    let normalized = normalize_headers(Some(&headers));
    assert_eq!(normalized.get("authorization").unwrap(), "Bearer tok");
  }

  #[tokio::test]
  async fn test_invalid_url_is_a_client_error() {
    let (gateway, transport, _store) = sqlite_gateway();

    let envelope = gateway.execute(&Call::get("http://[broken")).await;

    assert_eq!(envelope.status, 400);
    assert!(envelope.error.unwrap().contains("invalid url"));
    assert!(transport.requests().is_empty());
  }

  #[tokio::test]
  async fn test_cache_round_trip_on_read_failure() {
    let (gateway, transport, _store) = sqlite_gateway();

    transport.push_response(RawResponse::new(200, r#"{"x":1}"#));
    let live = gateway.execute(&Call::get("/items")).await;
    assert_eq!(live.status, 200);
    assert!(!live.served_from_cache);

    transport.push_error(TransportError::Timeout);
    let offline = gateway.execute(&Call::get("/items")).await;

    assert_eq!(offline.status, 200);
    assert!(offline.served_from_cache);
    assert_eq!(offline.data.unwrap(), json!({"x":1}));
  }

  #[tokio::test]
  async fn test_cache_key_ignores_cache_busting_params() {
    let (gateway, transport, _store) = sqlite_gateway();

    transport.push_response(RawResponse::new(200, r#"{"list":[1]}"#));
    gateway.execute(&Call::get("/list?_t=123456")).await;

    transport.push_error(TransportError::ConnectionRefused);
    let offline = gateway.execute(&Call::get("/list?_t=654321")).await;

    assert!(offline.served_from_cache);
    assert_eq!(offline.data.unwrap(), json!({"list":[1]}));
  }

  #[tokio::test]
  async fn test_distinct_real_params_do_not_share_a_cache_entry() {
    let (gateway, transport, _store) = sqlite_gateway();

    transport.push_response(RawResponse::new(200, r#"{"page":1}"#));
    gateway.execute(&Call::get("/list?page=1")).await;

    transport.push_error(TransportError::Timeout);
    let offline = gateway.execute(&Call::get("/list?page=2")).await;

    assert!(!offline.served_from_cache);
    assert_eq!(offline.status, 500);
  }

  #[tokio::test]
  async fn test_health_checks_are_never_cached() {
    let (gateway, transport, _store) = sqlite_gateway();

    transport.push_response(RawResponse::new(200, r#"{"ok":true}"#));
    gateway.execute(&Call::get("/health")).await;

    transport.push_error(TransportError::Timeout);
    let offline = gateway.execute(&Call::get("/health")).await;

    assert!(!offline.served_from_cache);
    assert_eq!(offline.status, 500);
  }

  #[tokio::test]
  async fn test_oversized_response_is_never_parsed() {
    let (gateway, transport, _store) = sqlite_gateway();

    transport.push_response(RawResponse {
      status: 200,
      body: String::new(),
      oversized: true,
    });

    let envelope = gateway.execute(&Call::get("/items")).await;

    assert_eq!(envelope.status, 200);
    assert!(envelope.data.is_none());
    assert_eq!(envelope.error.as_deref(), Some("response too large"));
  }

  #[tokio::test]
  async fn test_unparseable_body_degrades_to_status_only() {
    let (gateway, transport, _store) = sqlite_gateway();

    transport.push_response(RawResponse::new(200, "<html>not json</html>"));
    let ok = gateway.execute(&Call::get("/items")).await;
    assert_eq!(ok.status, 200);
    assert!(ok.data.is_none());
    assert!(ok.error.is_none());

    transport.push_response(RawResponse::new(502, "bad gateway"));
    let bad = gateway.execute(&Call::get("/items")).await;
    assert_eq!(bad.status, 502);
    assert!(bad.error.is_some());
  }

  #[tokio::test]
  async fn test_failed_write_is_deferred() {
    let (gateway, transport, store) = sqlite_gateway();
    transport.set_offline(true);

    let call = Call {
      method: Some("POST".to_string()),
      data: Some(json!({"sku":"A1"})),
      ..Call::get("/orders")
    };
    let envelope = gateway.execute(&call).await;

    assert_eq!(envelope.status, 200);
    assert!(envelope.deferred);
    assert_eq!(store.count_queued().unwrap(), 1);

    let queued = &store.dequeue_oldest(10).unwrap()[0];
    assert_eq!(queued.url, "http://central.local:9000/orders");
    assert_eq!(queued.method, "POST");
    assert_eq!(queued.body.as_deref(), Some(r#"{"sku":"A1"}"#));
  }

  #[tokio::test]
  async fn test_deferred_write_is_delivered_once_online() {
    let (gateway, transport, store) = sqlite_gateway();
    transport.set_offline(true);

    let call = Call {
      method: Some("POST".to_string()),
      data: Some(json!({"sku":"A1"})),
      ..Call::get("/orders")
    };
    let envelope = gateway.execute(&call).await;
    assert!(envelope.deferred);
    assert_eq!(gateway.status().pending_count, 1);

    // Connectivity returns; the next pass replays the stored request
    transport.set_offline(false);
    gateway.reconcile().await;

    assert_eq!(gateway.status().pending_count, 0);
    assert_eq!(store.count_queued().unwrap(), 0);

    let replayed = transport.requests().pop().unwrap();
    assert_eq!(replayed.url, "http://central.local:9000/orders");
    assert_eq!(replayed.method, "POST");
    assert_eq!(replayed.body.as_deref(), Some(r#"{"sku":"A1"}"#));
  }

  #[tokio::test]
  async fn test_failed_head_is_classified_not_deferred() {
    let (gateway, transport, store) = sqlite_gateway();
    transport.set_offline(true);

    let call = Call {
      method: Some("HEAD".to_string()),
      ..Call::get("/items")
    };
    let envelope = gateway.execute(&call).await;

    assert_eq!(envelope.status, 500);
    assert_eq!(envelope.error.as_deref(), Some("server offline"));
    assert!(!envelope.deferred);
    assert_eq!(store.count_queued().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_read_miss_classifies_the_failure() {
    let (gateway, transport, _store) = sqlite_gateway();

    transport.push_error(TransportError::Timeout);
    let envelope = gateway.execute(&Call::get("/never-seen")).await;
    assert_eq!(envelope.status, 500);
    assert_eq!(envelope.error.as_deref(), Some("request timed out"));

    transport.push_error(TransportError::Other("dns".to_string()));
    let envelope = gateway.execute(&Call::get("/never-seen")).await;
    assert_eq!(envelope.error.as_deref(), Some("network error"));
  }

  #[tokio::test]
  async fn test_degraded_store_surfaces_the_network_error() {
    let (gateway, transport) = test_gateway(Arc::new(NoopStore));
    transport.set_offline(true);

    let call = Call {
      method: Some("POST".to_string()),
      data: Some(json!({"sku":"A1"})),
      ..Call::get("/orders")
    };
    let envelope = gateway.execute(&call).await;

    // Nothing was stored, so no deferred acknowledgment
    assert_eq!(envelope.status, 500);
    assert!(!envelope.deferred);
    assert_eq!(envelope.error.as_deref(), Some("server offline"));
    assert_eq!(gateway.status().pending_count, 0);
  }

  #[test]
  fn test_normalize_cache_url_preserves_real_params() {
    let url = Url::parse("http://server/list?_t=1&page=2&_ts=3&q=abc").unwrap();
    assert_eq!(normalize_cache_url(&url), "http://server/list?page=2&q=abc");

    let url = Url::parse("http://server/list?_t=1").unwrap();
    assert_eq!(normalize_cache_url(&url), "http://server/list");
  }

  #[test]
  fn test_is_health_check() {
    for path in ["/health", "/api/healthz", "/ping"] {
      let url = Url::parse(&format!("http://server{}", path)).unwrap();
      assert!(is_health_check(&url), "{} should be health traffic", path);
    }

    let url = Url::parse("http://server/healthy-items").unwrap();
    assert!(!is_health_check(&url));
  }
}
