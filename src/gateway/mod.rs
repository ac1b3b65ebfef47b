//! The offline-resilient request gateway.
//!
//! Every outbound API call from the UI passes through [`Gateway::execute`],
//! which hides the network condition behind one uniform envelope: failed
//! reads are served from the local cache, failed writes are queued and
//! acknowledged as deferred, and a background reconciler drains the queue
//! once connectivity returns.

mod dispatcher;
mod envelope;
mod reconciler;
mod transport;

pub use envelope::{Call, Envelope, StatusReport};
pub use transport::{HttpTransport, RawRequest, RawResponse, Transport, TransportError};

#[cfg(test)]
pub use transport::MockTransport;

use crate::config::{GatewayConfig, ResolvedServerConfig};
use crate::store::Store;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::warn;

/// The gateway context: store handle, transport, resolved server address
/// and the reconciliation flag, built once at process start and cloned
/// (all shared handles) into background tasks.
#[derive(Clone)]
pub struct Gateway {
  store: Arc<dyn Store>,
  transport: Arc<dyn Transport>,
  server: ResolvedServerConfig,
  config: GatewayConfig,
  /// Guards the reconciliation critical section; at most one pass runs
  sync_in_progress: Arc<AtomicBool>,
}

impl Gateway {
  pub fn new(
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    server: ResolvedServerConfig,
    config: GatewayConfig,
  ) -> Self {
    Self {
      store,
      transport,
      server,
      config,
      sync_in_progress: Arc::new(AtomicBool::new(false)),
    }
  }

  /// Queue depth for the UI's pending-sync indicator. A storage fault
  /// reads as an empty queue, not an error.
  pub fn status(&self) -> StatusReport {
    let pending_count = self.store.count_queued().unwrap_or_else(|e| {
      warn!("queue depth unavailable: {e:#}");
      0
    });

    StatusReport { pending_count }
  }

  /// Wipe the queue and cache. The operator's escape hatch when a queued
  /// write can never be delivered. Returns the resulting queue depth.
  pub fn reset(&self) -> StatusReport {
    if let Err(e) = self.store.clear() {
      warn!("could not reset gateway store: {e:#}");
    }

    self.status()
  }

  /// The server address the gateway resolves relative URLs against.
  pub fn resolved_config(&self) -> &ResolvedServerConfig {
    &self.server
  }
}
