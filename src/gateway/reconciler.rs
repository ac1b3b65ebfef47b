//! Background reconciliation of the write-queue.
//!
//! A pass drains up to a batch of queued writes against the central
//! server, oldest first, and stops at the first failure: delivery order
//! is strict FIFO and a still-recovering server is not hammered with the
//! rest of the batch.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::transport::RawRequest;
use super::Gateway;

impl Gateway {
  /// Run one reconciliation pass. A no-op when a pass is already in
  /// progress or when nothing is queued. Failures are logged, never
  /// surfaced: the caller already holds a deferred acknowledgment, and
  /// the persistent signal is the queue depth.
  pub async fn reconcile(&self) {
    let Some(_guard) = PassGuard::acquire(&self.sync_in_progress) else {
      debug!("reconciliation already in progress");
      return;
    };

    match self.store.count_queued() {
      Ok(0) => return,
      Ok(pending) => debug!(pending, "starting reconciliation pass"),
      Err(e) => {
        warn!("queue unavailable, skipping reconciliation: {e:#}");
        return;
      }
    }

    let batch = match self.store.dequeue_oldest(self.config.sync_batch_size) {
      Ok(batch) => batch,
      Err(e) => {
        warn!("could not read queued requests: {e:#}");
        return;
      }
    };

    for queued in batch {
      let request = RawRequest {
        url: queued.url.clone(),
        method: queued.method.clone(),
        body: queued.body.clone(),
        headers: queued.headers.clone(),
        timeout: self.config.sync_timeout(),
      };

      match self.transport.send(&request).await {
        Ok(response) if (200..300).contains(&response.status) => {
          debug!(
            id = queued.id,
            url = %queued.url,
            enqueued_at = %queued.created_at,
            "delivered queued write"
          );
          if let Err(e) = self.store.remove(queued.id) {
            // Leaving the record would re-deliver it next pass; stop here
            warn!(id = queued.id, "could not remove delivered write: {e:#}");
            return;
          }
        }
        Ok(response) => {
          // Stopping preserves delivery order for the records behind this one
          warn!(
            id = queued.id,
            status = response.status,
            "queued write rejected, stopping pass"
          );
          return;
        }
        Err(error) => {
          debug!(id = queued.id, %error, "delivery failed, stopping pass");
          return;
        }
      }
    }
  }

  /// Spawn the periodic reconciliation trigger. The task runs for the
  /// life of the process; passes it starts contend on the same flag as
  /// opportunistic ones.
  pub fn start_interval(&self) -> tokio::task::JoinHandle<()> {
    let gateway = self.clone();
    let period = self.config.sync_interval();

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        ticker.tick().await;
        gateway.reconcile().await;
      }
    })
  }
}

/// Holds the reconciliation-in-progress flag for one pass.
///
/// Acquisition is a compare-exchange so concurrent triggers cannot both
/// enter; release happens on drop, covering every exit path.
struct PassGuard<'a> {
  flag: &'a AtomicBool,
}

impl<'a> PassGuard<'a> {
  fn acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| Self { flag })
  }
}

impl Drop for PassGuard<'_> {
  fn drop(&mut self) {
    self.flag.store(false, Ordering::Release);
  }
}
