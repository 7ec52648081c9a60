//! Worker heartbeat monitoring. The master pings every local worker on a
//! fixed interval; a worker silent past the configured timeout is
//! reported lost exactly once, and the master restarts it.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// The ping transport, abstracted so supervision logic is testable
/// without processes.
#[async_trait::async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(&self, peer_id: &str) -> anyhow::Result<()>;
}

/// Pings a worker over its RPC service port.
pub struct RpcPinger {
    net: Arc<rpc::PeerNet>,
}

impl RpcPinger {
    pub fn new(net: Arc<rpc::PeerNet>) -> Arc<Self> {
        Arc::new(Self { net })
    }
}

#[async_trait::async_trait]
impl Pinger for RpcPinger {
    async fn ping(&self, peer_id: &str) -> anyhow::Result<()> {
        let client = self.net.client_for(peer_id).await?;
        client.call("gs.ping", vec![]).await?;
        Ok(())
    }
}

/// A running heartbeat. Dropping or aborting the handle stops the pings.
pub struct Heartbeat {
    handle: tokio::task::JoinHandle<()>,
}

impl Heartbeat {
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Start pinging `peer_id` every `interval`. When no ping has succeeded
/// for `timeout`, `on_loss` fires once and the heartbeat stops.
pub fn start(
    peer_id: String,
    pinger: Arc<dyn Pinger>,
    interval: Duration,
    timeout: Duration,
    on_loss: impl FnOnce() + Send + 'static,
) -> Heartbeat {
    let handle = tokio::spawn(async move {
        let mut last_ok = Instant::now();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            // Bound each ping attempt by the remaining grace period.
            match tokio::time::timeout(timeout, pinger.ping(&peer_id)).await {
                Ok(Ok(())) => {
                    last_ok = Instant::now();
                    tracing::trace!(peer = %peer_id, "heartbeat ok");
                }
                Ok(Err(err)) => {
                    tracing::debug!(peer = %peer_id, %err, "heartbeat ping failed");
                }
                Err(_) => {
                    tracing::debug!(peer = %peer_id, "heartbeat ping timed out");
                }
            }
            if last_ok.elapsed() >= timeout {
                tracing::error!(peer = %peer_id, "worker lost its heartbeat");
                on_loss();
                return;
            }
        }
    });
    Heartbeat { handle }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    // Succeeds for the first `healthy_pings` pings, then hangs.
    struct FadingPinger {
        healthy_pings: usize,
        seen: AtomicUsize,
        log: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Pinger for FadingPinger {
        async fn ping(&self, peer_id: &str) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(peer_id.to_string());
            if self.seen.fetch_add(1, Ordering::SeqCst) < self.healthy_pings {
                Ok(())
            } else {
                futures::future::pending().await
            }
        }
    }

    #[tokio::test]
    async fn test_loss_fires_exactly_once_with_the_peer_id() {
        let pinger = Arc::new(FadingPinger {
            healthy_pings: 2,
            seen: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        });
        let losses = Arc::new(AtomicUsize::new(0));

        let losses_in = losses.clone();
        let hb = start(
            "gs01-02".to_string(),
            pinger.clone(),
            Duration::from_millis(20),
            Duration::from_millis(100),
            move || {
                losses_in.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(losses.load(Ordering::SeqCst), 1);
        assert!(pinger.log.lock().unwrap().iter().all(|p| p == "gs01-02"));
        hb.stop();
    }

    #[tokio::test]
    async fn test_healthy_worker_is_never_reported() {
        struct AlwaysOk;
        #[async_trait::async_trait]
        impl Pinger for AlwaysOk {
            async fn ping(&self, _: &str) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let losses = Arc::new(AtomicUsize::new(0));
        let losses_in = losses.clone();
        let _hb = start(
            "gs01-01".to_string(),
            Arc::new(AlwaysOk),
            Duration::from_millis(10),
            Duration::from_millis(50),
            move || {
                losses_in.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(losses.load(Ordering::SeqCst), 0);
    }
}
