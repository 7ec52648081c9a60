use crate::{code, read_frame, write_frame, Frame, Request, RpcError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

struct Pending {
    tx: oneshot::Sender<Result<serde_json::Value, RpcError>>,
    since: Instant,
}

/// One outbound RPC connection to a peer. Responses correlate to
/// requests by id and may arrive in any order; requests pending longer
/// than the configured timeout are swept and failed without tearing the
/// connection down.
pub struct Client {
    peer_id: String,
    tx: mpsc::UnboundedSender<Frame>,
    pending: Arc<Mutex<HashMap<u64, Pending>>>,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
}

impl Client {
    pub async fn connect(
        peer_id: &str,
        addr: (&str, u16),
        timeout: Duration,
    ) -> Result<Arc<Self>, RpcError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(peer_id, stream, timeout))
    }

    pub fn from_stream(peer_id: &str, stream: TcpStream, timeout: Duration) -> Arc<Self> {
        let (mut read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        let pending: Arc<Mutex<HashMap<u64, Pending>>> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let client = Arc::new(Self {
            peer_id: peer_id.to_string(),
            tx,
            pending: pending.clone(),
            next_id: AtomicU64::new(1),
            closed: closed.clone(),
        });

        // Writer: drains the outbound queue. Ends when the client drops.
        let peer = peer_id.to_string();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(err) = write_frame(&mut write_half, &frame).await {
                    tracing::warn!(%peer, %err, "rpc write failed");
                    break;
                }
            }
        });

        // Reader: correlates responses to pending requests.
        let peer = peer_id.to_string();
        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(Frame::Response(response))) => {
                        let entry = reader_pending.lock().unwrap().remove(&response.id);
                        let Some(entry) = entry else {
                            // Swept by timeout, or never ours.
                            tracing::debug!(%peer, id = response.id, "dropping uncorrelated response");
                            continue;
                        };
                        let result = match (response.result, response.error) {
                            (_, Some(error)) => Err(error.into()),
                            (Some(result), None) => Ok(result),
                            (None, None) => Err(RpcError::Remote {
                                code: code::INVALID_REQUEST,
                                message: "response carries neither result nor error".to_string(),
                                data: None,
                            }),
                        };
                        let _ = entry.tx.send(result);
                    }
                    Ok(Some(Frame::Request(request))) => {
                        tracing::warn!(%peer, method = %request.method, "ignoring request on client connection");
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(%peer, %err, "rpc read failed");
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            let mut pending = reader_pending.lock().unwrap();
            for (_, entry) in pending.drain() {
                let _ = entry.tx.send(Err(RpcError::ConnectionClosed));
            }
        });

        // Sweeper: fails requests which have outlived the timeout.
        let peer = peer_id.to_string();
        let sweep_pending = pending;
        let sweep_closed = closed;
        tokio::spawn(async move {
            let period = (timeout / 4).max(Duration::from_millis(50));
            loop {
                tokio::time::sleep(period).await;
                if sweep_closed.load(Ordering::SeqCst) {
                    return;
                }
                let mut expired = Vec::new();
                {
                    let mut pending = sweep_pending.lock().unwrap();
                    let cutoff = Instant::now();
                    let ids: Vec<u64> = pending
                        .iter()
                        .filter(|(_, p)| cutoff.duration_since(p.since) >= timeout)
                        .map(|(id, _)| *id)
                        .collect();
                    for id in ids {
                        expired.push((id, pending.remove(&id).unwrap()));
                    }
                }
                for (id, entry) in expired {
                    tracing::warn!(%peer, id, "rpc request timed out");
                    let _ = entry.tx.send(Err(RpcError::Timeout));
                }
            }
        });

        client
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Whether the underlying connection is still up.
    pub fn is_healthy(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Issue one request and await its response.
    pub async fn call(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, RpcError> {
        if !self.is_healthy() {
            return Err(RpcError::ConnectionClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            id,
            Pending {
                tx,
                since: Instant::now(),
            },
        );

        let frame = Frame::Request(Request {
            id,
            method: method.to_string(),
            params,
        });
        if self.tx.send(frame).is_err() {
            self.pending.lock().unwrap().remove(&id);
            return Err(RpcError::ConnectionClosed);
        }

        rx.await.map_err(|_| RpcError::ConnectionClosed)?
    }
}
