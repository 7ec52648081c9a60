use crate::{code, read_frame, write_frame, ErrorPayload, Frame, Response, RpcError};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

/// Server-side method dispatch. Implementations map a method name and
/// params to a result, or to an error payload delivered to the caller.
#[async_trait::async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, ErrorPayload>;
}

/// Accept loop for one peer's RPC listener. Runs until `shutdown` flips
/// true. Requests on one connection are handled concurrently; their
/// responses are written in completion order and correlate by id.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn RpcHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), RpcError> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote) = accepted?;
                tracing::debug!(%remote, "rpc connection accepted");
                tokio::spawn(connection(stream, handler.clone(), shutdown.clone()));
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::debug!("rpc listener stopping");
                    return Ok(());
                }
            }
        }
    }
}

async fn connection(
    stream: tokio::net::TcpStream,
    handler: Arc<dyn RpcHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Response>();

    let writer = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            if let Err(err) = write_frame(&mut write_half, &Frame::Response(response)).await {
                tracing::warn!(%err, "rpc response write failed");
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut read_half) => frame,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() { break; }
                continue;
            }
        };
        match frame {
            Ok(Some(Frame::Request(request))) => {
                let handler = handler.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let response = match handler.handle(&request.method, request.params).await {
                        Ok(result) => Response::ok(request.id, result),
                        Err(error) => Response::err(request.id, error),
                    };
                    let _ = tx.send(response);
                });
            }
            Ok(Some(Frame::Response(response))) => {
                tracing::debug!(id = response.id, "ignoring response on server connection");
            }
            Ok(None) => break,
            Err(RpcError::Codec(err)) => {
                tracing::warn!(%err, "unparseable rpc frame");
                let _ = tx.send(Response::err(
                    0,
                    ErrorPayload::new(code::PARSE_ERROR, "unparseable frame"),
                ));
            }
            Err(err) => {
                tracing::warn!(%err, "rpc connection failed");
                break;
            }
        }
    }

    drop(tx);
    let _ = writer.await;
}
