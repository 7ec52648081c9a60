//! The worker runtime: ordered startup and shutdown of one peer's
//! subsystems. Startup: persistence, authentication, RPC, the inbound
//! handler, the client transport, background loaders. Shutdown runs the
//! same ladder in reverse.

use anyhow::Context;
use config::Config;
use rpc::{CoreDispatcher, PeerNet};
use runtime::{NoopAuth, NoopScriptHost, Runtime};
use session::SessionManager;
use std::sync::Arc;
use std::time::Duration;
use store::{FsStore, MemStore, Store};
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Lifecycle states of a worker process. A worker re-enters `Booting`
/// only by being respawned by the master under the same peer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Booting,
    Ready,
    Serving,
    Draining,
    Exited,
}

fn enter(peer_id: &str, state: WorkerState) {
    tracing::info!(peer = %peer_id, ?state, "worker state change");
}

pub async fn run(cfg: Config, peer_id: String) -> anyhow::Result<()> {
    let peers = cfg.peer_table(&config::local_addrs())?;
    anyhow::ensure!(
        peers.get(&peer_id).is_some(),
        "peer id '{peer_id}' is not in the configured peer table"
    );
    enter(&peer_id, WorkerState::Booting);

    // Persistence comes up first; everything else loads through it.
    let mapper = store::table_mapper_with(cfg.data.tables.clone());
    let store: Arc<dyn Store> = match cfg.data.backend.as_str() {
        "mem" => Arc::new(MemStore::with_mapper(mapper)),
        "fs" => Arc::new(FsStore::with_mapper(&cfg.data.dir, mapper)),
        other => anyhow::bail!("unknown storage backend '{other}'"),
    };
    store.open().await.context("opening storage")?;

    // Authentication and the script host are ports; production deploys
    // attach their real implementations here.
    let auth = Arc::new(NoopAuth);
    let script = Arc::new(NoopScriptHost);
    let rt = Runtime::new(
        cfg.clone(),
        peers.clone(),
        peer_id.clone(),
        store.clone(),
        script,
        auth,
    );

    // RPC: serve our service port, then pre-dial the other peers so the
    // first cross-peer request doesn't pay the dial.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let net = PeerNet::new(peers.clone(), cfg.net.rpc.timeout);
    let rpc_port = peers.rpc_port(&peer_id)?;
    let rpc_listener = TcpListener::bind(("0.0.0.0", rpc_port))
        .await
        .with_context(|| format!("binding rpc port {rpc_port}"))?;
    let dispatcher = CoreDispatcher::new(rt.clone(), shutdown_tx.clone());
    let rpc_task = tokio::spawn(rpc::serve(rpc_listener, dispatcher, shutdown_rx.clone()));

    for peer in peers.iter().filter(|p| p.id != peer_id) {
        if let Err(err) = net.client_for(&peer.id).await {
            tracing::debug!(peer = %peer.id, %err, "peer not reachable yet, will retry on use");
        }
    }

    // The inbound handler and client transport.
    let sessions = SessionManager::new(rt.clone(), net.clone());
    let client_port = peers.client_port(&peer_id)?;
    let client_listener = TcpListener::bind(("0.0.0.0", client_port))
        .await
        .with_context(|| format!("binding client port {client_port}"))?;
    let accept_task = tokio::spawn(accept_sessions(
        client_listener,
        sessions.clone(),
        shutdown_rx.clone(),
    ));

    // Background loaders: script prototypes (and chat bridges, attached
    // through the group hooks) come up last.
    enter(&peer_id, WorkerState::Ready);
    rt.script
        .load_prototypes()
        .await
        .context("loading script prototypes")?;

    let stats_task = tokio::spawn(report_stats(rt.clone()));
    enter(&peer_id, WorkerState::Serving);
    tracing::info!(%peer_id, rpc_port, client_port, "accepting connections");

    wait_for_shutdown(shutdown_rx).await;

    // Ordered shutdown: stop accepting, close the transport, drain the
    // RQs, stop RPC, flush and close persistence.
    enter(&peer_id, WorkerState::Draining);
    let _ = shutdown_tx.send(true);
    stats_task.abort();
    let _ = accept_task.await;

    if !rt.rqs.drain_all(cfg.proc_.shutdown_timeout).await {
        tracing::warn!(%peer_id, "request queues did not drain in time");
    }
    match rpc_task.await {
        Ok(Err(err)) => tracing::warn!(%err, "rpc listener exited with error"),
        Err(err) => tracing::warn!(%err, "rpc listener task failed"),
        Ok(Ok(())) => (),
    }
    store.close().await.context("closing storage")?;

    enter(&peer_id, WorkerState::Exited);
    tracing::info!(%peer_id, open_sessions = sessions.len(), "worker done");
    Ok(())
}

async fn accept_sessions(
    listener: TcpListener,
    sessions: Arc<SessionManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    tracing::debug!(%remote, "client connected");
                    sessions.new_session(stream);
                }
                Err(err) => tracing::warn!(%err, "client accept failed"),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn report_stats(rt: Arc<Runtime>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let stats = rt.rqs.stats();
        tracing::info!(
            queues = stats.queues,
            total_depth = stats.total_depth,
            avg_depth = stats.avg_depth,
            "request queue stats"
        );
    }
}

// Runs until an OS signal or an in-band `gs.shutdown` arrives.
async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    use tokio::signal::unix;

    let mut sigint = unix::signal(unix::SignalKind::interrupt()).unwrap();
    let mut sigterm = unix::signal(unix::SignalKind::terminate()).unwrap();
    loop {
        tokio::select! {
            _ = sigint.recv() => return,
            _ = sigterm.recv() => return,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
