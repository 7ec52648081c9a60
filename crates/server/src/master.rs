//! The cluster master: forks one worker per locally-hosted peer, keeps
//! each alive (respawn on exit, restart on heartbeat loss), and walks the
//! tiered shutdown ladder when the cluster stops.

use crate::heartbeat::{self, RpcPinger};
use anyhow::Context;
use config::{Config, Peer};
use nix::sys::signal::Signal;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Notify};

pub async fn run(cfg: Config) -> anyhow::Result<()> {
    let peers = cfg.peer_table(&config::local_addrs())?;
    let locals: Vec<Peer> = peers.local_peers().cloned().collect();
    anyhow::ensure!(
        !locals.is_empty(),
        "no configured game server matches a local address"
    );

    let net = rpc::PeerNet::new(peers.clone(), cfg.net.rpc.timeout);
    let pinger = RpcPinger::new(net.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The master answers pings on the base service port; workers get
    // base + 1 + their sorted index.
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", peers.master_rpc_port()))
        .await
        .with_context(|| format!("binding master rpc port {}", peers.master_rpc_port()))?;
    tokio::spawn(rpc::serve(
        listener,
        Arc::new(MasterDispatcher),
        shutdown_rx.clone(),
    ));

    tracing::info!(
        workers = locals.len(),
        rpc_port = peers.master_rpc_port(),
        "master starting"
    );

    let mut tasks = Vec::new();
    for peer in locals {
        tasks.push(tokio::spawn(supervise(
            peer,
            cfg.clone(),
            net.clone(),
            pinger.clone(),
            shutdown_rx.clone(),
        )));
    }

    wait_for_signal().await;
    tracing::info!("master shutting down");
    let _ = shutdown_tx.send(true);

    let drained = futures::future::join_all(tasks);
    match tokio::time::timeout(cfg.proc_.master_timeout, drained).await {
        Ok(_) => {
            tracing::info!("all workers stopped");
            Ok(())
        }
        Err(_) => anyhow::bail!("workers remained after the master shutdown timeout"),
    }
}

struct MasterDispatcher;

#[async_trait::async_trait]
impl rpc::RpcHandler for MasterDispatcher {
    async fn handle(
        &self,
        method: &str,
        _params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, rpc::ErrorPayload> {
        match method {
            "gs.ping" => Ok(serde_json::json!({"pong": "master"})),
            other => Err(rpc::ErrorPayload::new(
                rpc::code::METHOD_NOT_FOUND,
                format!("unknown method '{other}'"),
            )),
        }
    }
}

// Keep one worker slot alive until shutdown. The peer id is stable across
// every respawn.
async fn supervise(
    peer: Peer,
    cfg: Config,
    net: Arc<rpc::PeerNet>,
    pinger: Arc<RpcPinger>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let mut child = match spawn_worker(&peer) {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(peer = %peer.id, %err, "failed to fork worker");
                tokio::time::sleep(Duration::from_secs(1)).await;
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        };

        // The previous incarnation's connection is stale.
        net.disconnect(&peer.id);

        let lost = Arc::new(Notify::new());
        let on_loss = {
            let lost = lost.clone();
            move || lost.notify_one()
        };
        let hb = heartbeat::start(
            peer.id.clone(),
            pinger.clone(),
            cfg.net.heartbeat.interval,
            cfg.net.heartbeat.timeout,
            on_loss,
        );

        tokio::select! {
            status = child.wait() => {
                hb.stop();
                if *shutdown.borrow() {
                    return;
                }
                tracing::warn!(peer = %peer.id, ?status, "worker exited, respawning");
            }
            _ = lost.notified() => {
                hb.stop();
                tracing::warn!(peer = %peer.id, "restarting worker after heartbeat loss");
                let _ = child.kill().await;
                net.disconnect(&peer.id);
            }
            _ = shutdown.changed() => {
                hb.stop();
                shutdown_worker(&peer, &cfg, &net, child).await;
                return;
            }
        }
    }
}

fn spawn_worker(peer: &Peer) -> anyhow::Result<Child> {
    let exe = std::env::current_exe()?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    tracing::info!(peer = %peer.id, port = peer.port, "forking worker");
    Ok(Command::new(exe)
        .args(args)
        .env(config::GSID_VAR, &peer.id)
        .spawn()?)
}

// The shutdown ladder: in-band message, kill(), SIGTERM, SIGKILL, each
// stage given its grace period before escalating.
async fn shutdown_worker(peer: &Peer, cfg: &Config, net: &Arc<rpc::PeerNet>, mut child: Child) {
    tracing::info!(peer = %peer.id, "stopping worker");

    let in_band = async {
        let client = net.client_for(&peer.id).await?;
        client.call("gs.shutdown", vec![]).await?;
        Ok::<_, rpc::RpcError>(())
    };
    if let Err(err) = tokio::time::timeout(cfg.proc_.shutdown_timeout, in_band)
        .await
        .unwrap_or(Err(rpc::RpcError::Timeout))
    {
        tracing::debug!(peer = %peer.id, %err, "in-band shutdown did not confirm");
    }
    if wait_exit(&mut child, cfg.proc_.shutdown_timeout).await {
        return;
    }

    tracing::warn!(peer = %peer.id, "worker ignored shutdown message, killing");
    send_signal(&child, Signal::SIGTERM);
    if wait_exit(&mut child, cfg.proc_.kill_timeout).await {
        return;
    }

    send_signal(&child, Signal::SIGTERM);
    if wait_exit(&mut child, cfg.proc_.kill_timeout).await {
        return;
    }

    tracing::error!(peer = %peer.id, "worker survived SIGTERM, sending SIGKILL");
    let _ = child.kill().await;
}

async fn wait_exit(child: &mut Child, grace: Duration) -> bool {
    tokio::time::timeout(grace, child.wait()).await.is_ok()
}

fn send_signal(child: &Child, signal: Signal) {
    if let Some(pid) = child.id() {
        if let Err(err) = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal) {
            tracing::debug!(pid, %err, "signal delivery failed");
        }
    }
}

async fn wait_for_signal() {
    use tokio::signal::unix;

    let mut sigint = unix::signal(unix::SignalKind::interrupt()).unwrap();
    let mut sigterm = unix::signal(unix::SignalKind::terminate()).unwrap();
    tokio::select! {
        _ = sigint.recv() => (),
        _ = sigterm.recv() => (),
    }
    tracing::info!("caught signal to exit");
}
