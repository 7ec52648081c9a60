//! Cluster-level tests: two peers assembled in one process, talking over
//! real TCP RPC against a shared store.

use models::{FieldValue, Id};
use rpc::{CoreDispatcher, PeerNet, RemoteEntity};
use runtime::{EntityRef, NoopAuth, RequestContext, Runtime, ScriptHost};
use session::SessionManager;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use store::{MemStore, Store};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

// Script host that records invocations and marks the target dirty.
struct RecordingHost {
    invoked: Mutex<Vec<(Id, String)>>,
}

#[async_trait::async_trait]
impl ScriptHost for RecordingHost {
    async fn load_prototypes(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn invoke(
        &self,
        ctx: &mut RequestContext,
        target: EntityRef,
        method: &str,
        args: Vec<FieldValue>,
    ) -> anyhow::Result<FieldValue> {
        let id = target.read().unwrap().id.clone();
        self.invoked.lock().unwrap().push((id, method.to_string()));

        target
            .write()
            .unwrap()
            .set("visits", args.len() as i64);
        ctx.set_dirty(&target);
        Ok(FieldValue::Str("done".to_string()))
    }
}

struct TestPeer {
    runtime: Arc<Runtime>,
    net: Arc<PeerNet>,
    host: Arc<RecordingHost>,
    _shutdown: watch::Sender<bool>,
}

// Assemble a two-peer cluster on localhost: gs01-01 and gs01-02 share one
// store, and each serves its RPC port derived from `base_port`.
async fn two_peers(base_port: u16) -> (TestPeer, TestPeer) {
    let store = Arc::new(MemStore::new());
    let mut peers_out = Vec::new();

    for peer_id in ["gs01-01", "gs01-02"] {
        let mut cfg = config::Config::from_value(config::defaults()).unwrap();
        cfg.net.rpc.base_port = base_port;
        cfg.net.rpc.timeout = Duration::from_secs(2);
        cfg.net.gameservers.insert(
            "gs01".to_string(),
            config::HostConfig {
                host: "127.0.0.1".to_string(),
                ports: vec![1443, 1444],
            },
        );
        let peers = cfg.peer_table(&["127.0.0.1".to_string()]).unwrap();

        let host = Arc::new(RecordingHost {
            invoked: Mutex::new(Vec::new()),
        });
        let runtime = Runtime::new(
            cfg.clone(),
            peers.clone(),
            peer_id.to_string(),
            store.clone() as Arc<dyn Store>,
            host.clone(),
            Arc::new(NoopAuth),
        );
        let net = PeerNet::new(peers.clone(), cfg.net.rpc.timeout);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = TcpListener::bind(("127.0.0.1", peers.rpc_port(peer_id).unwrap()))
            .await
            .unwrap();
        let dispatcher = CoreDispatcher::new(runtime.clone(), shutdown_tx.clone());
        tokio::spawn(rpc::serve(listener, dispatcher, shutdown_rx));

        peers_out.push(TestPeer {
            runtime,
            net,
            host,
            _shutdown: shutdown_tx,
        });
    }

    let second = peers_out.pop().unwrap();
    (peers_out.pop().unwrap(), second)
}

async fn seed(store: &Arc<dyn Store>, id: &str, record: serde_json::Value) {
    store
        .write(&Id::parse(id).unwrap(), record)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_remote_location_message_travels_by_rpc() {
    let (gs1, gs2) = two_peers(29180).await;
    let store = gs1.runtime.cache.store().clone();

    // LAAA hashes onto the second peer of the sorted pair.
    seed(&store, "LAAA", serde_json::json!({"id": "LAAA", "class": "loc"})).await;
    seed(
        &store,
        "PAB1",
        serde_json::json!({"id": "PAB1", "class": "human",
                           "location": {"id": "LBBB", "isRef": true}}),
    )
    .await;

    // A session bound to gs01-01 sends a move targeting LAAA.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let sessions = SessionManager::new(gs1.runtime.clone(), gs1.net.clone());
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        sessions.new_session(stream);
    });

    let mut client = BufReader::new(TcpStream::connect(addr).await.unwrap());
    let login = send_recv(
        &mut client,
        serde_json::json!({"type": "login", "token": "PAB1"}),
    )
    .await;
    assert_eq!(login["type"], "login_reply");

    let reply = send_recv(
        &mut client,
        serde_json::json!({"type": "move", "target": "LAAA", "x": 3}),
    )
    .await;
    assert_eq!(reply["type"], "move_reply");
    assert_eq!(reply["result"], "done");

    // The invocation ran on the owner, not on the session's peer.
    assert!(gs1.host.invoked.lock().unwrap().is_empty());
    let invoked = gs2.host.invoked.lock().unwrap().clone();
    assert_eq!(invoked, vec![(Id::parse("LAAA").unwrap(), "move".to_string())]);

    // wait_pers on the invoked request: the mutation is durable by the
    // time the session got its reply.
    let record = store
        .read(&Id::parse("LAAA").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record["visits"], 1);
}

#[tokio::test]
async fn test_remote_entity_proxy_round_trip() {
    let (gs1, gs2) = two_peers(29190).await;
    let store = gs1.runtime.cache.store().clone();
    seed(&store, "LAAA", serde_json::json!({"id": "LAAA", "class": "loc"})).await;

    let id = Id::parse("LAAA").unwrap();
    let owner = gs1.runtime.owner_of_id(&id).await.unwrap();
    assert_eq!(owner, "gs01-02");

    let remote = RemoteEntity::new(id.clone(), owner, gs1.net.clone());
    let result = remote
        .call("poke", vec![FieldValue::Int(1), FieldValue::Int(2)])
        .await
        .unwrap();
    assert_eq!(result, FieldValue::Str("done".to_string()));

    let invoked = gs2.host.invoked.lock().unwrap().clone();
    assert_eq!(invoked, vec![(id, "poke".to_string())]);
}

#[tokio::test]
async fn test_worker_runs_and_honors_in_band_shutdown() {
    let mut cfg = config::Config::from_value(config::defaults()).unwrap();
    cfg.net.rpc.base_port = 29280;
    cfg.net.client_base_port = 29290;
    cfg.data.backend = "mem".to_string();
    cfg.proc_.shutdown_timeout = Duration::from_secs(2);
    cfg.net.gameservers.insert(
        "gs01".to_string(),
        config::HostConfig {
            host: "127.0.0.1".to_string(),
            ports: vec![1443],
        },
    );

    let worker = tokio::spawn(server::worker::run(cfg, "gs01-01".to_string()));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!worker.is_finished());

    // gs.shutdown over the worker's own RPC port drains it.
    let stream = TcpStream::connect(("127.0.0.1", 29281)).await.unwrap();
    let client = rpc::Client::from_stream("gs01-01", stream, Duration::from_secs(2));
    client.call("gs.shutdown", vec![]).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("worker did not exit")
        .unwrap();
    result.unwrap();
}

async fn send_recv(client: &mut BufReader<TcpStream>, msg: serde_json::Value) -> serde_json::Value {
    let mut line = msg.to_string();
    line.push('\n');
    client.get_mut().write_all(line.as_bytes()).await.unwrap();

    let mut reply = String::new();
    client.read_line(&mut reply).await.unwrap();
    serde_json::from_str(&reply).unwrap()
}
