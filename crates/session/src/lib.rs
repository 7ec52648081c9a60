//! Client session management: binds connections to sessions, routes
//! inbound messages onto the owning entity's RQ (or to the owning peer),
//! and fans outbound messages across logged-in sessions.
//!
//! The transport framing is newline-delimited JSON; payload validation
//! beyond framing belongs to the game-script layer.

use futures::StreamExt;
use models::{FieldValue, Id};
use rand::Rng;
use rpc::PeerNet;
use runtime::{RqOpts, Runtime, GLOBAL_LOAD_RQ};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    LoggedIn,
    Closed,
}

/// One client connection. Outbound messages queue on `tx` and are
/// written by the session's writer task.
pub struct Session {
    pub id: String,
    state: Mutex<SessionState>,
    player: Mutex<Option<Id>>,
    tx: mpsc::UnboundedSender<Value>,
}

impl Session {
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn player(&self) -> Option<Id> {
        self.player.lock().unwrap().clone()
    }

    /// Queue an outbound message. Delivery failures surface here only as
    /// a closed-channel error; the caller decides whether to care.
    pub fn send(&self, msg: Value) -> anyhow::Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| anyhow::anyhow!("session '{}' is closed", self.id))
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().unwrap() = next;
    }
}

/// The process-wide session table, keyed by short base-36 session ids.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    runtime: Arc<Runtime>,
    net: Arc<PeerNet>,
}

impl SessionManager {
    pub fn new(runtime: Arc<Runtime>, net: Arc<PeerNet>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            runtime,
            net,
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    /// Bind a fresh session to `stream` and start its reader and writer
    /// tasks. The session unlinks itself when the connection closes.
    pub fn new_session(self: &Arc<Self>, stream: TcpStream) -> Arc<Session> {
        let id = new_session_id();
        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        let session = Arc::new(Session {
            id: id.clone(),
            state: Mutex::new(SessionState::Connecting),
            player: Mutex::new(None),
            tx,
        });
        self.sessions
            .lock()
            .unwrap()
            .insert(id.clone(), session.clone());
        tracing::info!(session = %id, "session connected");

        let (read_half, mut write_half) = stream.into_split();

        // Writer: one JSON document per line.
        let writer_id = id.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let mut line = msg.to_string();
                line.push('\n');
                if let Err(err) = write_half.write_all(line.as_bytes()).await {
                    tracing::debug!(session = %writer_id, %err, "session write failed");
                    break;
                }
            }
        });

        // Reader: frames inbound messages and dispatches each one.
        let manager = self.clone();
        let reader_session = session.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            reader_session.set_state(SessionState::Active);

            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let msg: Value = match serde_json::from_str(&line) {
                    Ok(msg) => msg,
                    Err(err) => {
                        let _ = reader_session.send(json!({
                            "type": "error",
                            "error": format!("unparseable message: {err}"),
                        }));
                        continue;
                    }
                };
                let reply = manager.handle_message(&reader_session, msg).await;
                let _ = match reply {
                    Ok(reply) => reader_session.send(reply),
                    Err(err) => reader_session.send(json!({
                        "type": "error",
                        "error": format!("{err:#}"),
                    })),
                };
            }

            // Connection closed: unlink.
            reader_session.set_state(SessionState::Closed);
            manager.unlink(&reader_session.id);
        });

        session
    }

    fn unlink(&self, id: &str) {
        self.sessions.lock().unwrap().remove(id);
        tracing::info!(session = %id, "session closed");
    }

    /// Fan a message out to every logged-in session, swallowing
    /// per-session delivery errors.
    pub fn send_to_all(&self, msg: &Value) {
        let sessions: Vec<Arc<Session>> = {
            self.sessions.lock().unwrap().values().cloned().collect()
        };
        for session in sessions {
            if session.state() != SessionState::LoggedIn {
                continue;
            }
            if let Err(err) = session.send(msg.clone()) {
                tracing::debug!(session = %session.id, %err, "fan-out delivery failed");
            }
        }
    }

    /// Apply `f` to every session with bounded concurrency, aggregating
    /// the per-session results in no particular order.
    pub async fn for_each_session<F, Fut, T>(&self, f: F) -> Vec<T>
    where
        F: Fn(Arc<Session>) -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let sessions: Vec<Arc<Session>> = {
            self.sessions.lock().unwrap().values().cloned().collect()
        };
        futures::stream::iter(sessions)
            .map(f)
            .buffer_unordered(10)
            .collect()
            .await
    }

    // Classify one inbound message and dispatch it. Login runs here; any
    // other message requires the LoggedIn state and lands on the RQ of
    // its target (the player's current location by default).
    async fn handle_message(
        self: &Arc<Self>,
        session: &Arc<Session>,
        msg: Value,
    ) -> anyhow::Result<Value> {
        let msg_type = msg
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("message is missing 'type'"))?;

        if msg_type == "login" {
            return self.login(session, &msg).await;
        }

        if session.state() != SessionState::LoggedIn {
            anyhow::bail!("'{msg_type}' requires a logged-in session");
        }

        let target = match msg.get("target").and_then(Value::as_str) {
            Some(target) => Id::parse(target)?,
            None => self.player_location(session).await?,
        };

        let result = rpc::dispatch(
            &self.runtime,
            &self.net,
            target,
            msg_type.clone(),
            vec![msg],
            Some(session.id.clone()),
        )
        .await?;

        Ok(json!({"type": format!("{msg_type}_reply"), "result": result}))
    }

    async fn login(
        self: &Arc<Self>,
        session: &Arc<Session>,
        msg: &Value,
    ) -> anyhow::Result<Value> {
        if session.state() != SessionState::Active {
            anyhow::bail!("login is only valid on an active session");
        }
        let token = msg
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("login is missing 'token'"))?;

        let player = self.runtime.auth.validate_token(token).await?;

        // The player record loads on the global load queue: until it is
        // in memory the session has no location RQ to serialize on.
        let player_in = player.clone();
        let session_id = session.id.clone();
        self.runtime
            .run_queued(
                GLOBAL_LOAD_RQ,
                "session_login",
                RqOpts {
                    session: Some(session_id),
                    ..Default::default()
                },
                Box::new(move |ctx| {
                    Box::pin(async move {
                        let entity = ctx.get(&player_in).await?;
                        entity.write().unwrap().set("last_login", now_ms());
                        ctx.set_dirty(&entity);
                        Ok(Value::Null)
                    })
                }),
            )
            .await?;

        *session.player.lock().unwrap() = Some(player.clone());
        session.set_state(SessionState::LoggedIn);
        tracing::info!(session = %session.id, %player, "session logged in");

        Ok(json!({"type": "login_reply", "player": player}))
    }

    // The id of the logged-in player's current location.
    async fn player_location(&self, session: &Arc<Session>) -> anyhow::Result<Id> {
        let player = session
            .player()
            .ok_or_else(|| anyhow::anyhow!("session has no player"))?;
        let entity = self.runtime.cache.get(&player).await?;
        let location = {
            let entity = entity.read().unwrap();
            entity
                .get("location")
                .and_then(FieldValue::as_ref_value)
                .map(|r| r.id.clone())
        };
        location.ok_or_else(|| anyhow::anyhow!("player '{player}' has no location"))
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// Short base-36 session ids, distinct from entity ids.
fn new_session_id() -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| DIGITS[rng.gen_range(0..36)] as char)
        .collect()
}
