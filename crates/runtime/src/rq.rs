use crate::{Cache, RequestContext};
use futures::future::BoxFuture;
use models::Id;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Well-known global queues which exist alongside the per-owner queues.
pub const GLOBAL_LOAD_RQ: &str = "global_load";
pub const GLOBAL_DISPATCH_RQ: &str = "global_dispatch";

/// A queued request handler. Handlers borrow the request context, mutate
/// entities fetched through it, and flag them dirty; the run loop owns
/// persistence.
pub type Handler = Box<
    dyn for<'a> FnOnce(&'a mut RequestContext) -> BoxFuture<'a, anyhow::Result<serde_json::Value>>
        + Send,
>;

/// Completion callback for a queued request. Receives the handler's
/// result, or the persistence error when `wait_pers` was requested.
pub type Callback = Box<dyn FnOnce(anyhow::Result<serde_json::Value>) + Send>;

#[derive(Debug, Default, Clone)]
pub struct RqOpts {
    /// Close the queue after this item: earlier items run to completion,
    /// later pushes are dropped, and the queue leaves the directory.
    pub close: bool,
    /// Hold the queue (and the callback) until persistence completes.
    pub wait_pers: bool,
    /// Session on whose behalf the request runs, if any.
    pub session: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RqState {
    Open,
    Draining,
    Closed,
}

struct Item {
    tag: String,
    func: Handler,
    cb: Option<Callback>,
    opts: RqOpts,
}

/// A per-owner serial executor. At most one item runs at a time; the next
/// item starts only after the previous handler returns, or after its
/// persistence completes when `wait_pers` was set.
pub struct RequestQueue {
    name: String,
    tx: mpsc::UnboundedSender<Item>,
    state: Arc<Mutex<RqState>>,
    depth: Arc<AtomicUsize>,
}

impl RequestQueue {
    /// Enqueue a work item. Returns false (dropping the item silently
    /// apart from a debug log) once the queue is draining or closed.
    pub fn push(&self, tag: &str, func: Handler, cb: Option<Callback>, opts: RqOpts) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if *state != RqState::Open {
                tracing::debug!(rq = %self.name, %tag, "dropping push onto closing queue");
                return false;
            }
            if opts.close {
                *state = RqState::Draining;
            }
        }
        self.depth.fetch_add(1, Ordering::SeqCst);
        let sent = self
            .tx
            .send(Item {
                tag: tag.to_string(),
                func,
                cb,
                opts,
            })
            .is_ok();
        if !sent {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        sent
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RqState {
        *self.state.lock().unwrap()
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TagTimer {
    pub count: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

/// A point-in-time view of queue depths and request timers.
#[derive(Debug, serde::Serialize)]
pub struct RqStatsSnapshot {
    pub queues: usize,
    pub total_depth: usize,
    pub avg_depth: f64,
    pub timers: BTreeMap<String, TagTimer>,
}

struct DirectoryInner {
    queues: Mutex<HashMap<String, Arc<RequestQueue>>>,
    cache: Arc<Cache>,
    timers: Mutex<BTreeMap<String, TagTimer>>,
}

/// The process-wide directory of live request queues.
pub struct RqDirectory {
    inner: Arc<DirectoryInner>,
}

impl RqDirectory {
    pub fn new(cache: Arc<Cache>) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(DirectoryInner {
                queues: Mutex::new(HashMap::new()),
                cache,
                timers: Mutex::new(BTreeMap::new()),
            }),
        })
    }

    /// Fetch the queue named `name` (an owner id or a well-known global
    /// queue name), creating and registering it if absent.
    pub fn get_or_create(&self, name: &str) -> Arc<RequestQueue> {
        let mut queues = self.inner.queues.lock().unwrap();
        if let Some(rq) = queues.get(name) {
            return rq.clone();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(RqState::Open));
        let depth = Arc::new(AtomicUsize::new(0));
        let rq = Arc::new(RequestQueue {
            name: name.to_string(),
            tx,
            state: state.clone(),
            depth: depth.clone(),
        });
        queues.insert(name.to_string(), rq.clone());

        let owner = Id::parse(name).ok();
        tokio::spawn(run(
            rx,
            self.inner.clone(),
            name.to_string(),
            owner,
            depth,
            state,
        ));
        rq
    }

    pub fn get(&self, name: &str) -> Option<Arc<RequestQueue>> {
        self.inner.queues.lock().unwrap().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.queues.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RqStatsSnapshot {
        let queues = self.inner.queues.lock().unwrap();
        let total_depth: usize = queues.values().map(|rq| rq.depth()).sum();
        RqStatsSnapshot {
            queues: queues.len(),
            total_depth,
            avg_depth: if queues.is_empty() {
                0.0
            } else {
                total_depth as f64 / queues.len() as f64
            },
            timers: self.inner.timers.lock().unwrap().clone(),
        }
    }

    /// Push a close item onto every registered queue and wait for the
    /// directory to empty. Used during worker shutdown.
    pub async fn drain_all(&self, timeout: Duration) -> bool {
        let queues: Vec<Arc<RequestQueue>> = {
            self.inner.queues.lock().unwrap().values().cloned().collect()
        };
        for rq in queues {
            rq.push(
                "rq_close",
                Box::new(|_ctx| Box::pin(async { Ok(serde_json::Value::Null) })),
                None,
                RqOpts {
                    close: true,
                    ..Default::default()
                },
            );
        }

        let deadline = Instant::now() + timeout;
        while !self.is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

impl DirectoryInner {
    fn record_timing(&self, tag: &str, elapsed: Duration) {
        let mut timers = self.timers.lock().unwrap();
        let timer = timers.entry(tag.to_string()).or_default();
        let ms = elapsed.as_millis() as u64;
        timer.count += 1;
        timer.total_ms += ms;
        timer.max_ms = timer.max_ms.max(ms);
    }
}

// The queue's run loop. Errors never propagate out of here: a handler or
// persistence failure is delivered to the item's callback and logged,
// and the loop continues with the next item.
async fn run(
    mut rx: mpsc::UnboundedReceiver<Item>,
    inner: Arc<DirectoryInner>,
    name: String,
    owner: Option<Id>,
    depth: Arc<AtomicUsize>,
    state: Arc<Mutex<RqState>>,
) {
    while let Some(item) = rx.recv().await {
        depth.fetch_sub(1, Ordering::SeqCst);
        let started = Instant::now();
        let close = item.opts.close;

        let mut ctx = RequestContext::new(
            inner.cache.clone(),
            item.tag.clone(),
            owner.clone(),
            item.opts.session.clone(),
        );
        match (item.func)(&mut ctx).await {
            Ok(value) => {
                if item.opts.wait_pers {
                    match ctx.persist().await {
                        Ok(()) => invoke(item.cb, Ok(value)),
                        Err(err) => {
                            tracing::error!(rq = %name, tag = %item.tag, %err, "post-request persistence failed");
                            invoke(item.cb, Err(err.into()));
                        }
                    }
                } else {
                    let (rq_name, tag) = (name.clone(), item.tag.clone());
                    let persist = ctx.persist();
                    tokio::spawn(async move {
                        if let Err(err) = persist.await {
                            tracing::error!(rq = %rq_name, %tag, %err, "post-request persistence failed");
                        }
                    });
                    invoke(item.cb, Ok(value));
                }
            }
            Err(err) => {
                // The dirty set is discarded with the context.
                tracing::error!(rq = %name, tag = %item.tag, err = format!("{err:#}"), "request handler failed");
                invoke(item.cb, Err(err));
            }
        }
        inner.record_timing(&item.tag, started.elapsed());

        if close {
            break;
        }
    }

    *state.lock().unwrap() = RqState::Closed;
    inner.queues.lock().unwrap().remove(&name);
    tracing::debug!(rq = %name, "request queue closed");
}

fn invoke(cb: Option<Callback>, result: anyhow::Result<serde_json::Value>) {
    if let Some(cb) = cb {
        cb(result);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use store::{MemStore, Store, StoreError};
    use tokio::sync::oneshot;

    fn directory() -> Arc<RqDirectory> {
        RqDirectory::new(Arc::new(Cache::new(Arc::new(MemStore::new()))))
    }

    fn mark(log: &Arc<Mutex<Vec<String>>>, entry: &str) {
        log.lock().unwrap().push(entry.to_string());
    }

    fn entries(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_serial_execution() {
        let rqs = directory();
        let rq = rqs.get_or_create("LSERIAL");
        let log = Arc::new(Mutex::new(Vec::new()));
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        let log1 = log.clone();
        rq.push(
            "first",
            Box::new(move |_ctx| {
                Box::pin(async move {
                    mark(&log1, "first_start");
                    let _ = gate_rx.await;
                    mark(&log1, "first_end");
                    Ok(Value::Null)
                })
            }),
            None,
            RqOpts::default(),
        );
        let log2 = log.clone();
        rq.push(
            "second",
            Box::new(move |_ctx| {
                Box::pin(async move {
                    mark(&log2, "second");
                    Ok(Value::Null)
                })
            }),
            None,
            RqOpts::default(),
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        // The second handler must not start while the first is blocked.
        assert_eq!(entries(&log), vec!["first_start"]);
        assert_eq!(rq.depth(), 1);

        gate_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(entries(&log), vec!["first_start", "first_end", "second"]);
        assert_eq!(rq.depth(), 0);
    }

    // A store whose writes take long enough to observe request/persistence
    // interleaving.
    struct SlowStore {
        inner: MemStore,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Store for SlowStore {
        async fn open(&self) -> Result<(), StoreError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), StoreError> {
            Ok(())
        }
        async fn read(&self, id: &Id) -> Result<Option<Value>, StoreError> {
            self.inner.read(id).await
        }
        async fn write(&self, id: &Id, record: Value) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_millis(80)).await;
            self.log.lock().unwrap().push("write_done".to_string());
            self.inner.write(id, record).await
        }
        async fn delete(&self, id: &Id) -> Result<(), StoreError> {
            self.inner.delete(id).await
        }
    }

    fn slow_directory(log: Arc<Mutex<Vec<String>>>) -> Arc<RqDirectory> {
        RqDirectory::new(Arc::new(Cache::new(Arc::new(SlowStore {
            inner: MemStore::new(),
            log,
        }))))
    }

    #[tokio::test]
    async fn test_wait_pers_holds_callback_and_queue() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let rqs = slow_directory(log.clone());
        let rq = rqs.get_or_create("LWAIT");

        let cb_log = log.clone();
        rq.push(
            "a",
            Box::new(|ctx| {
                Box::pin(async move {
                    ctx.create(models::EntityKind::Item, "rock");
                    Ok(Value::Null)
                })
            }),
            Some(Box::new(move |_| mark(&cb_log, "a_cb"))),
            RqOpts {
                wait_pers: true,
                ..Default::default()
            },
        );
        let b_log = log.clone();
        rq.push(
            "b",
            Box::new(move |_ctx| {
                Box::pin(async move {
                    mark(&b_log, "b_start");
                    Ok(Value::Null)
                })
            }),
            None,
            RqOpts::default(),
        );

        tokio::time::sleep(Duration::from_millis(250)).await;
        // Persistence completes, then A's callback, then B.
        assert_eq!(entries(&log), vec!["write_done", "a_cb", "b_start"]);
    }

    #[tokio::test]
    async fn test_without_wait_pers_the_next_item_overlaps_persistence() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let rqs = slow_directory(log.clone());
        let rq = rqs.get_or_create("LNOWAIT");

        let cb_log = log.clone();
        rq.push(
            "a",
            Box::new(|ctx| {
                Box::pin(async move {
                    ctx.create(models::EntityKind::Item, "rock");
                    Ok(Value::Null)
                })
            }),
            Some(Box::new(move |_| mark(&cb_log, "a_cb"))),
            RqOpts::default(),
        );
        let b_log = log.clone();
        rq.push(
            "b",
            Box::new(move |_ctx| {
                Box::pin(async move {
                    mark(&b_log, "b_start");
                    Ok(Value::Null)
                })
            }),
            None,
            RqOpts::default(),
        );

        tokio::time::sleep(Duration::from_millis(250)).await;
        // A's callback fires as soon as its handler returns, and B starts
        // while A's write is still in flight.
        assert_eq!(entries(&log), vec!["a_cb", "b_start", "write_done"]);
    }

    #[tokio::test]
    async fn test_followup_request_reads_the_previous_write() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let rqs = slow_directory(log.clone());
        let rq = rqs.get_or_create("LRYW");

        // Request A creates and mutates an item, holding the queue until
        // persistence completes.
        let (id_tx, id_rx) = oneshot::channel();
        rq.push(
            "a",
            Box::new(move |ctx| {
                Box::pin(async move {
                    let item = ctx.create(models::EntityKind::Item, "rock");
                    item.write().unwrap().set("count", 7);
                    ctx.set_dirty(&item);
                    let _ = id_tx.send(item.read().unwrap().id.clone());
                    Ok(Value::Null)
                })
            }),
            None,
            RqOpts {
                wait_pers: true,
                ..Default::default()
            },
        );
        let id = id_rx.await.unwrap();

        // Request B, pushed while A may still be persisting, observes
        // A's write on its first read.
        let (seen_tx, seen_rx) = oneshot::channel();
        let read_id = id.clone();
        rq.push(
            "b",
            Box::new(move |ctx| {
                Box::pin(async move {
                    let item = ctx.get(&read_id).await?;
                    let count = item.read().unwrap().get_int("count");
                    let _ = seen_tx.send(count);
                    Ok(Value::Null)
                })
            }),
            None,
            RqOpts::default(),
        );

        assert_eq!(seen_rx.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_handler_error_reaches_callback_and_skips_persistence() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let rqs = slow_directory(log.clone());
        let rq = rqs.get_or_create("LERR");

        let (tx, rx) = oneshot::channel();
        rq.push(
            "boom",
            Box::new(|ctx| {
                Box::pin(async move {
                    ctx.create(models::EntityKind::Item, "rock");
                    anyhow::bail!("scripted failure")
                })
            }),
            Some(Box::new(move |result| {
                tx.send(result.unwrap_err().to_string()).unwrap();
            })),
            RqOpts::default(),
        );

        assert_eq!(rx.await.unwrap(), "scripted failure");
        tokio::time::sleep(Duration::from_millis(150)).await;
        // The dirty entity was discarded: nothing was written.
        assert!(entries(&log).is_empty());
    }

    #[tokio::test]
    async fn test_graceful_close() {
        let rqs = directory();
        let rq = rqs.get_or_create("LCLOSE");
        let log = Arc::new(Mutex::new(Vec::new()));

        let log1 = log.clone();
        rq.push(
            "before",
            Box::new(move |_ctx| {
                Box::pin(async move {
                    mark(&log1, "before");
                    Ok(Value::Null)
                })
            }),
            None,
            RqOpts::default(),
        );
        let log2 = log.clone();
        assert!(rq.push(
            "close",
            Box::new(move |_ctx| {
                Box::pin(async move {
                    mark(&log2, "close");
                    Ok(Value::Null)
                })
            }),
            None,
            RqOpts {
                close: true,
                ..Default::default()
            },
        ));

        // Pushes after close are silently dropped.
        let log3 = log.clone();
        assert!(!rq.push(
            "late",
            Box::new(move |_ctx| {
                Box::pin(async move {
                    mark(&log3, "late");
                    Ok(Value::Null)
                })
            }),
            None,
            RqOpts::default(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(entries(&log), vec!["before", "close"]);
        assert_eq!(rq.state(), RqState::Closed);
        // The queue left the directory.
        assert!(rqs.get("LCLOSE").is_none());
    }

    #[tokio::test]
    async fn test_stats_track_depth_and_timers() {
        let rqs = directory();
        let rq = rqs.get_or_create("LSTATS");
        let (tx, rx) = oneshot::channel();

        rq.push(
            "timed",
            Box::new(move |_ctx| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    tx.send(()).unwrap();
                    Ok(json!(1))
                })
            }),
            None,
            RqOpts::default(),
        );
        rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stats = rqs.stats();
        assert_eq!(stats.queues, 1);
        let timer = &stats.timers["timed"];
        assert_eq!(timer.count, 1);
        assert!(timer.max_ms >= 10);
    }

    #[tokio::test]
    async fn test_drain_all_closes_every_queue() {
        let rqs = directory();
        rqs.get_or_create("LD1");
        rqs.get_or_create("LD2");
        assert_eq!(rqs.len(), 2);

        assert!(rqs.drain_all(Duration::from_secs(1)).await);
        assert!(rqs.is_empty());
    }
}
