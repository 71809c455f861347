use async_channel::{bounded, Receiver, Sender};
use async_std::task::JoinHandle;
use domain_keys::keys::RouteKey;
use hashbrown::HashMap;
use log::*;
use service_uptime::Uptime;

use super::value::Value;
use crate::error::{CacheError, Result};
use crate::kv_handler::{StoreCommand, StoreConnector};
use crate::worker::{JsonString, WorkerState, WorkerStatus, OK};

/// matches a store reply to the Get that caused it
pub type CorrelationId = u64;

#[derive(Debug, Clone)]
pub enum Command {
    Get(String, Sender<Value>),
    Put(String, String),
    SimulateFailure,
    Keys(Sender<Vec<String>>),
    Len(Sender<usize>),
    Status(Sender<JsonString>), // request the worker's status
    Shutdown,
}

/// everything that lands in a cache core's mailbox
#[derive(Debug)]
pub(crate) enum Message {
    Command(Command),
    StoreReply(CorrelationId, Option<String>),
    /// the store connector went away without answering
    StoreAbandoned(CorrelationId),
    Rewire(StoreConnector),
}

#[derive(Debug)]
struct PendingRequest {
    key: String,
    reply_to: Sender<Value>,
}

struct CacheCore {
    id: String,
    uptime: Uptime,
    state: WorkerState,
    error_count: u16,
    cache: HashMap<String, String>,
    pending: HashMap<CorrelationId, PendingRequest>,
    next_correlation: CorrelationId,
    store: StoreConnector,
    // store replies are relayed back through here
    mailbox: Sender<Message>,
}

impl CacheCore {
    fn new(id: String, store: StoreConnector, mailbox: Sender<Message>) -> CacheCore {
        CacheCore {
            id,
            uptime: Uptime::new(),
            state: WorkerState::Idle,
            error_count: 0,
            cache: HashMap::new(),
            pending: HashMap::new(),
            next_correlation: 0,
            store,
            mailbox,
        }
    }

    async fn process(&mut self, msg: Message) -> Result<()> {
        match msg {
            Message::Command(cmd) => self.on_command(cmd).await?,
            Message::StoreReply(correlation, found) => self.on_store_reply(correlation, found),
            Message::StoreAbandoned(correlation) => self.on_store_abandoned(correlation),
            Message::Rewire(store) => {
                info!(
                    "cache {} rewired from store {} to store {}",
                    self.id,
                    self.store.id(),
                    store.id()
                );
                self.store = store;
            }
        }

        Ok(())
    }

    async fn on_command(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::Get(key, tx) => match self.cache.get(&key).cloned() {
                Some(v) => {
                    debug!("cache {} hit for key: {}", self.id, key);
                    self.respond(tx, Value::found(v));
                }
                None => self.dispatch_lookup(key, tx),
            },
            Command::Put(key, value) => {
                // a write the store connector cannot queue would leave the mapping ahead of the store
                let cmd = StoreCommand::Put(key.clone(), value.clone());
                if let Err(e) = self.store.try_send(cmd) {
                    self.state = WorkerState::Broken;
                    error!("cache {} cannot write key: {} through, {}", self.id, key, e);
                    return Err(e);
                }

                info!("cache {} updated: {} = {}", self.id, key, value);
                self.cache.insert(key, value);
            }
            Command::SimulateFailure => {
                self.state = WorkerState::Broken;
                error!("cache {} simulated failure, state: {:?}", self.id, self.state);
                return Err(CacheError::InjectedFailure("cache core".to_string()));
            }
            Command::Keys(tx) => {
                let list: Vec<String> = self.cache.keys().cloned().collect();
                self.respond(tx, list);
            }
            Command::Len(tx) => {
                let sz = self.cache.len();
                self.respond(tx, sz);
            }
            Command::Status(tx) => {
                let state = if self.pending.is_empty() {
                    WorkerState::Idle
                } else {
                    WorkerState::Busy
                };
                let status = WorkerStatus::new(
                    self.id.to_string(),
                    OK.to_string(),
                    state,
                    self.uptime.to_string(),
                    self.error_count,
                );

                let msg = status.to_json();
                info!("status response: {}", msg);
                self.respond(tx, msg);
            }
            Command::Shutdown => {
                self.state = WorkerState::Shutdown;
                info!("cache id: {}, state: {:?}", self.id, self.state);
            }
        }

        Ok(())
    }

    /// send the lookup to the store and return at once; the reply comes back as a message
    fn dispatch_lookup(&mut self, key: String, reply_to: Sender<Value>) {
        let correlation = self.next_correlation;
        self.next_correlation = self.next_correlation.wrapping_add(1);

        let (tx, rx) = bounded(1);
        if let Err(e) = self.store.try_send(StoreCommand::Get(key.clone(), tx)) {
            // dropping reply_to releases the caller
            self.error_count = self.error_count.saturating_add(1);
            warn!("cache {} cannot look up key: {}, {}", self.id, key, e);
            return;
        }

        debug!(
            "cache {} miss for key: {}, lookup {} dispatched to store {}",
            self.id,
            key,
            correlation,
            self.store.id()
        );
        self.pending
            .insert(correlation, PendingRequest { key, reply_to });

        let mailbox = self.mailbox.clone();
        async_std::task::spawn(async move {
            let msg = match rx.recv().await {
                Ok(found) => Message::StoreReply(correlation, found),
                Err(_) => Message::StoreAbandoned(correlation),
            };

            // the cache core may have terminated in the meantime
            let _ = mailbox.send(msg).await;
        });
    }

    fn on_store_reply(&mut self, correlation: CorrelationId, found: Option<String>) {
        let pending = match self.pending.remove(&correlation) {
            Some(p) => p,
            None => {
                warn!("cache {} reply for unknown lookup: {}", self.id, correlation);
                return;
            }
        };

        let value = match found {
            Some(v) => {
                // a Put processed while the lookup was in flight is newer than the store's answer
                if self.cache.contains_key(&pending.key) {
                    debug!("cache {} kept newer value for key: {}", self.id, pending.key);
                } else {
                    info!(
                        "cache {} populated from store: {} = {}",
                        self.id, pending.key, v
                    );
                    self.cache.insert(pending.key.clone(), v.clone());
                }
                Value::found(v)
            }
            None => Value::not_found(),
        };

        self.respond(pending.reply_to, value);
    }

    fn on_store_abandoned(&mut self, correlation: CorrelationId) {
        if let Some(pending) = self.pending.remove(&correlation) {
            self.error_count = self.error_count.saturating_add(1);
            warn!(
                "cache {} lookup {} for key: {} abandoned by store",
                self.id, correlation, pending.key
            );
        }
    }

    // never wait on a caller's channel; a full or closed one only costs that caller its reply
    fn respond<T>(&mut self, tx: Sender<T>, msg: T) {
        if let Err(e) = tx.try_send(msg) {
            self.error_count = self.error_count.saturating_add(1);
            let reason = if e.is_full() { "is full" } else { "has gone" };
            error!("cache {} error sending response, caller {}", self.id, reason);
        }
    }
}

// the handler loop
async fn handler(mut core: CacheCore, rx: Receiver<Message>) -> Result<()> {
    let result = run(&mut core, &rx).await;

    rx.close();

    // nothing queued will be processed now; dropping it releases the callers
    while let Ok(msg) = rx.try_recv() {
        debug!("cache {} dropped: {:?}", core.id, msg);
    }

    result
}

async fn run(core: &mut CacheCore, rx: &Receiver<Message>) -> Result<()> {
    // now read and respond to requests
    while let Ok(msg) = rx.recv().await {
        debug!("cache {} recv: {:?}", core.id, msg);
        core.process(msg).await?;

        if core.state == WorkerState::Shutdown {
            break;
        }
    }

    Ok(())
}

/// The handle to a running cache core.
///
/// Handles go stale when the supervisor restarts the core; resolve a fresh one through
/// the supervisor after a failure.
#[derive(Debug, Clone)]
pub struct CacheHandle {
    id: String,
    request_tx: Sender<Message>,
}

impl CacheHandle {
    /// create and start a new cache core bound to the given store connector.
    pub fn start(store: StoreConnector, capacity: usize) -> (CacheHandle, JoinHandle<Result<()>>) {
        let id = RouteKey::create();
        info!("starting up cache core, id: {}, store: {}", id, store.id());

        let (request_tx, request_receiver) = bounded(capacity);
        let core = CacheCore::new(id.clone(), store, request_tx.clone());

        // run the handler loop as a background task
        let hid = id.clone();
        let join = async_std::task::spawn(async move {
            let result = handler(core, request_receiver).await;
            match &result {
                Ok(()) => info!("cache handler exit for worker id: {}", hid),
                Err(e) => error!("cache handler {} exit with error: {}", hid, e),
            }
            result
        });

        let handle = CacheHandle { id, request_tx };

        (handle, join)
    }

    /// return the worker's id
    pub fn id(&self) -> String {
        self.id.to_string()
    }

    pub fn is_closed(&self) -> bool {
        self.request_tx.is_closed()
    }

    /// fire-and-forget delivery of a command
    pub async fn send(&self, cmd: Command) -> Result<()> {
        self.deliver(Message::Command(cmd)).await
    }

    /// Request/reply against this core. There is no timeout here; callers wrap it in their own.
    pub async fn ask<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(Sender<T>) -> Command,
    {
        let (tx, rx) = bounded(1);
        self.send(build(tx)).await?;
        rx.recv()
            .await
            .map_err(|_| CacheError::Unavailable(format!("cache core {}", self.id)))
    }

    pub async fn get(&self, key: &str) -> Result<Value> {
        self.ask(|tx| Command::Get(key.to_string(), tx)).await
    }

    pub(crate) async fn rewire(&self, store: StoreConnector) -> Result<()> {
        self.deliver(Message::Rewire(store)).await
    }

    async fn deliver(&self, msg: Message) -> Result<()> {
        self.request_tx
            .send(msg)
            .await
            .map_err(|_| CacheError::Unavailable(format!("cache core {}", self.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // a stand-in store connector whose mailbox the test reads directly
    fn probe() -> (StoreConnector, Receiver<StoreCommand>) {
        let (tx, rx) = bounded(10);
        (StoreConnector::from_channel(tx), rx)
    }

    async fn expect_lookup(probe: &Receiver<StoreCommand>, expected: &str) -> Sender<Option<String>> {
        match probe.recv().await {
            Ok(StoreCommand::Get(key, reply)) => {
                assert_eq!(key, expected);
                reply
            }
            other => panic!("expected a store lookup, got: {:?}", other),
        }
    }

    #[test]
    fn status() {
        async_std::task::block_on(async move {
            let (store, _probe) = probe();
            let (cache, _join) = CacheHandle::start(store, 10);
            assert_eq!(cache.id().len(), 16);

            let js = cache.ask(Command::Status).await.expect("should respond");
            println!("{}", js);
            let status: WorkerStatus = serde_json::from_str(&js).expect("should parse status");
            assert_eq!(status.worker_id, cache.id());
            assert_eq!(status.status, OK);
            assert_eq!(status.state, WorkerState::Idle);
            assert_eq!(status.error_count, 0);

            assert!(cache.send(Command::Shutdown).await.is_ok());
        });
    }

    #[test]
    fn put_and_get() {
        async_std::task::block_on(async move {
            let (store, probe) = probe();
            let (cache, _join) = CacheHandle::start(store, 10);

            cache
                .send(Command::Put("key1".to_string(), "value1".to_string()))
                .await
                .expect("put should send");

            // the write goes through to the store
            match probe.recv().await {
                Ok(StoreCommand::Put(k, v)) => {
                    assert_eq!(k, "key1");
                    assert_eq!(v, "value1");
                }
                other => panic!("expected a store write, got: {:?}", other),
            }

            // and is served locally afterwards
            let value = cache.get("key1").await.expect("should respond");
            assert_eq!(value, Value::found("value1"));
            assert!(probe.try_recv().is_err());

            assert_eq!(cache.ask(Command::Len).await, Ok(1));
            assert_eq!(cache.ask(Command::Keys).await, Ok(vec!["key1".to_string()]));
        });
    }

    #[test]
    fn get_non_existent_key() {
        async_std::task::block_on(async move {
            let (store, probe) = probe();
            let (cache, _join) = CacheHandle::start(store, 10);

            let (tx, rx) = bounded(1);
            cache
                .send(Command::Get("nonexistent".to_string(), tx))
                .await
                .expect("get should send");

            let reply = expect_lookup(&probe, "nonexistent").await;
            reply.send(None).await.expect("cache should be listening");

            assert_eq!(rx.recv().await, Ok(Value::not_found()));
            assert_eq!(cache.ask(Command::Len).await, Ok(0));
        });
    }

    #[test]
    fn cache_updated_from_store() {
        async_std::task::block_on(async move {
            let (store, probe) = probe();
            let (cache, _join) = CacheHandle::start(store, 10);

            let (tx, rx) = bounded(1);
            cache
                .send(Command::Get("storeKey".to_string(), tx))
                .await
                .expect("get should send");

            let reply = expect_lookup(&probe, "storeKey").await;
            reply
                .send(Some("storeValue".to_string()))
                .await
                .expect("cache should be listening");
            assert_eq!(rx.recv().await, Ok(Value::found("storeValue")));

            // the second read is a local hit
            let value = cache.get("storeKey").await.expect("should respond");
            assert_eq!(value, Value::found("storeValue"));
            assert!(probe.try_recv().is_err());
        });
    }

    #[test]
    fn stored_empty_value_is_found() {
        async_std::task::block_on(async move {
            let (store, probe) = probe();
            let (cache, _join) = CacheHandle::start(store, 10);

            let (tx, rx) = bounded(1);
            cache
                .send(Command::Get("blank".to_string(), tx))
                .await
                .expect("get should send");

            let reply = expect_lookup(&probe, "blank").await;
            reply
                .send(Some(String::new()))
                .await
                .expect("cache should be listening");

            assert_eq!(rx.recv().await, Ok(Value::found("")));
            assert_eq!(cache.ask(Command::Len).await, Ok(1));
        });
    }

    #[test]
    fn newer_put_survives_inflight_lookup() {
        async_std::task::block_on(async move {
            let (store, probe) = probe();
            let (cache, _join) = CacheHandle::start(store, 10);

            let (tx, rx) = bounded(1);
            cache
                .send(Command::Get("k".to_string(), tx))
                .await
                .expect("get should send");
            cache
                .send(Command::Put("k".to_string(), "new".to_string()))
                .await
                .expect("put should send");

            let reply = expect_lookup(&probe, "k").await;
            assert!(matches!(probe.recv().await, Ok(StoreCommand::Put(_, _))));

            reply
                .send(Some("old".to_string()))
                .await
                .expect("cache should be listening");

            // the lookup answers in its own order, the mapping keeps the later write
            assert_eq!(rx.recv().await, Ok(Value::found("old")));
            assert_eq!(cache.get("k").await, Ok(Value::found("new")));
        });
    }

    #[test]
    fn abandoned_lookup_releases_caller() {
        async_std::task::block_on(async move {
            let (store, probe) = probe();
            let (cache, _join) = CacheHandle::start(store, 10);

            let (tx, rx) = bounded(1);
            cache
                .send(Command::Get("k".to_string(), tx))
                .await
                .expect("get should send");

            let reply = expect_lookup(&probe, "k").await;
            drop(reply);

            assert!(rx.recv().await.is_err());

            let js = cache.ask(Command::Status).await.expect("should respond");
            let status: WorkerStatus = serde_json::from_str(&js).expect("should parse status");
            assert_eq!(status.state, WorkerState::Idle);
            assert_eq!(status.error_count, 1);
        });
    }

    #[test]
    fn pending_lookup_does_not_block_hits() {
        async_std::task::block_on(async move {
            let (store, probe) = probe();
            let (cache, _join) = CacheHandle::start(store, 10);

            cache
                .send(Command::Put("b".to_string(), "2".to_string()))
                .await
                .expect("put should send");

            let (tx, rx) = bounded(1);
            cache
                .send(Command::Get("a".to_string(), tx))
                .await
                .expect("get should send");

            // b is served while a is still waiting on the store
            assert_eq!(cache.get("b").await, Ok(Value::found("2")));
            assert!(rx.try_recv().is_err());

            assert!(matches!(probe.recv().await, Ok(StoreCommand::Put(_, _))));
            let reply = expect_lookup(&probe, "a").await;
            reply
                .send(Some("1".to_string()))
                .await
                .expect("cache should be listening");

            let value = async_std::future::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("should not time out");
            assert_eq!(value, Ok(Value::found("1")));
        });
    }

    #[test]
    fn full_reply_channel_does_not_stall_others() {
        async_std::task::block_on(async move {
            let (store, _probe) = probe();
            let (cache, _join) = CacheHandle::start(store, 10);

            cache
                .send(Command::Put("a".to_string(), "1".to_string()))
                .await
                .expect("put should send");

            // a caller that never reads, sharing one slot between two requests
            let (tx, _unread) = bounded(1);
            for _ in 0..2 {
                cache
                    .send(Command::Get("a".to_string(), tx.clone()))
                    .await
                    .expect("get should send");
            }

            let value = async_std::future::timeout(Duration::from_millis(500), cache.get("a"))
                .await
                .expect("should not time out");
            assert_eq!(value, Ok(Value::found("1")));

            let js = cache.ask(Command::Status).await.expect("should respond");
            let status: WorkerStatus = serde_json::from_str(&js).expect("should parse status");
            assert_eq!(status.error_count, 1);
        });
    }

    #[test]
    fn unqueued_store_write_is_fatal() {
        async_std::task::block_on(async move {
            let (tx, probe) = bounded(1);
            let (cache, join) = CacheHandle::start(StoreConnector::from_channel(tx), 10);

            // the first write fills the store mailbox, the second cannot be queued
            cache
                .send(Command::Put("a".to_string(), "1".to_string()))
                .await
                .expect("put should send");
            cache
                .send(Command::Put("b".to_string(), "2".to_string()))
                .await
                .expect("put should send");

            assert!(matches!(join.await, Err(CacheError::Unavailable(_))));
            assert_eq!(probe.len(), 1);
        });
    }

    #[test]
    fn rewire_to_new_store() {
        async_std::task::block_on(async move {
            let (first, first_probe) = probe();
            let (second, second_probe) = probe();
            let (cache, _join) = CacheHandle::start(first, 10);

            cache.rewire(second).await.expect("rewire should send");

            let (tx, _rx) = bounded(1);
            cache
                .send(Command::Get("k".to_string(), tx))
                .await
                .expect("get should send");

            let _reply = expect_lookup(&second_probe, "k").await;
            assert!(first_probe.try_recv().is_err());
        });
    }

    #[test]
    fn simulate_failure() {
        async_std::task::block_on(async move {
            let (store, _probe) = probe();
            let (cache, join) = CacheHandle::start(store, 10);

            cache
                .send(Command::Put("k".to_string(), "v".to_string()))
                .await
                .expect("put should send");
            cache
                .send(Command::SimulateFailure)
                .await
                .expect("should send");

            assert_eq!(
                join.await,
                Err(CacheError::InjectedFailure("cache core".to_string()))
            );
            assert!(matches!(
                cache.get("k").await,
                Err(CacheError::Unavailable(_))
            ));
        });
    }
}
