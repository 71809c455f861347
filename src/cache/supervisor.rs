use async_channel::{bounded, Receiver, Sender};
use async_std::task::JoinHandle;
use domain_keys::keys::RouteKey;
use log::*;
use serde::{Deserialize, Serialize};
use service_uptime::Uptime;
use std::fmt;
use std::time::Duration;

use super::value::{validate_key, Value};
use super::worker::{CacheHandle, Command};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::kv_handler::{StoreCommand, StoreConnector, StoreMailbox};
use crate::kv_store::Connector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Child {
    StoreConnector,
    CacheCore,
}

impl fmt::Display for Child {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Child::StoreConnector => write!(f, "store connector"),
            Child::CacheCore => write!(f, "cache core"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisorState {
    Starting,
    Running,
    Restarting(Child),
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub supervisor_id: String,
    pub state: SupervisorState,
    pub store_id: String,
    pub cache_id: String,
    pub store_restarts: u32,
    pub cache_restarts: u32,
    pub uptime: String,
}

#[derive(Debug)]
enum Message {
    ForwardToCache(Command),
    GetCacheActorRef(Sender<CacheHandle>),
    SimulateStoreFailure,
    Status(Sender<SupervisorStatus>),
    Shutdown(Sender<()>),
    ChildExited {
        child: Child,
        generation: u64,
        result: Result<()>,
    },
    Restart(Child),
}

// report the child's exit to the supervisor mailbox once its task ends
fn watch(mailbox: Sender<Message>, child: Child, generation: u64, join: JoinHandle<Result<()>>) {
    async_std::task::spawn(async move {
        let result = join.await;
        let _ = mailbox
            .send(Message::ChildExited {
                child,
                generation,
                result,
            })
            .await;
    });
}

// deliver a message to the supervisor later without blocking its loop
fn schedule(mailbox: Sender<Message>, delay: Duration, msg: Message) {
    async_std::task::spawn(async move {
        if !delay.is_zero() {
            async_std::task::sleep(delay).await;
        }
        let _ = mailbox.send(msg).await;
    });
}

struct SupervisorCore<C: Connector> {
    id: String,
    uptime: Uptime,
    config: Config,
    connector: C,
    store_down: bool,
    cache_down: bool,
    terminated: bool,
    store: StoreConnector,
    // shared by every store connector generation
    store_mailbox: StoreMailbox,
    store_generation: u64,
    store_restarts: u32,
    cache: CacheHandle,
    cache_generation: u64,
    cache_restarts: u32,
    mailbox: Sender<Message>,
}

impl<C: Connector> SupervisorCore<C> {
    fn state(&self) -> SupervisorState {
        if self.terminated {
            SupervisorState::Terminated
        } else if self.store_down {
            SupervisorState::Restarting(Child::StoreConnector)
        } else if self.cache_down {
            SupervisorState::Restarting(Child::CacheCore)
        } else {
            SupervisorState::Running
        }
    }

    fn is_down(&self, child: Child) -> bool {
        match child {
            Child::StoreConnector => self.store_down,
            Child::CacheCore => self.cache_down,
        }
    }

    fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            supervisor_id: self.id.to_string(),
            state: self.state(),
            store_id: self.store.id(),
            cache_id: self.cache.id(),
            store_restarts: self.store_restarts,
            cache_restarts: self.cache_restarts,
            uptime: self.uptime.to_string(),
        }
    }

    async fn on_child_exited(&mut self, child: Child, generation: u64, result: Result<()>) -> Result<()> {
        let current = match child {
            Child::StoreConnector => self.store_generation,
            Child::CacheCore => self.cache_generation,
        };
        if generation != current {
            debug!("supervisor {} ignoring exit of stale {} #{}", self.id, child, generation);
            return Ok(());
        }

        match result {
            Ok(()) => warn!("supervisor {}: {} #{} stopped", self.id, child, generation),
            Err(e) => error!("supervisor {}: {} #{} failed: {}", self.id, child, generation, e),
        }

        let restarts = match child {
            Child::StoreConnector => self.store_restarts,
            Child::CacheCore => self.cache_restarts,
        };
        if !self.config.restart.allows(restarts) {
            error!("supervisor {}: {} restarted {} times, giving up", self.id, child, restarts);
            return Err(CacheError::RestartLimitExceeded(child.to_string()));
        }

        match child {
            Child::StoreConnector => self.store_down = true,
            Child::CacheCore => self.cache_down = true,
        }
        info!("supervisor {} state: {:?}", self.id, self.state());

        let backoff = self.config.restart.backoff();
        if backoff.is_zero() {
            self.restart(child).await;
        } else {
            schedule(self.mailbox.clone(), backoff, Message::Restart(child));
        }

        Ok(())
    }

    async fn restart(&mut self, child: Child) {
        match child {
            Child::StoreConnector => self.restart_store().await,
            Child::CacheCore => self.restart_cache(),
        }
    }

    async fn restart_store(&mut self) {
        let (store, join) = match StoreConnector::start(&self.connector, &self.store_mailbox).await {
            Ok(started) => started,
            Err(e) => {
                // stay down and keep serving the mailbox until the store is back
                let interval = self.config.restart.reconnect_interval();
                warn!(
                    "supervisor {}: store reconnect failed, retry in {:?}: {}",
                    self.id, interval, e
                );
                schedule(self.mailbox.clone(), interval, Message::Restart(Child::StoreConnector));
                return;
            }
        };

        self.store_generation += 1;
        self.store_restarts += 1;
        watch(self.mailbox.clone(), Child::StoreConnector, self.store_generation, join);

        // a dead cache core is restarted by its own exit report, bound to this store
        if let Err(e) = self.cache.rewire(store.clone()).await {
            warn!("supervisor {}: could not rewire cache: {}", self.id, e);
        }

        info!(
            "supervisor {}: store connector restarted as {} (#{})",
            self.id,
            store.id(),
            self.store_generation
        );
        self.store = store;
        self.store_down = false;
    }

    fn restart_cache(&mut self) {
        let (cache, join) = CacheHandle::start(self.store.clone(), self.config.channel_capacity);

        self.cache_generation += 1;
        self.cache_restarts += 1;
        watch(self.mailbox.clone(), Child::CacheCore, self.cache_generation, join);

        info!(
            "supervisor {}: cache core restarted as {} (#{}), bound to store {}",
            self.id,
            cache.id(),
            self.cache_generation,
            self.store.id()
        );
        self.cache = cache;
        self.cache_down = false;
    }

    async fn shutdown(&mut self) {
        self.terminated = true;

        // bump generations so the exits we are about to cause are ignored
        self.cache_generation += 1;
        self.store_generation += 1;

        if let Err(e) = self.cache.send(Command::Shutdown).await {
            debug!("supervisor {}: cache already stopped: {}", self.id, e);
        }
        // queued writes are still handed to the connector ahead of the shutdown
        if let Err(e) = self.store.try_send(StoreCommand::Shutdown) {
            debug!("supervisor {}: store shutdown not queued: {}", self.id, e);
        }
        self.store_mailbox.close();

        info!("supervisor {} state: {:?}", self.id, self.state());
    }
}

// the supervisor loop
async fn handler<C: Connector>(mut core: SupervisorCore<C>, rx: Receiver<Message>) -> Result<()> {
    info!("supervisor {} state: {:?}", core.id, core.state());

    let mut outcome = Ok(());
    while let Ok(msg) = rx.recv().await {
        debug!("supervisor {} recv: {:?}", core.id, msg);
        match msg {
            Message::ForwardToCache(cmd) => {
                // resolved now, never cached across a restart
                if let Err(e) = core.cache.send(cmd).await {
                    warn!("supervisor {}: command dropped: {}", core.id, e);
                }
            }
            Message::GetCacheActorRef(tx) => {
                if tx.try_send(core.cache.clone()).is_err() {
                    warn!("supervisor {}: cache handle requester has gone", core.id);
                }
            }
            Message::SimulateStoreFailure => {
                if let Err(e) = core.store.try_send(StoreCommand::SimulateFailure) {
                    warn!("supervisor {}: store failure not delivered: {}", core.id, e);
                }
            }
            Message::Status(tx) => {
                if tx.try_send(core.status()).is_err() {
                    warn!("supervisor {}: status requester has gone", core.id);
                }
            }
            Message::Shutdown(ack) => {
                core.shutdown().await;
                rx.close();
                let _ = ack.try_send(());
                break;
            }
            Message::ChildExited {
                child,
                generation,
                result,
            } => {
                if let Err(e) = core.on_child_exited(child, generation, result).await {
                    core.shutdown().await;
                    outcome = Err(e);
                    break;
                }
            }
            Message::Restart(child) => {
                if core.is_down(child) {
                    core.restart(child).await;
                }
            }
        }
    }

    rx.close();

    // dropping what is still queued releases any waiting callers
    while let Ok(msg) = rx.try_recv() {
        debug!("supervisor {} dropped: {:?}", core.id, msg);
    }

    outcome
}

/// The gateway-facing handle to the supervisor.
///
/// Every operation goes through the supervisor's mailbox, so the live cache core is
/// resolved at dispatch time.
#[derive(Debug, Clone)]
pub struct Supervisor {
    id: String,
    request_timeout: Duration,
    request_tx: Sender<Message>,
}

impl Supervisor {
    /// Connect the store connector, then start a cache core bound to it.
    ///
    /// Failing to reach the backing store here is fatal and returned to the caller.
    pub async fn start<C: Connector>(config: Config, connector: C) -> Result<Supervisor> {
        config.validate()?;
        config
            .init_logging()
            .map_err(|e| CacheError::Config(e.to_string()))?;

        let id = RouteKey::create();
        info!("supervisor {} state: {:?}", id, SupervisorState::Starting);

        let capacity = config.channel_capacity;
        let store_mailbox = StoreMailbox::new(capacity);
        let (store, store_join) = StoreConnector::start(&connector, &store_mailbox).await?;
        let (cache, cache_join) = CacheHandle::start(store.clone(), capacity);

        let (request_tx, request_receiver) = bounded(capacity);
        watch(request_tx.clone(), Child::StoreConnector, 0, store_join);
        watch(request_tx.clone(), Child::CacheCore, 0, cache_join);

        let request_timeout = config.request_timeout();
        let core = SupervisorCore {
            id: id.clone(),
            uptime: Uptime::new(),
            config,
            connector,
            store_down: false,
            cache_down: false,
            terminated: false,
            store,
            store_mailbox,
            store_generation: 0,
            store_restarts: 0,
            cache,
            cache_generation: 0,
            cache_restarts: 0,
            mailbox: request_tx.clone(),
        };

        let hid = id.clone();
        async_std::task::spawn(async move {
            match handler(core, request_receiver).await {
                Ok(()) => info!("supervisor handler exit for id: {}", hid),
                Err(e) => error!("supervisor {} terminated: {}", hid, e),
            }
        });

        Ok(Supervisor {
            id,
            request_timeout,
            request_tx,
        })
    }

    pub fn id(&self) -> String {
        self.id.to_string()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// fire-and-forget routing of a command to the live cache core
    pub async fn forward(&self, cmd: Command) -> Result<()> {
        self.deliver(Message::ForwardToCache(cmd)).await
    }

    /// request/reply through the supervisor, bounded by the request timeout
    pub async fn ask<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(Sender<T>) -> Command,
    {
        let (tx, rx) = bounded(1);
        self.forward(build(tx)).await?;
        self.with_timeout(async move {
            rx.recv()
                .await
                .map_err(|_| CacheError::Unavailable("cache core".to_string()))
        })
        .await
    }

    /// return the currently live cache core
    pub async fn cache_handle(&self) -> Result<CacheHandle> {
        let (tx, rx) = bounded(1);
        self.deliver(Message::GetCacheActorRef(tx)).await?;
        self.with_timeout(async move {
            rx.recv()
                .await
                .map_err(|_| CacheError::Unavailable(format!("supervisor {}", self.id)))
        })
        .await
    }

    /// Resolve the live cache core, then ask it directly; the whole exchange shares one timeout.
    pub async fn get(&self, key: &str) -> Result<Value> {
        validate_key(key)?;

        self.with_timeout(async move {
            let cache = self.cache_handle().await?;
            cache.get(key).await
        })
        .await
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        self.forward(Command::Put(key.to_string(), value.to_string()))
            .await
    }

    pub async fn simulate_failure(&self) -> Result<()> {
        self.forward(Command::SimulateFailure).await
    }

    pub async fn simulate_store_failure(&self) -> Result<()> {
        self.deliver(Message::SimulateStoreFailure).await
    }

    pub async fn len(&self) -> Result<usize> {
        self.ask(Command::Len).await
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        self.ask(Command::Keys).await
    }

    pub async fn status(&self) -> Result<SupervisorStatus> {
        let (tx, rx) = bounded(1);
        self.deliver(Message::Status(tx)).await?;
        self.with_timeout(async move {
            rx.recv()
                .await
                .map_err(|_| CacheError::Unavailable(format!("supervisor {}", self.id)))
        })
        .await
    }

    /// stop the cache core and the store connector, then the supervisor itself
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = bounded(1);
        self.deliver(Message::Shutdown(tx)).await?;
        self.with_timeout(async move {
            rx.recv()
                .await
                .map_err(|_| CacheError::Unavailable(format!("supervisor {}", self.id)))
        })
        .await
    }

    pub fn is_closed(&self) -> bool {
        self.request_tx.is_closed()
    }

    async fn deliver(&self, msg: Message) -> Result<()> {
        self.request_tx
            .send(msg)
            .await
            .map_err(|_| CacheError::Unavailable(format!("supervisor {}", self.id)))
    }

    async fn with_timeout<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        match async_std::future::timeout(self.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::RequestTimeout(self.request_timeout)),
        }
    }
}
