/// KeyValue store handler: the store connector worker
///
use async_channel::{bounded, Receiver, Sender, TrySendError};
use async_std::task::JoinHandle;
use domain_keys::keys::RouteKey;
use log::*;
use service_uptime::Uptime;

use crate::error::{CacheError, Result};
use crate::kv_store::{Connector, KeyValueStore};
use crate::worker::{JsonString, WorkerState, WorkerStatus, OK};

#[derive(Debug, Clone)]
pub enum StoreCommand {
    Get(String, Sender<Option<String>>),
    Put(String, String),
    SimulateFailure,
    Status(Sender<JsonString>), // request the worker's status
    Shutdown,
}

/// The store connector's mailbox.
///
/// It outlives any single connector: a restarted connector picks up whatever its
/// predecessor left queued, so only the command being processed at the failure is lost.
#[derive(Debug, Clone)]
pub struct StoreMailbox {
    tx: Sender<StoreCommand>,
    rx: Receiver<StoreCommand>,
}

impl StoreMailbox {
    pub fn new(capacity: usize) -> StoreMailbox {
        let (tx, rx) = bounded(capacity);
        StoreMailbox { tx, rx }
    }

    /// queued commands are still handed out after a close, new ones are refused
    pub fn close(&self) -> bool {
        self.tx.close()
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

// the handler loop; any connection error ends the loop and is returned to the watcher
pub async fn handler<S: KeyValueStore>(
    id: String,
    mut store: S,
    rx: Receiver<StoreCommand>,
) -> Result<()> {
    let uptime = Uptime::new();
    let mut state = WorkerState::Idle;
    let mut error_count: u16 = 0;

    // now read and respond to requests
    while let Ok(cmd) = rx.recv().await {
        debug!("store {} recv cmd: {:?}", id, cmd);
        match cmd {
            StoreCommand::Get(key, tx) => {
                // on error the reply sender is dropped, which abandons the lookup
                let value = match store.get(&key).await {
                    Ok(v) => v,
                    Err(e) => {
                        error!("store {} get failed for key: {}, {}", id, key, e);
                        return Err(e);
                    }
                };

                if tx.try_send(value).is_err() {
                    error_count = error_count.saturating_add(1);
                    warn!("store {} lookup for key: {} has no listener", id, key);
                }
            }
            StoreCommand::Put(key, value) => {
                if let Err(e) = store.set(&key, &value).await {
                    error!("store {} set failed for key: {}, {}", id, key, e);
                    return Err(e);
                }

                info!("store {} updated: {} = {}", id, key, value);
            }
            StoreCommand::SimulateFailure => {
                state = WorkerState::Broken;
                error!("store {} simulated failure, state: {:?}", id, state);
                return Err(CacheError::InjectedFailure("store connector".to_string()));
            }
            StoreCommand::Status(tx) => {
                let status = WorkerStatus::new(
                    id.to_string(),
                    OK.to_string(),
                    state,
                    uptime.to_string(),
                    error_count,
                );

                let msg = status.to_json();
                info!("status response: {}", msg);
                if tx.try_send(msg).is_err() {
                    error_count = error_count.saturating_add(1);
                    error!("error returning status to channel: {:?}", tx);
                }
            }
            StoreCommand::Shutdown => {
                state = WorkerState::Shutdown;
                info!("store id: {}, state: {:?}", id, state);
                break;
            }
        }
    }

    Ok(())
}

/// the handle to a running store connector
#[derive(Debug, Clone)]
pub struct StoreConnector {
    id: String,
    request_tx: Sender<StoreCommand>,
}

impl StoreConnector {
    /// Connect to the backing store, then run the handler loop on the mailbox as a background task.
    ///
    /// A failed connection is returned to the caller rather than spawning a broken worker.
    pub async fn start<C: Connector>(
        connector: &C,
        mailbox: &StoreMailbox,
    ) -> Result<(StoreConnector, JoinHandle<Result<()>>)> {
        let id = RouteKey::create();

        let connection = match connector.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("store connector {} could not connect: {}", id, e);
                return Err(e);
            }
        };
        info!(
            "store connector {} connected to backing store, {} commands queued",
            id,
            mailbox.len()
        );

        let hid = id.clone();
        let request_receiver = mailbox.rx.clone();
        let join = async_std::task::spawn(async move {
            let result = handler(hid.clone(), connection, request_receiver).await;
            match &result {
                Ok(()) => info!("store handler exit for worker id: {}", hid),
                Err(e) => error!("store handler {} exit with error: {}", hid, e),
            }
            result
        });

        let connector = StoreConnector {
            id,
            request_tx: mailbox.tx.clone(),
        };

        Ok((connector, join))
    }

    /// wrap an existing channel; lets tests stand in for the store
    #[cfg(test)]
    pub(crate) fn from_channel(request_tx: Sender<StoreCommand>) -> StoreConnector {
        StoreConnector {
            id: RouteKey::create(),
            request_tx,
        }
    }

    /// return the worker's id
    pub fn id(&self) -> String {
        self.id.to_string()
    }

    pub fn is_closed(&self) -> bool {
        self.request_tx.is_closed()
    }

    /// queue a command without waiting; a full or closed mailbox is reported, never awaited
    pub fn try_send(&self, cmd: StoreCommand) -> Result<()> {
        self.request_tx.try_send(cmd).map_err(|e| match e {
            TrySendError::Full(_) => {
                CacheError::Unavailable(format!("store connector {} (mailbox full)", self.id))
            }
            TrySendError::Closed(_) => CacheError::Unavailable(format!("store connector {}", self.id)),
        })
    }
}
