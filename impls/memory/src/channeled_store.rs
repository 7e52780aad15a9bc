// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

//! ChanneledStore: A channel-based wrapper around any remote store.
//!
//! Many frontends share one backend task that owns the real store and its
//! connections. Each request waits for a latency sampled from a distribution
//! before it is applied, so concurrent callers interleave at every round-trip
//! the way they would against a networked store.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use futures::channel::mpsc::UnboundedReceiver;
use futures::channel::mpsc::UnboundedSender;
use futures::channel::mpsc::unbounded;
use futures::channel::oneshot;
use futures::stream::StreamExt;
use rand::distributions::Distribution;
use spike_api::Connection;
use spike_api::ExecOutcome;
use spike_api::HolderId;
use spike_api::KeyValueStore;
use spike_api::LeaseGrant;
use spike_api::LeaseStore;
use spike_api::QueuedOp;
use spike_api::StoreError;
use spike_api::StoreResult;
use spike_api::environment::Environment;

type ConnectionId = u64;
type ReplyTx<T> = oneshot::Sender<StoreResult<T>>;

/// Commands issued on a dedicated connection.
#[derive(Debug)]
enum ConnectionCommand {
    Watch(String, ReplyTx<()>),
    Unwatch(ReplyTx<()>),
    Get(String, ReplyTx<Option<String>>),
    Multi(ReplyTx<()>),
    Queue(QueuedOp, ReplyTx<()>),
    Exec(ReplyTx<ExecOutcome>),
    Discard(ReplyTx<()>),
}

/// Messages sent to the store backend
#[derive(Debug)]
enum Message {
    Get {
        key: String,
        response_tx: ReplyTx<Option<String>>,
    },
    Set {
        key: String,
        value: String,
        response_tx: ReplyTx<()>,
    },
    Connect {
        response_tx: ReplyTx<ConnectionId>,
    },
    OnConnection {
        id: ConnectionId,
        command: ConnectionCommand,
    },
    Close {
        id: ConnectionId,
    },
    TryAcquire {
        name: String,
        holder: HolderId,
        lease: Duration,
        response_tx: ReplyTx<LeaseGrant>,
    },
    Renew {
        name: String,
        holder: HolderId,
        lease: Duration,
        response_tx: ReplyTx<bool>,
    },
    Release {
        name: String,
        holder: HolderId,
        response_tx: ReplyTx<bool>,
    },
}

fn channel_closed() -> StoreError {
    StoreError::Unavailable("channel closed".to_string())
}

async fn call<T>(
    tx: &UnboundedSender<Message>,
    make: impl FnOnce(ReplyTx<T>) -> Message,
    on_dropped: fn() -> StoreError,
) -> StoreResult<T> {
    let (response_tx, response_rx) = oneshot::channel();
    tx.unbounded_send(make(response_tx))
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
    response_rx.await.unwrap_or_else(|_| Err(on_dropped()))
}

/// ChanneledStore - frontend handle for a shared store backend.
///
/// This is a lightweight handle that can be cloned. All actual state is owned
/// by the `ChanneledStoreBackend`, which runs as an async task.
#[derive(Clone)]
pub struct ChanneledStore {
    tx: UnboundedSender<Message>,
}

/// ChanneledStoreBackend - background worker that owns the wrapped store.
pub struct ChanneledStoreBackend<S: KeyValueStore, D, E> {
    rx: UnboundedReceiver<Message>,
    store: S,
    connections: HashMap<ConnectionId, S::Connection>,
    next_connection: ConnectionId,
    latency_distribution: D,
    env: Rc<E>,
}

impl ChanneledStore {
    /// Create a new ChanneledStore frontend/backend pair.
    ///
    /// Returns a tuple of (frontend, backend). The backend must be spawned
    /// as an async task (e.g., `env.spawn(backend.run())`).
    pub fn new<S, D, E>(
        store: S,
        latency_distribution: D,
        env: Rc<E>,
    ) -> (Self, ChanneledStoreBackend<S, D, E>)
    where
        S: KeyValueStore + LeaseStore,
        D: Distribution<u64>,
        E: Environment,
    {
        let (tx, rx) = unbounded();
        let frontend = Self { tx };
        let backend = ChanneledStoreBackend {
            rx,
            store,
            connections: HashMap::new(),
            next_connection: 0,
            latency_distribution,
            env,
        };
        (frontend, backend)
    }
}

impl KeyValueStore for ChanneledStore {
    type Connection = ChanneledConnection;

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let key = key.to_string();
        let make = |response_tx| Message::Get { key, response_tx };
        call(&self.tx, make, channel_closed).await
    }

    async fn set(&self, key: &str, value: String) -> StoreResult<()> {
        let key = key.to_string();
        let make = |response_tx| Message::Set {
            key,
            value,
            response_tx,
        };
        call(&self.tx, make, channel_closed).await
    }

    async fn connect(&self) -> StoreResult<ChanneledConnection> {
        let make = |response_tx| Message::Connect { response_tx };
        let id = call(&self.tx, make, channel_closed).await?;
        Ok(ChanneledConnection {
            id,
            tx: self.tx.clone(),
        })
    }
}

impl LeaseStore for ChanneledStore {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &HolderId,
        lease: Duration,
    ) -> StoreResult<LeaseGrant> {
        let (name, holder) = (name.to_string(), holder.clone());
        let make = |response_tx| Message::TryAcquire {
            name,
            holder,
            lease,
            response_tx,
        };
        call(&self.tx, make, channel_closed).await
    }

    async fn renew(&self, name: &str, holder: &HolderId, lease: Duration) -> StoreResult<bool> {
        let (name, holder) = (name.to_string(), holder.clone());
        let make = |response_tx| Message::Renew {
            name,
            holder,
            lease,
            response_tx,
        };
        call(&self.tx, make, channel_closed).await
    }

    async fn release(&self, name: &str, holder: &HolderId) -> StoreResult<bool> {
        let (name, holder) = (name.to_string(), holder.clone());
        let make = |response_tx| Message::Release {
            name,
            holder,
            response_tx,
        };
        call(&self.tx, make, channel_closed).await
    }
}

/// Frontend side of a backend-owned connection. Dropping it closes the
/// backend connection.
pub struct ChanneledConnection {
    id: ConnectionId,
    tx: UnboundedSender<Message>,
}

impl ChanneledConnection {
    async fn command<T>(
        &self,
        make: impl FnOnce(ReplyTx<T>) -> ConnectionCommand,
    ) -> StoreResult<T> {
        let id = self.id;
        let wrap = |response_tx| Message::OnConnection {
            id,
            command: make(response_tx),
        };
        call(&self.tx, wrap, || StoreError::ConnectionClosed).await
    }
}

impl Drop for ChanneledConnection {
    fn drop(&mut self) {
        let _ = self.tx.unbounded_send(Message::Close { id: self.id });
    }
}

impl Connection for ChanneledConnection {
    async fn watch(&mut self, key: &str) -> StoreResult<()> {
        let key = key.to_string();
        self.command(|tx| ConnectionCommand::Watch(key, tx)).await
    }

    async fn unwatch(&mut self) -> StoreResult<()> {
        self.command(ConnectionCommand::Unwatch).await
    }

    async fn get(&mut self, key: &str) -> StoreResult<Option<String>> {
        let key = key.to_string();
        self.command(|tx| ConnectionCommand::Get(key, tx)).await
    }

    async fn multi(&mut self) -> StoreResult<()> {
        self.command(ConnectionCommand::Multi).await
    }

    async fn queue(&mut self, op: QueuedOp) -> StoreResult<()> {
        self.command(|tx| ConnectionCommand::Queue(op, tx)).await
    }

    async fn exec(&mut self) -> StoreResult<ExecOutcome> {
        self.command(ConnectionCommand::Exec).await
    }

    async fn discard(&mut self) -> StoreResult<()> {
        self.command(ConnectionCommand::Discard).await
    }
}

impl<S, D, E> ChanneledStoreBackend<S, D, E>
where
    S: KeyValueStore + LeaseStore,
    D: Distribution<u64>,
    E: Environment,
{
    /// Run the background worker loop.
    ///
    /// Requests are applied one at a time in arrival order. This method
    /// consumes self and runs until every frontend is dropped.
    pub async fn run(mut self) {
        while let Some(message) = self.rx.next().await {
            if !matches!(message, Message::Close { .. }) {
                self.inject_latency().await;
            }
            self.handle(message).await;
        }
        tracing::debug!("ChanneledStoreBackend: channel closed, shutting down");
    }

    async fn inject_latency(&self) {
        let latency_ms = self
            .env
            .with_rng(|rng| self.latency_distribution.sample(rng));
        if latency_ms > 0 {
            self.env.sleep(Duration::from_millis(latency_ms)).await;
        }
    }

    async fn handle(&mut self, message: Message) {
        match message {
            Message::Get { key, response_tx } => {
                let _ = response_tx.send(self.store.get(&key).await);
            }
            Message::Set {
                key,
                value,
                response_tx,
            } => {
                let _ = response_tx.send(self.store.set(&key, value).await);
            }
            Message::Connect { response_tx } => {
                let result = self.store.connect().await.map(|connection| {
                    self.next_connection += 1;
                    self.connections.insert(self.next_connection, connection);
                    self.next_connection
                });
                let _ = response_tx.send(result);
            }
            Message::OnConnection { id, command } => {
                self.handle_command(id, command).await;
            }
            Message::Close { id } => {
                self.connections.remove(&id);
            }
            Message::TryAcquire {
                name,
                holder,
                lease,
                response_tx,
            } => {
                let result = self.store.try_acquire(&name, &holder, lease).await;
                let _ = response_tx.send(result);
            }
            Message::Renew {
                name,
                holder,
                lease,
                response_tx,
            } => {
                let result = self.store.renew(&name, &holder, lease).await;
                let _ = response_tx.send(result);
            }
            Message::Release {
                name,
                holder,
                response_tx,
            } => {
                let result = self.store.release(&name, &holder).await;
                let _ = response_tx.send(result);
            }
        }
    }

    async fn handle_command(&mut self, id: ConnectionId, command: ConnectionCommand) {
        let Some(connection) = self.connections.get_mut(&id) else {
            // Dropping the reply channel reports ConnectionClosed.
            tracing::debug!(connection = id, "Command on closed connection");
            return;
        };
        match command {
            ConnectionCommand::Watch(key, tx) => {
                let _ = tx.send(connection.watch(&key).await);
            }
            ConnectionCommand::Unwatch(tx) => {
                let _ = tx.send(connection.unwatch().await);
            }
            ConnectionCommand::Get(key, tx) => {
                let _ = tx.send(connection.get(&key).await);
            }
            ConnectionCommand::Multi(tx) => {
                let _ = tx.send(connection.multi().await);
            }
            ConnectionCommand::Queue(op, tx) => {
                let _ = tx.send(connection.queue(op).await);
            }
            ConnectionCommand::Exec(tx) => {
                let _ = tx.send(connection.exec().await);
            }
            ConnectionCommand::Discard(tx) => {
                let _ = tx.send(connection.discard().await);
            }
        }
    }
}
