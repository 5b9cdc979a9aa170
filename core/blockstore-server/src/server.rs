use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};
use vt_interfaces::types::StoreError;
use vt_interfaces::{ConfigConsumer, ConfigProviderInterface, Store};

use crate::config::Config;
use crate::protocol::{Request, Response, MAX_FRAME_LEN};

pub(crate) fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Serves a [`Store`] over TCP.
pub struct StoreServer {
    config: Config,
    store: Arc<dyn Store>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConfigConsumer for StoreServer {
    const KEY: &'static str = "blockstore-server";

    type Config = Config;
}

impl StoreServer {
    pub fn new(config: Config, store: Arc<dyn Store>) -> Self {
        Self {
            config,
            store,
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn init<P: ConfigProviderInterface>(provider: &P, store: Arc<dyn Store>) -> Self {
        Self::new(provider.get::<Self>(), store)
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.lock().is_some()
    }

    /// Bind the listener and start serving. Returns the bound address, which differs from the
    /// configured one when that asks for port 0.
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(self.config.address)
            .await
            .with_context(|| format!("Failed to bind to {}", self.config.address))?;
        let address = listener.local_addr()?;

        let mut shutdown_entry = self.shutdown_tx.lock();
        if shutdown_entry.is_some() {
            anyhow::bail!("The server is already running");
        }
        let (tx, rx) = mpsc::channel(1);
        *shutdown_entry = Some(tx);
        drop(shutdown_entry);

        let store = self.store.clone();
        let permits = Arc::new(Semaphore::new(self.config.max_conc_res));
        let task = tokio::spawn(accept_loop(listener, store, permits, rx));
        *self.task.lock() = Some(task);
        info!("Serving {} on {address}.", self.store.name());
        Ok(address)
    }

    /// Stop accepting connections. Connections already open are served until the peer hangs
    /// up.
    pub async fn shutdown(&self) {
        let Some(sender) = self.shutdown_tx.lock().take() else {
            return;
        };
        let _ = sender.send(()).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Store server task failed: {e}");
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    store: Arc<dyn Store>,
    permits: Arc<Semaphore>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    loop {
        select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept a connection: {e}");
                        continue;
                    },
                };
                let Ok(permit) = permits.clone().try_acquire_owned() else {
                    warn!("Too many connections, turning {peer} away.");
                    tokio::spawn(reject(socket));
                    continue;
                };
                let store = store.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(store, socket).await {
                        error!("Error handling the connection from {peer}: {e:?}");
                    }
                    drop(permit);
                });
            },
            _ = shutdown_rx.recv() => break,
        }
    }
    debug!("Store server stopped accepting connections.");
}

async fn reject(socket: TcpStream) {
    let mut framed = Framed::new(socket, codec());
    let busy = Response::Error("too many connections".into());
    if let Err(e) = framed.send(Bytes::from(busy)).await {
        debug!("Failed to turn a connection away: {e}");
    }
}

async fn handle_connection(store: Arc<dyn Store>, socket: TcpStream) -> Result<()> {
    let mut framed = Framed::new(socket, codec());
    while let Some(frame) = framed.next().await {
        let response = match Request::try_from(frame?.freeze()) {
            Ok(request) => handle_request(store.as_ref(), request).await,
            Err(e) => Response::Error(format!("bad request: {e}")),
        };
        framed.send(Bytes::from(response)).await?;
    }
    Ok(())
}

async fn handle_request(store: &dyn Store, request: Request) -> Response {
    let result = match request {
        Request::Add(data) => store.add(data).await.map(Response::Hash),
        Request::Get(hash) => match store.get(&hash).await {
            Err(StoreError::MissingHash(_)) => Ok(Response::NotFound),
            result => result.map(Response::Data),
        },
        Request::Contains(hash) => store.contains(&hash).await.map(Response::Contains),
    };
    result.unwrap_or_else(|e| Response::Error(e.to_string()))
}
