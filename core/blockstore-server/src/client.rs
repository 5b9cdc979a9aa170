use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};
use vt_interfaces::types::{HashCode, StoreError};
use vt_interfaces::Store;

use crate::protocol::{Request, Response};
use crate::server::codec;

type Conn = Framed<TcpStream, LengthDelimitedCodec>;

enum Connection {
    /// Ready for the next request.
    Idle(Conn),
    /// A request is on the wire, or was abandoned there. Its response may still arrive, so
    /// the connection cannot be reused.
    Busy,
    Closed,
}

/// A [`Store`] served by a [`StoreServer`](crate::StoreServer) elsewhere.
///
/// Requests are sent one at a time over a single connection. A request whose future is
/// dropped before the response arrived leaves the connection out of step, the next request
/// then goes over a new one.
pub struct RemoteStore {
    name: String,
    address: SocketAddr,
    conn: Mutex<Connection>,
}

async fn dial(address: SocketAddr) -> Result<Conn, StoreError> {
    let socket = TcpStream::connect(address).await?;
    socket.set_nodelay(true)?;
    debug!("Connected to the store server at {address}.");
    Ok(Framed::new(socket, codec()))
}

async fn exchange(framed: &mut Conn, request: Request) -> Result<Bytes, StoreError> {
    framed.send(Bytes::from(request)).await?;
    let frame = framed
        .next()
        .await
        .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))??;
    Ok(frame.freeze())
}

impl RemoteStore {
    pub async fn connect(address: SocketAddr) -> Result<Self, StoreError> {
        let framed = dial(address).await?;
        Ok(Self {
            name: format!("RemoteStore({address})"),
            address,
            conn: Mutex::new(Connection::Idle(framed)),
        })
    }

    async fn request(&self, request: Request) -> Result<Response, StoreError> {
        let mut conn = self.conn.lock().await;
        let mut framed = match std::mem::replace(&mut *conn, Connection::Busy) {
            Connection::Idle(framed) => framed,
            Connection::Busy => {
                warn!(
                    "An earlier request to {} was abandoned, reconnecting.",
                    self.address
                );
                dial(self.address).await?
            },
            Connection::Closed => {
                *conn = Connection::Closed;
                return Err(StoreError::Closed);
            },
        };
        // A transport error leaves the state at `Busy`, the next request reconnects.
        let frame = exchange(&mut framed, request).await?;
        *conn = Connection::Idle(framed);
        drop(conn);

        match Response::try_from(frame) {
            Ok(Response::Error(reason)) => Err(StoreError::Remote(reason)),
            Ok(response) => Ok(response),
            Err(e) => Err(StoreError::Remote(format!("unreadable response: {e}"))),
        }
    }
}

fn unexpected(response: Response) -> StoreError {
    StoreError::Remote(format!("unexpected response {response:?}"))
}

#[async_trait]
impl Store for RemoteStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, data: Bytes) -> Result<HashCode, StoreError> {
        match self.request(Request::Add(data)).await? {
            Response::Hash(hash) => Ok(hash),
            other => Err(unexpected(other)),
        }
    }

    async fn get(&self, hash: &HashCode) -> Result<Bytes, StoreError> {
        match self.request(Request::Get(*hash)).await? {
            Response::Data(data) if hash.matches(&data) => Ok(data),
            Response::Data(_) => Err(StoreError::Remote(format!(
                "the server answered {hash} with data of another hash"
            ))),
            Response::NotFound => Err(StoreError::MissingHash(*hash)),
            other => Err(unexpected(other)),
        }
    }

    async fn contains(&self, hash: &HashCode) -> Result<bool, StoreError> {
        match self.request(Request::Contains(*hash)).await? {
            Response::Contains(found) => Ok(found),
            other => Err(unexpected(other)),
        }
    }

    async fn keys(&self) -> Result<BoxStream<'static, HashCode>, StoreError> {
        Err(StoreError::Unsupported("listing the keys of a remote store"))
    }

    /// Every request is answered before the next one is sent, there is nothing to wait for.
    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        if let Connection::Idle(mut framed) = std::mem::replace(&mut *conn, Connection::Closed) {
            SinkExt::<Bytes>::close(&mut framed).await?;
        }
        Ok(())
    }
}
