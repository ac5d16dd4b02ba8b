//! Client session against a dispatch server.
//!
//! Submits execution requests, answers the server's pulls for input
//! artifacts out of the local store, and collects the session's event
//! stream into an [`EventQueue`].

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::TcpStream;
use tracing::debug;

use crate::events::{Event, EventQueue};
use crate::proto::{ExecutionRequest, Response};
use crate::remote::wire::{Connection, WireMessage};
use crate::store::{self, Digest, FileStore};

pub struct Client {
    conn: Connection,
    store: FileStore,
    events: Arc<EventQueue>,
    next_id: u64,
}

impl Client {
    pub async fn connect(server: &str, name: &str, store: FileStore) -> Result<Self> {
        let stream = TcpStream::connect(server)
            .await
            .with_context(|| format!("connecting to {}", server))?;
        let mut conn = Connection::new(stream);
        conn.send(&WireMessage::ClientHello {
            name: name.to_string(),
        })
        .await?;
        Ok(Self {
            conn,
            store,
            events: Arc::new(EventQueue::new()),
            next_id: 0,
        })
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// Session events received while driving the connection.
    pub fn events(&self) -> &Arc<EventQueue> {
        &self.events
    }

    /// Submits a request and waits for its response, serving input pulls
    /// and collecting events in the meantime.
    pub async fn execute(&mut self, request: ExecutionRequest) -> Result<Response> {
        self.next_id += 1;
        let id = self.next_id;
        self.conn
            .send(&WireMessage::Execute { id, request })
            .await?;
        loop {
            match self.conn.recv().await? {
                Some(WireMessage::ExecuteDone { id: done, response }) if done == id => {
                    return Ok(response);
                }
                Some(WireMessage::FileRequest { digest }) => self.serve_file(digest).await?,
                Some(WireMessage::Event { event }) => self.events.enqueue(event),
                Some(other) => bail!("unexpected frame: {:?}", other),
                None => bail!("server closed the connection"),
            }
        }
    }

    /// Pulls an artifact (typically an execution output) from the server
    /// into the local store.
    pub async fn fetch(&mut self, digest: &Digest) -> Result<()> {
        if self.store.contains(digest) {
            return Ok(());
        }
        self.conn
            .send(&WireMessage::FileRequest { digest: *digest })
            .await?;
        let mut sink = store::write(&self.store.path_for(digest), false, true)?;
        loop {
            match self.conn.recv().await? {
                Some(WireMessage::FileChunk { digest: d, data }) if d == *digest => {
                    let done = data.is_empty();
                    sink.push(&data)?;
                    if done {
                        sink.finish()?;
                        return Ok(());
                    }
                }
                Some(WireMessage::FileNotFound { digest: d }) if d == *digest => {
                    bail!("server does not have artifact {}", d)
                }
                Some(WireMessage::Event { event }) => self.events.enqueue(event),
                Some(other) => bail!("unexpected frame during fetch: {:?}", other),
                None => bail!("server closed the connection"),
            }
        }
    }

    /// Waits for the next session event, serving file pulls in the
    /// meantime.
    pub async fn recv_event(&mut self) -> Result<Event> {
        loop {
            match self.conn.recv().await? {
                Some(WireMessage::Event { event }) => return Ok(event),
                Some(WireMessage::FileRequest { digest }) => self.serve_file(digest).await?,
                Some(other) => bail!("unexpected frame: {:?}", other),
                None => bail!("server closed the connection"),
            }
        }
    }

    async fn serve_file(&mut self, digest: Digest) -> Result<()> {
        let path = self.store.path_for(&digest);
        if store::size(&path).is_some() {
            debug!("serving {} to the server", digest);
            self.conn.send_file(&digest, &path).await
        } else {
            self.conn
                .send(&WireMessage::FileNotFound { digest })
                .await
        }
    }
}
