//! Worker: owns a local executor and serves execution requests from a
//! dispatch server.
//!
//! A worker process opens one connection per execution slot; each
//! connection registers with the announced total capacity and then serves
//! one request at a time. Missing inputs are pulled back over the same
//! connection, outputs are streamed up before the response.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::executor::{ExecutionSlots, FileFetcher, LocalExecutor};
use crate::proto::{ExecutionRequest, Response};
use crate::remote::wire::{Connection, WireMessage};
use crate::store::{self, ChunkWriter, Digest, FileStore};

const RECONNECT_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub server: String,
    pub name: String,
    pub capacity: u32,
    pub store_dir: PathBuf,
    pub temp_dir: PathBuf,
}

/// Runs a worker until the process is stopped, reconnecting with a fixed
/// backoff whenever the server goes away.
pub async fn run(options: WorkerOptions) -> Result<()> {
    let capacity = options.capacity.max(1);
    let executor = Arc::new(LocalExecutor::new(
        FileStore::new(&options.store_dir)?,
        &options.temp_dir,
        Arc::new(ExecutionSlots::new(capacity)),
    )?);
    write_pid_file(&options.name)?;
    info!(
        "worker {} serving {} slots against {}",
        options.name, capacity, options.server
    );

    let mut slots = Vec::new();
    for slot in 0..capacity {
        let server = options.server.clone();
        let name = options.name.clone();
        let executor = executor.clone();
        slots.push(tokio::spawn(async move {
            loop {
                match serve(&server, &name, capacity, &executor).await {
                    Ok(()) => info!("slot {}: server closed the connection", slot),
                    Err(e) => warn!("slot {}: connection failed: {:#}", slot, e),
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }));
    }
    for slot in slots {
        slot.await.context("worker slot task")?;
    }
    Ok(())
}

/// Records this process's pid in a well-known directory under the system
/// temp root, so an external controller can stop spawned children.
pub fn write_pid_file(name: &str) -> Result<()> {
    let dir = std::env::temp_dir().join("gavel-workers");
    store::make_dirs(&dir)?;
    let path = dir.join(format!("{}.pid", name));
    std::fs::write(&path, format!("{}\n", std::process::id()))
        .with_context(|| format!("writing {}", path.display()))?;
    debug!("pid file at {}", path.display());
    Ok(())
}

/// One registered connection serving requests until it drops.
pub(crate) async fn serve(
    server: &str,
    name: &str,
    capacity: u32,
    executor: &LocalExecutor,
) -> Result<()> {
    let stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("connecting to {}", server))?;
    let mut conn = Connection::new(stream);
    conn.send(&WireMessage::WorkerHello {
        name: name.to_string(),
        capacity,
    })
    .await?;
    loop {
        let Some(message) = conn.recv().await? else {
            return Ok(());
        };
        let WireMessage::Work { id, request } = message else {
            bail!("expected work, got {:?}", message);
        };
        debug!("got work {}: {}", id, request.executable);
        let response = run_request(&mut conn, executor, &request).await;
        for output in &response.outputs {
            // Small outputs travel inline in the response.
            if output.contents.is_some() {
                continue;
            }
            if let Some(digest) = output.digest {
                conn.send_file(&digest, &executor.store().path_for(&digest))
                    .await?;
            }
        }
        conn.send(&WireMessage::WorkDone { id, response }).await?;
    }
}

/// Answers worker-side file pulls over the serving connection.
struct ConnectionFetcher<'a> {
    conn: Mutex<&'a mut Connection>,
}

#[async_trait]
impl FileFetcher for ConnectionFetcher<'_> {
    async fn fetch(&self, digest: &Digest, sink: &mut ChunkWriter) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.send(&WireMessage::FileRequest { digest: *digest })
            .await?;
        conn.recv_file(digest, sink).await
    }
}

async fn run_request(
    conn: &mut Connection,
    executor: &LocalExecutor,
    request: &ExecutionRequest,
) -> Response {
    let fetcher = ConnectionFetcher {
        conn: Mutex::new(conn),
    };
    match executor.execute(request, &fetcher).await {
        Ok(response) => response,
        Err(e) => {
            warn!("execution of {} failed: {:#}", request.executable, e);
            Response::internal_error(format!("{:#}", e))
        }
    }
}
