//! Dispatch rendezvous.
//!
//! Accepts long-lived connections from workers (one per execution slot)
//! and from clients, matches pending requests to idle slots in arrival
//! order, relays missing artifacts between the two sides through its own
//! store, and multiplexes per-session progress events back to each client.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::events::{Event, EventQueue};
use crate::executor::cache::ExecutionCache;
use crate::proto::{ExecutionRequest, ExitStatus, Response};
use crate::remote::wire::{Connection, WireMessage};
use crate::store::{self, ChunkWriter, Digest, FileStore};

/// One initial dispatch plus one re-dispatch on worker loss; after that
/// the request fails with `INTERNAL_ERROR`.
const MAX_DISPATCH_ATTEMPTS: u32 = 2;

pub struct DispatchServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

struct Shared {
    store: FileStore,
    /// Responses of past executions, consulted before scheduling so a hit
    /// never occupies a worker.
    cache: ExecutionCache,
    sched: Mutex<Sched>,
}

#[derive(Default)]
struct Sched {
    next_seq: u64,
    pending: VecDeque<Pending>,
    workers: HashMap<String, WorkerState>,
    idle: Vec<Slot>,
}

struct WorkerState {
    capacity: u32,
    busy: u32,
    /// An exclusive request is running; the worker's other slots are
    /// parked until it finishes.
    exclusive_active: bool,
}

struct Slot {
    worker: String,
    assign: mpsc::Sender<Pending>,
}

struct Pending {
    seq: u64,
    id: u64,
    request: ExecutionRequest,
    cache_key: Digest,
    attempts: u32,
    /// Worker that already failed this request; avoided when others exist.
    exclude: Option<String>,
    session: Session,
}

#[derive(Clone)]
struct Session {
    name: String,
    commands: mpsc::Sender<SessionCommand>,
    events: Arc<EventQueue>,
}

enum SessionCommand {
    Deliver { id: u64, response: Response },
    /// Pull an artifact from the client into the server store; answers
    /// whether it is available afterwards.
    Pull {
        digest: Digest,
        done: oneshot::Sender<bool>,
    },
}

impl DispatchServer {
    pub async fn bind(addr: &str, store: FileStore) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {}", addr))?;
        let cache = ExecutionCache::open(&store);
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                store,
                cache,
                sched: Mutex::new(Sched::default()),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("local_addr")
    }

    pub async fn run(self) -> Result<()> {
        info!("server listening on {}", self.listener.local_addr()?);
        loop {
            let (stream, peer) = self.listener.accept().await.context("accept")?;
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, shared).await {
                    debug!("connection from {} ended: {:#}", peer, e);
                }
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, shared: Arc<Shared>) -> Result<()> {
    let mut conn = Connection::new(stream);
    match conn.recv().await? {
        Some(WireMessage::WorkerHello { name, capacity }) => {
            handle_worker(conn, shared, name, capacity).await
        }
        Some(WireMessage::ClientHello { name }) => handle_client(conn, shared, name).await,
        Some(other) => bail!("expected a hello frame, got {:?}", other),
        None => Ok(()),
    }
}

/// Serves one worker slot: waits for assignments, runs them over the
/// connection, and routes results (or failures) back to the scheduler.
async fn handle_worker(
    mut conn: Connection,
    shared: Arc<Shared>,
    name: String,
    capacity: u32,
) -> Result<()> {
    let (assign_tx, mut assign_rx) = mpsc::channel::<Pending>(1);
    {
        let mut sched = shared.sched.lock().unwrap();
        sched
            .workers
            .entry(name.clone())
            .or_insert(WorkerState {
                capacity,
                busy: 0,
                exclusive_active: false,
            })
            .capacity = capacity;
        sched.idle.push(Slot {
            worker: name.clone(),
            assign: assign_tx.clone(),
        });
    }
    info!("worker {} connected", name);
    try_dispatch(&shared);

    loop {
        let pending = tokio::select! {
            pending = assign_rx.recv() => match pending {
                Some(pending) => pending,
                None => return Ok(()),
            },
            message = conn.recv() => {
                // An idle worker has nothing to say; any traffic (or EOF)
                // means the connection is done. Drop our slot.
                let mut sched = shared.sched.lock().unwrap();
                sched.idle.retain(|slot| !slot.assign.same_channel(&assign_tx));
                drop(sched);
                return match message? {
                    Some(other) => bail!("unexpected frame from idle worker: {:?}", other),
                    None => Ok(()),
                };
            }
        };

        pending
            .session
            .events
            .executing(&pending.request.executable, pending.seq as i64);
        let exclusive = pending.request.exclusive;
        let outcome = run_on_worker(&mut conn, &shared, &pending).await;
        {
            let mut sched = shared.sched.lock().unwrap();
            if let Some(state) = sched.workers.get_mut(&name) {
                state.busy -= 1;
                if exclusive {
                    state.exclusive_active = false;
                }
            }
        }

        match outcome {
            Ok(response) => {
                finish(&shared, pending, response, &name).await;
                let mut sched = shared.sched.lock().unwrap();
                sched.idle.push(Slot {
                    worker: name.clone(),
                    assign: assign_tx.clone(),
                });
                drop(sched);
                try_dispatch(&shared);
            }
            Err(e) => {
                warn!("worker {} lost mid-flight: {:#}", name, e);
                requeue(&shared, pending, &name).await;
                try_dispatch(&shared);
                return Err(e);
            }
        }
    }
}

/// Runs one assignment over the worker connection, serving file pulls and
/// ingesting output uploads along the way.
async fn run_on_worker(
    conn: &mut Connection,
    shared: &Shared,
    pending: &Pending,
) -> Result<Response> {
    conn.send(&WireMessage::Work {
        id: pending.seq,
        request: pending.request.clone(),
    })
    .await?;
    let mut uploads: HashMap<Digest, ChunkWriter> = HashMap::new();
    loop {
        match conn.recv().await? {
            Some(WireMessage::FileRequest { digest }) => {
                serve_to_worker(conn, shared, &pending.session, digest).await?;
            }
            Some(WireMessage::FileChunk { digest, data }) => {
                if !uploads.contains_key(&digest) {
                    let sink = store::write(&shared.store.path_for(&digest), false, true)?;
                    uploads.insert(digest, sink);
                }
                let done = data.is_empty();
                let sink = uploads.get_mut(&digest).expect("sink was just inserted");
                sink.push(&data)?;
                if done {
                    uploads.remove(&digest);
                }
            }
            Some(WireMessage::WorkDone { id, response }) => {
                if id != pending.seq {
                    bail!("worker answered for unknown work item {}", id);
                }
                return Ok(response);
            }
            Some(other) => bail!("unexpected frame from busy worker: {:?}", other),
            None => bail!("worker disconnected"),
        }
    }
}

/// Answers a worker's file pull, relaying from the owning client when the
/// server store is missing the artifact.
async fn serve_to_worker(
    conn: &mut Connection,
    shared: &Shared,
    session: &Session,
    digest: Digest,
) -> Result<()> {
    if !shared.store.contains(&digest) {
        let (done_tx, done_rx) = oneshot::channel();
        if session
            .commands
            .send(SessionCommand::Pull {
                digest,
                done: done_tx,
            })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }
    let path = shared.store.path_for(&digest);
    if store::size(&path).is_some() {
        conn.send_file(&digest, &path).await
    } else {
        conn.send(&WireMessage::FileNotFound { digest }).await
    }
}

/// Delivers a finished response, or requeues it once when the worker
/// reported an internal failure (admission denied, sandbox setup, ...).
async fn finish(shared: &Arc<Shared>, pending: Pending, response: Response, worker: &str) {
    if response.status == ExitStatus::InternalError
        && pending.attempts + 1 < MAX_DISPATCH_ATTEMPTS
    {
        debug!(
            "request {} failed internally ({}), retrying elsewhere",
            pending.seq, response.error_message
        );
        let mut retry = pending;
        retry.attempts += 1;
        retry.exclude = Some(worker.to_string());
        let mut sched = shared.sched.lock().unwrap();
        sched.pending.push_front(retry);
        return;
    }
    let subject = pending.request.executable.clone();
    let testcase = pending.seq as i64;
    if response.status == ExitStatus::InternalError {
        pending
            .session
            .events
            .fatal_error(&format!("{}: {}", subject, response.error_message));
    } else {
        shared.cache.put(pending.cache_key, &response);
        pending.session.events.executed(&subject, testcase, false);
    }
    deliver(&pending.session, pending.id, response).await;
}

/// Puts a request back in line after its worker vanished, failing it once
/// the retry budget is spent.
async fn requeue(shared: &Arc<Shared>, mut pending: Pending, worker: &str) {
    pending.attempts += 1;
    if pending.attempts >= MAX_DISPATCH_ATTEMPTS {
        pending.session.events.fatal_error(&format!(
            "{}: worker lost during execution",
            pending.request.executable
        ));
        deliver(
            &pending.session,
            pending.id,
            Response::internal_error("worker lost during execution"),
        )
        .await;
        return;
    }
    pending.exclude = Some(worker.to_string());
    let mut sched = shared.sched.lock().unwrap();
    sched.pending.push_front(pending);
}

async fn deliver(session: &Session, id: u64, response: Response) {
    if session
        .commands
        .send(SessionCommand::Deliver { id, response })
        .await
        .is_err()
    {
        debug!("client {} gone before delivery of request {}", session.name, id);
    }
}

/// Matches the head of the pending queue against idle slots. Arrival
/// order is strict: an exclusive request at the head waits for a fully
/// idle worker and is not overtaken.
fn try_dispatch(shared: &Arc<Shared>) {
    let mut sched = shared.sched.lock().unwrap();
    sched
        .pending
        .retain(|pending| !pending.session.commands.is_closed());
    loop {
        let Some(front) = sched.pending.front() else {
            break;
        };
        let eligible = |sched: &Sched, slot: &Slot, honor_exclude: bool| -> bool {
            let Some(state) = sched.workers.get(&slot.worker) else {
                return false;
            };
            if state.exclusive_active {
                return false;
            }
            if front.request.exclusive && state.busy != 0 {
                return false;
            }
            if honor_exclude && front.exclude.as_deref() == Some(slot.worker.as_str()) {
                return false;
            }
            true
        };
        let position = sched
            .idle
            .iter()
            .position(|slot| eligible(&sched, slot, true))
            .or_else(|| sched.idle.iter().position(|slot| eligible(&sched, slot, false)));
        let Some(position) = position else {
            break;
        };
        let slot = sched.idle.remove(position);
        let pending = sched.pending.pop_front().expect("front was just observed");
        let exclusive = pending.request.exclusive;
        if let Some(state) = sched.workers.get_mut(&slot.worker) {
            state.busy += 1;
            if exclusive {
                state.exclusive_active = true;
            }
        }
        if let Err(send_error) = slot.assign.try_send(pending) {
            // The slot's task died between going idle and now; undo and
            // let the loop look for another slot.
            if let Some(state) = sched.workers.get_mut(&slot.worker) {
                state.busy -= 1;
                if exclusive {
                    state.exclusive_active = false;
                }
            }
            let pending = match send_error {
                mpsc::error::TrySendError::Full(p) | mpsc::error::TrySendError::Closed(p) => p,
            };
            sched.pending.push_front(pending);
        }
    }
}

/// Serves one client session: submits its requests, answers its output
/// pulls, performs server-initiated input pulls and forwards its event
/// stream.
async fn handle_client(mut conn: Connection, shared: Arc<Shared>, name: String) -> Result<()> {
    let (command_tx, mut command_rx) = mpsc::channel::<SessionCommand>(64);
    let events = Arc::new(EventQueue::new());
    let session = Session {
        name: name.clone(),
        commands: command_tx,
        events: events.clone(),
    };
    info!("client {} connected", name);

    let (event_tx, mut event_rx) = mpsc::channel::<Event>(64);
    let drain = {
        let events = events.clone();
        tokio::task::spawn_blocking(move || {
            events.bind_writer(None, |event| {
                let _ = event_tx.blocking_send(event);
            });
        })
    };

    let result: Result<()> = async {
        loop {
            tokio::select! {
                message = conn.recv() => match message? {
                    Some(WireMessage::Execute { id, request }) => {
                        if let Some(response) = submit(&shared, &session, id, request) {
                            conn.send(&WireMessage::ExecuteDone { id, response }).await?;
                        }
                    }
                    Some(WireMessage::FileRequest { digest }) => {
                        let path = shared.store.path_for(&digest);
                        if store::size(&path).is_some() {
                            conn.send_file(&digest, &path).await?;
                        } else {
                            conn.send(&WireMessage::FileNotFound { digest }).await?;
                        }
                    }
                    Some(other) => bail!("unexpected frame from client: {:?}", other),
                    None => return Ok(()),
                },
                command = command_rx.recv() => match command {
                    Some(SessionCommand::Deliver { id, response }) => {
                        conn.send(&WireMessage::ExecuteDone { id, response }).await?;
                    }
                    Some(SessionCommand::Pull { digest, done }) => {
                        let available = pull_from_client(&mut conn, &shared, digest).await?;
                        let _ = done.send(available);
                    }
                    None => return Ok(()),
                },
                event = event_rx.recv() => {
                    if let Some(event) = event {
                        conn.send(&WireMessage::Event { event }).await?;
                    }
                }
            }
        }
    }
    .await;

    events.stop();
    let _ = drain.await;
    info!("client {} disconnected", name);
    result
}

/// Pulls one artifact from the client into the server store. A dropped
/// transfer discards the partial write.
async fn pull_from_client(conn: &mut Connection, shared: &Shared, digest: Digest) -> Result<bool> {
    if shared.store.contains(&digest) {
        return Ok(true);
    }
    conn.send(&WireMessage::FileRequest { digest }).await?;
    let mut sink = store::write(&shared.store.path_for(&digest), false, true)?;
    match conn.recv_file(&digest, &mut sink).await {
        Ok(()) => {
            sink.finish()?;
            Ok(true)
        }
        Err(e) => {
            debug!("pull of {} from client failed: {:#}", digest, e);
            Ok(false)
        }
    }
}

/// Queues a request for dispatch. A replayable cached response is
/// returned immediately instead, skipping scheduling entirely; the caller
/// answers the client on its own connection.
fn submit(
    shared: &Arc<Shared>,
    session: &Session,
    id: u64,
    request: ExecutionRequest,
) -> Option<Response> {
    let subject = request.executable.clone();
    let cache_key = ExecutionCache::key(&request);
    let hit = shared.cache.get(&cache_key, &shared.store);
    let seq = {
        let mut sched = shared.sched.lock().unwrap();
        let seq = sched.next_seq;
        sched.next_seq += 1;
        if hit.is_none() {
            sched.pending.push_back(Pending {
                seq,
                id,
                request,
                cache_key,
                attempts: 0,
                exclude: None,
                session: session.clone(),
            });
        }
        seq
    };
    session.events.evaluation_waiting(&subject, seq as i64);
    if let Some(response) = hit {
        debug!("serving {} from the execution cache", subject);
        session.events.executed(&subject, seq as i64, true);
        return Some(response);
    }
    try_dispatch(shared);
    None
}
