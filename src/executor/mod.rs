//! Local execution service.
//!
//! Wraps the store and the sandbox into the contract the dispatch layer
//! calls: materialize the request's inputs from (or into) the store, run
//! the command under scaled limits, classify the outcome post-hoc and
//! re-ingest the outputs by digest.

pub mod cache;
pub mod guard;

pub use guard::{ExecutionSlots, SlotGuard, TooManyExecutions};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::proto::{
    ExecutionRequest, ExitStatus, FileInfo, FileRole, ResourceLimits, ResourceUsage, Response,
};
use crate::sandbox::{self, ExecutionInfo, ExecutionOptions, Sandbox, SetupError};
use crate::store::{self, ChunkWriter, Digest, FileStore, StoreError, CHUNK_SIZE};

/// Name of the child's root below the workspace. Everything the process
/// may touch lives in here; stdin/stdout/stderr sit beside it.
const BOX_DIR: &str = "box";

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("invalid file name: {0:?}")]
    InvalidName(String),
    #[error("FIFOs are not implemented")]
    FifoUnsupported,
    #[error("input {0:?} carries neither digest nor contents")]
    MissingDigest(String),
    #[error(transparent)]
    TooManyExecutions(#[from] TooManyExecutions),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sandbox(#[from] SetupError),
    #[error("fetching {digest}: {message}")]
    Fetch { digest: Digest, message: String },
}

/// Source of artifacts the local store is missing, typically the remote
/// requester on the other end of the dispatch connection.
#[async_trait]
pub trait FileFetcher: Send + Sync {
    /// Streams the artifact with the given digest into the sink,
    /// finalizing it with a zero-length chunk.
    async fn fetch(&self, digest: &Digest, sink: &mut ChunkWriter) -> anyhow::Result<()>;
}

/// Fetcher for fully local runs: every input must already be stored.
pub struct NoRemoteFiles;

#[async_trait]
impl FileFetcher for NoRemoteFiles {
    async fn fetch(&self, digest: &Digest, _sink: &mut ChunkWriter) -> anyhow::Result<()> {
        anyhow::bail!("artifact {} is not in the local store", digest)
    }
}

pub struct LocalExecutor {
    store: FileStore,
    temp_root: PathBuf,
    slots: Arc<ExecutionSlots>,
    sandbox: Arc<dyn Sandbox>,
}

impl LocalExecutor {
    pub fn new(
        store: FileStore,
        temp_root: impl Into<PathBuf>,
        slots: Arc<ExecutionSlots>,
    ) -> Result<Self, StoreError> {
        let temp_root = temp_root.into();
        store::make_dirs(&temp_root)?;
        Ok(Self {
            store,
            temp_root,
            slots,
            sandbox: sandbox::create(),
        })
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    pub fn slots(&self) -> &Arc<ExecutionSlots> {
        &self.slots
    }

    /// Runs one request to a classified [`Response`].
    ///
    /// Errors are programming/setup failures; limit violations and crashes
    /// of the sandboxed program come back as `Ok` with the matching status.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        fetcher: &dyn FileFetcher,
    ) -> Result<Response, ExecuteError> {
        if !request.fifos.is_empty() {
            return Err(ExecuteError::FifoUnsupported);
        }
        for info in request.inputs.iter().chain(&request.outputs) {
            check_name(&info.name, info.role)?;
        }

        let mut staged = Vec::with_capacity(request.inputs.len());
        for input in &request.inputs {
            staged.push((input, self.ingest_input(input, fetcher).await?));
        }

        let workspace = store::temp_dir(&self.temp_root)?;
        let box_dir = workspace.path().join(BOX_DIR);
        store::make_dirs(&box_dir)?;

        let mut options = ExecutionOptions::new(&box_dir, request.executable.as_str());
        options.args = request.args.clone();

        let mut loaded_executable = false;
        for (input, digest) in &staged {
            let dest = if input.role == FileRole::Stdin {
                let path = workspace.path().join("stdin");
                options.stdin_file = Some(path.clone());
                path
            } else {
                box_dir.join(&input.name)
            };
            store::copy(&self.store.path_for(digest), &dest, false, false)?;
            if input.role == FileRole::Stdin {
                continue;
            }
            if input.name == request.executable {
                // Mode bits come from prepare_for_execution alone; touching
                // them here would race the hardlink into the store.
                loaded_executable = true;
            } else if input.executable {
                store::make_executable(&dest)?;
            } else {
                self.sandbox.make_immutable(&dest)?;
            }
        }
        if loaded_executable {
            self.sandbox
                .prepare_for_execution(&box_dir.join(&request.executable))?;
        }

        options.stdout_file = Some(workspace.path().join("stdout"));
        options.stderr_file = Some(workspace.path().join("stderr"));

        // Scale the enforced limits up so that the post-hoc classification
        // on measured usage stays authoritative near the boundary.
        options.cpu_limit_ms = (request.limits.cpu_time * 1200.0) as u64;
        options.wall_limit_ms = (request.limits.wall_time * 1200.0) as u64;
        options.memory_limit_kb = request.limits.memory_kb * 6 / 5;
        options.max_files = request.limits.max_files;
        options.max_procs = request.limits.max_procs;
        options.max_file_size_kb = request.limits.max_file_size_kb;
        options.max_mlock_kb = request.limits.max_mlock_kb;
        options.max_stack_kb = request.limits.max_stack_kb;

        let info = {
            let slots = self.slots.clone();
            let sandbox = self.sandbox.clone();
            let exclusive = request.exclusive;
            tokio::task::spawn_blocking(move || -> Result<ExecutionInfo, ExecuteError> {
                let _guard = slots.acquire(exclusive)?;
                Ok(sandbox.execute(&options)?)
            })
            .await
            .map_err(|e| SetupError(format!("execution task failed: {}", e)))??
        };

        let mut response = classify(&request.limits, &info);

        self.retrieve(
            &mut response,
            &FileInfo::new("stdout", FileRole::Stdout),
            workspace.path(),
        )?;
        self.retrieve(
            &mut response,
            &FileInfo::new("stderr", FileRole::Stderr),
            workspace.path(),
        )?;
        for output in &request.outputs {
            match self.retrieve(&mut response, output, workspace.path()) {
                Err(ExecuteError::Store(StoreError::NotFound(_))) => {
                    if response.status == ExitStatus::Success {
                        response.status = ExitStatus::MissingFiles;
                        response.error_message = "Missing output files".into();
                    }
                }
                other => other?,
            }
        }

        if request.keep_sandbox {
            let path = workspace.keep();
            debug!("keeping sandbox workspace at {}", path.display());
        }
        Ok(response)
    }

    /// Makes sure the input's artifact is in the store, pulling it from its
    /// inline contents or the fetcher when absent.
    async fn ingest_input(
        &self,
        info: &FileInfo,
        fetcher: &dyn FileFetcher,
    ) -> Result<Digest, ExecuteError> {
        let digest = match (info.digest, &info.contents) {
            (Some(digest), _) => digest,
            (None, Some(contents)) => Digest::of_bytes(contents),
            (None, None) => return Err(ExecuteError::MissingDigest(info.name.clone())),
        };
        let path = self.store.path_for(&digest);
        if store::size(&path).is_some() {
            return Ok(digest);
        }
        let result: Result<(), ExecuteError> = async {
            if let Some(contents) = &info.contents {
                store::write_bytes(&path, contents, false, false)?;
            } else {
                let mut sink = store::write(&path, false, false)?;
                fetcher
                    .fetch(&digest, &mut sink)
                    .await
                    .map_err(|e| ExecuteError::Fetch {
                        digest,
                        message: format!("{:#}", e),
                    })?;
                sink.finish()?;
            }
            Ok(())
        }
        .await;
        match result {
            // A concurrent fetcher of the same digest got there first;
            // the bytes are identical either way.
            Err(ExecuteError::Store(StoreError::Exists(_))) => Ok(digest),
            other => other.map(|()| digest),
        }
    }

    /// Hashes one produced file into the store and appends its FileInfo to
    /// the response, inlining small contents.
    fn retrieve(
        &self,
        response: &mut Response,
        info: &FileInfo,
        workspace: &Path,
    ) -> Result<(), ExecuteError> {
        let source = match info.role {
            FileRole::Stdout => workspace.join("stdout"),
            FileRole::Stderr => workspace.join("stderr"),
            _ => workspace.join(BOX_DIR).join(&info.name),
        };
        let digest = store::hash(&source)?;
        store::copy(&source, &self.store.path_for(&digest), false, true)?;
        let mut out = FileInfo::new(info.name.as_str(), info.role).with_digest(digest);
        if store::size(&source).is_some_and(|s| s <= CHUNK_SIZE as u64) {
            out.contents = Some(store::read_bytes(&source)?);
        }
        response.outputs.push(out);
        Ok(())
    }
}

fn check_name(name: &str, role: FileRole) -> Result<(), ExecuteError> {
    // Streams get fixed paths outside the box; their names are free-form.
    if matches!(role, FileRole::Stdin | FileRole::Stdout | FileRole::Stderr) {
        return Ok(());
    }
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(ExecuteError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Classifies measured usage against the requested limits.
///
/// The order is load-bearing: exceeded limits take precedence over their
/// downstream symptoms, so a run killed by the memory watchdog reports
/// `MEMORY_LIMIT` rather than the kill signal.
pub fn classify(limits: &ResourceLimits, info: &ExecutionInfo) -> Response {
    let usage = ResourceUsage {
        cpu_time: info.cpu_time_ms as f64 / 1000.0,
        sys_time: info.sys_time_ms as f64 / 1000.0,
        wall_time: info.wall_time_ms as f64 / 1000.0,
        memory_kb: info.memory_kb,
    };
    let (status, message) = if limits.memory_kb > 0 && usage.memory_kb >= limits.memory_kb {
        (ExitStatus::MemoryLimit, "Memory limit exceeded".to_string())
    } else if limits.cpu_time > 0.0 && usage.cpu_time + usage.sys_time >= limits.cpu_time {
        (ExitStatus::TimeLimit, "CPU limit exceeded".to_string())
    } else if limits.wall_time > 0.0 && usage.wall_time >= limits.wall_time {
        (ExitStatus::TimeLimit, "Wall limit exceeded".to_string())
    } else if info.signal != 0 {
        (ExitStatus::Signal, info.message.clone())
    } else if info.status_code != 0 {
        (ExitStatus::Nonzero, info.message.clone())
    } else {
        (ExitStatus::Success, String::new())
    };
    Response {
        status,
        resource_usage: usage,
        status_code: info.status_code,
        signal: info.signal,
        error_message: message,
        outputs: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(cpu: f64, wall: f64, memory_kb: u64) -> ResourceLimits {
        ResourceLimits {
            cpu_time: cpu,
            wall_time: wall,
            memory_kb,
            ..ResourceLimits::default()
        }
    }

    fn info(cpu_ms: u64, sys_ms: u64, wall_ms: u64, memory_kb: u64) -> ExecutionInfo {
        ExecutionInfo {
            cpu_time_ms: cpu_ms,
            sys_time_ms: sys_ms,
            wall_time_ms: wall_ms,
            memory_kb,
            ..ExecutionInfo::default()
        }
    }

    #[test]
    fn test_classification_order() {
        // Memory wins over everything, including the kill signal.
        let mut crashed = info(2000, 0, 2000, 70_000);
        crashed.signal = libc::SIGKILL;
        let response = classify(&limits(1.0, 1.0, 65_536), &crashed);
        assert_eq!(response.status, ExitStatus::MemoryLimit);

        // CPU (user + sys) beats wall.
        let response = classify(&limits(1.0, 10.0, 0), &info(600, 500, 12_000, 0));
        assert_eq!(response.status, ExitStatus::TimeLimit);
        assert_eq!(response.error_message, "CPU limit exceeded");

        let response = classify(&limits(10.0, 1.0, 0), &info(100, 0, 1500, 0));
        assert_eq!(response.status, ExitStatus::TimeLimit);
        assert_eq!(response.error_message, "Wall limit exceeded");

        let mut signaled = info(10, 0, 20, 0);
        signaled.signal = libc::SIGSEGV;
        signaled.message = "Killed by signal 11".into();
        let response = classify(&ResourceLimits::default(), &signaled);
        assert_eq!(response.status, ExitStatus::Signal);
        assert_eq!(response.signal, libc::SIGSEGV);

        let mut failed = info(10, 0, 20, 0);
        failed.status_code = 1;
        let response = classify(&ResourceLimits::default(), &failed);
        assert_eq!(response.status, ExitStatus::Nonzero);

        let response = classify(&ResourceLimits::default(), &info(10, 0, 20, 1000));
        assert_eq!(response.status, ExitStatus::Success);
    }

    #[test]
    fn test_zero_limit_means_unlimited() {
        let response = classify(&ResourceLimits::default(), &info(100_000, 0, 100_000, 1 << 30));
        assert_eq!(response.status, ExitStatus::Success);
    }

    #[test]
    fn test_illegal_names_rejected() {
        assert!(check_name("solution", FileRole::Input).is_ok());
        assert!(check_name("in+put.txt", FileRole::Input).is_ok());
        assert!(check_name("a/b", FileRole::Input).is_err());
        assert!(check_name("..", FileRole::Input).is_err());
        assert!(check_name("nul\0", FileRole::Output).is_err());
        assert!(check_name("", FileRole::Output).is_err());
    }

    // End-to-end runs below use /bin/sh scripts staged through the store.

    struct Fixture {
        _dir: tempfile::TempDir,
        executor: LocalExecutor,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("store")).unwrap();
        let executor = LocalExecutor::new(
            store,
            dir.path().join("temp"),
            Arc::new(ExecutionSlots::new(2)),
        )
        .unwrap();
        Fixture {
            _dir: dir,
            executor,
        }
    }

    fn script_request(fixture: &Fixture, body: &str) -> ExecutionRequest {
        let bytes = format!("#!/bin/sh\n{}\n", body).into_bytes();
        let digest = fixture.executor.store().ingest(&bytes).unwrap();
        let mut request = ExecutionRequest::new("run.sh");
        request
            .inputs
            .push(FileInfo::new("run.sh", FileRole::Input).with_digest(digest));
        request
    }

    #[tokio::test]
    async fn test_hello_success() {
        let fixture = fixture();
        let request = script_request(&fixture, "printf 'ok\\n'");
        let response = fixture
            .executor
            .execute(&request, &NoRemoteFiles)
            .await
            .unwrap();
        assert_eq!(response.status, ExitStatus::Success);
        let stdout = response.output("stdout").unwrap();
        assert_eq!(stdout.digest, Some(Digest::of_bytes(b"ok\n")));
        assert_eq!(stdout.contents.as_deref(), Some(b"ok\n".as_slice()));
        let stderr = response.output("stderr").unwrap();
        assert_eq!(stderr.digest, Some(Digest::of_bytes(b"")));
    }

    #[tokio::test]
    async fn test_output_round_trip() {
        let fixture = fixture();
        let payload = b"some test case data\n";
        let input_digest = fixture.executor.store().ingest(payload).unwrap();
        let mut request = script_request(&fixture, "cat input.txt > data.out");
        request
            .inputs
            .push(FileInfo::new("input.txt", FileRole::Input).with_digest(input_digest));
        request
            .outputs
            .push(FileInfo::new("data.out", FileRole::Output));
        let response = fixture
            .executor
            .execute(&request, &NoRemoteFiles)
            .await
            .unwrap();
        assert_eq!(response.status, ExitStatus::Success);
        // A verbatim copy hashes back to the input's digest.
        assert_eq!(response.output("data.out").unwrap().digest, Some(input_digest));
    }

    #[tokio::test]
    async fn test_stdin_from_store() {
        let fixture = fixture();
        let stdin_digest = fixture.executor.store().ingest(b"21\n").unwrap();
        let mut request = script_request(&fixture, "read n; echo $((n * 2))");
        request
            .inputs
            .push(FileInfo::new("stdin", FileRole::Stdin).with_digest(stdin_digest));
        let response = fixture
            .executor
            .execute(&request, &NoRemoteFiles)
            .await
            .unwrap();
        assert_eq!(response.status, ExitStatus::Success);
        assert_eq!(
            response.output("stdout").unwrap().contents.as_deref(),
            Some(b"42\n".as_slice())
        );
    }

    #[tokio::test]
    async fn test_inline_contents_ingested() {
        let fixture = fixture();
        let mut request = script_request(&fixture, "cat note.txt");
        request
            .inputs
            .push(FileInfo::new("note.txt", FileRole::Input).with_contents(&b"inline"[..]));
        let response = fixture
            .executor
            .execute(&request, &NoRemoteFiles)
            .await
            .unwrap();
        assert_eq!(response.status, ExitStatus::Success);
        assert_eq!(
            response.output("stdout").unwrap().digest,
            Some(Digest::of_bytes(b"inline"))
        );
    }

    #[tokio::test]
    async fn test_missing_output_downgrades_success() {
        let fixture = fixture();
        let mut request = script_request(&fixture, "true");
        request
            .outputs
            .push(FileInfo::new("data.out", FileRole::Output));
        let response = fixture
            .executor
            .execute(&request, &NoRemoteFiles)
            .await
            .unwrap();
        assert_eq!(response.status, ExitStatus::MissingFiles);
    }

    #[tokio::test]
    async fn test_missing_output_keeps_harder_status() {
        let fixture = fixture();
        let mut request = script_request(&fixture, "exit 7");
        request
            .outputs
            .push(FileInfo::new("data.out", FileRole::Output));
        let response = fixture
            .executor
            .execute(&request, &NoRemoteFiles)
            .await
            .unwrap();
        assert_eq!(response.status, ExitStatus::Nonzero);
        assert_eq!(response.status_code, 7);
    }

    #[tokio::test]
    async fn test_signal_classified() {
        let fixture = fixture();
        let request = script_request(&fixture, "kill -s SEGV $$");
        let response = fixture
            .executor
            .execute(&request, &NoRemoteFiles)
            .await
            .unwrap();
        assert_eq!(response.status, ExitStatus::Signal);
        assert_eq!(response.signal, libc::SIGSEGV);
        assert!(!response.error_message.is_empty());
    }

    #[tokio::test]
    async fn test_cpu_limit_classified() {
        let fixture = fixture();
        let mut request = script_request(&fixture, "while :; do :; done");
        request.limits.cpu_time = 1.0;
        let response = fixture
            .executor
            .execute(&request, &NoRemoteFiles)
            .await
            .unwrap();
        assert_eq!(response.status, ExitStatus::TimeLimit);
        assert!(
            response.resource_usage.cpu_time + response.resource_usage.sys_time >= 1.0,
            "usage {:?}",
            response.resource_usage
        );
    }

    #[tokio::test]
    async fn test_wall_limit_classified() {
        let fixture = fixture();
        let mut request = script_request(&fixture, "sleep 5");
        request.limits.wall_time = 0.3;
        let response = fixture
            .executor
            .execute(&request, &NoRemoteFiles)
            .await
            .unwrap();
        assert_eq!(response.status, ExitStatus::TimeLimit);
        assert!(response.resource_usage.wall_time >= 0.3);
    }

    #[tokio::test]
    async fn test_memory_limit_classified() {
        let fixture = fixture();
        // Build a 1 MiB chunk, then append it forever: memory climbs
        // gradually and stays sampleable until allocation fails at the
        // enforced ceiling (1.2x the requested limit).
        let mut request = script_request(
            &fixture,
            "c=x\n\
             i=0\n\
             while [ $i -lt 20 ]; do c=$c$c; i=$((i+1)); done\n\
             while :; do s=$s$c; done",
        );
        request.limits.memory_kb = 65_536;
        let response = fixture
            .executor
            .execute(&request, &NoRemoteFiles)
            .await
            .unwrap();
        assert_eq!(response.status, ExitStatus::MemoryLimit);
        assert!(
            response.resource_usage.memory_kb >= 65_536,
            "usage {:?}",
            response.resource_usage
        );
    }

    #[tokio::test]
    async fn test_fifo_request_rejected() {
        let fixture = fixture();
        let mut request = script_request(&fixture, "true");
        request.fifos.push("pipe".into());
        assert!(matches!(
            fixture.executor.execute(&request, &NoRemoteFiles).await,
            Err(ExecuteError::FifoUnsupported)
        ));
    }

    #[tokio::test]
    async fn test_illegal_name_rejected_before_io() {
        let fixture = fixture();
        let mut request = ExecutionRequest::new("run.sh");
        request
            .inputs
            .push(FileInfo::new("../escape", FileRole::Input).with_contents(&b"x"[..]));
        assert!(matches!(
            fixture.executor.execute(&request, &NoRemoteFiles).await,
            Err(ExecuteError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_input_needs_fetcher() {
        let fixture = fixture();
        let mut request = ExecutionRequest::new("run.sh");
        request.inputs.push(
            FileInfo::new("run.sh", FileRole::Input)
                .with_digest(Digest::of_bytes(b"never ingested")),
        );
        assert!(matches!(
            fixture.executor.execute(&request, &NoRemoteFiles).await,
            Err(ExecuteError::Fetch { .. })
        ));
    }

    #[tokio::test]
    async fn test_keep_sandbox_retains_workspace() {
        let fixture = fixture();
        let mut request = script_request(&fixture, "echo kept > marker");
        request.keep_sandbox = true;
        fixture
            .executor
            .execute(&request, &NoRemoteFiles)
            .await
            .unwrap();
        let temp_root = fixture._dir.path().join("temp");
        let markers = store::list_files(&temp_root)
            .unwrap()
            .into_iter()
            .filter(|p| p.file_name().is_some_and(|n| n == "marker"))
            .count();
        assert_eq!(markers, 1);
    }
}
