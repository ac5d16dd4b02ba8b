use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use gavel::config::Config;
use gavel::executor::{ExecutionSlots, LocalExecutor, NoRemoteFiles};
use gavel::proto::{ExecutionRequest, FileInfo, FileRole, ResourceLimits, Response};
use gavel::remote::worker::WorkerOptions;
use gavel::remote::{Client, DispatchServer};
use gavel::store::FileStore;

#[derive(Parser)]
#[command(name = "gavel", about = "Deterministic grading engine for competitive-programming tasks")]
struct Cli {
    /// Path to a gavel.toml configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatch server
    Server {
        /// Address to listen on
        #[arg(long)]
        listen: Option<String>,
        #[arg(long)]
        store_dir: Option<PathBuf>,
    },
    /// Run a worker pool attached to a server
    Worker {
        /// Server address to connect to
        #[arg(long)]
        server: Option<String>,
        /// Name that identifies this worker
        #[arg(long)]
        name: Option<String>,
        /// Number of concurrent execution slots (defaults to the core count)
        #[arg(long)]
        capacity: Option<u32>,
        #[arg(long)]
        store_dir: Option<PathBuf>,
        #[arg(long)]
        temp_dir: Option<PathBuf>,
    },
    /// Execute one command and print the classified outcome
    Exec(ExecArgs),
}

#[derive(Args)]
struct ExecArgs {
    /// Execute remotely via this server instead of locally
    #[arg(long)]
    server: Option<String>,
    #[arg(long)]
    store_dir: Option<PathBuf>,
    #[arg(long)]
    temp_dir: Option<PathBuf>,
    /// Extra input files staged next to the executable
    #[arg(long)]
    input: Vec<PathBuf>,
    /// File fed to the program's stdin
    #[arg(long)]
    stdin: Option<PathBuf>,
    /// CPU time limit in seconds (0 = unlimited)
    #[arg(long, default_value_t = 0.0)]
    cpu_time: f64,
    /// Wall time limit in seconds (0 = unlimited)
    #[arg(long, default_value_t = 0.0)]
    wall_time: f64,
    /// Memory limit in KiB (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    memory_kb: u64,
    /// Require an otherwise idle worker
    #[arg(long)]
    exclusive: bool,
    /// Keep the sandbox workspace for debugging
    #[arg(long)]
    keep_sandbox: bool,
    /// Program to run
    binary: PathBuf,
    /// Arguments passed to the program
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("gavel=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Server { listen, store_dir } => {
            let listen = listen.unwrap_or_else(|| config.listen());
            let store = FileStore::new(store_dir.unwrap_or_else(|| config.store_dir()))?;
            DispatchServer::bind(&listen, store).await?.run().await
        }
        Command::Worker {
            server,
            name,
            capacity,
            store_dir,
            temp_dir,
        } => {
            gavel::remote::worker::run(WorkerOptions {
                server: server.unwrap_or_else(|| config.server()),
                name: name.unwrap_or_else(|| config.worker_name()),
                capacity: capacity.unwrap_or_else(|| config.num_cores()),
                store_dir: store_dir.unwrap_or_else(|| config.store_dir()),
                temp_dir: temp_dir.unwrap_or_else(|| config.temp_dir()),
            })
            .await
        }
        Command::Exec(args) => exec(args, &config).await,
    }
}

async fn exec(args: ExecArgs, config: &Config) -> Result<()> {
    let store = FileStore::new(args.store_dir.clone().unwrap_or_else(|| config.store_dir()))?;

    let executable_name = args
        .binary
        .file_name()
        .context("binary path has no file name")?
        .to_string_lossy()
        .into_owned();
    let mut request = ExecutionRequest::new(executable_name.as_str());
    request.args = args.args.clone();
    request.limits = ResourceLimits {
        cpu_time: args.cpu_time,
        wall_time: args.wall_time,
        memory_kb: args.memory_kb,
        ..ResourceLimits::default()
    };
    request.exclusive = args.exclusive;
    request.keep_sandbox = args.keep_sandbox;

    let digest = store.ingest_file(&args.binary)?;
    request
        .inputs
        .push(FileInfo::new(executable_name.as_str(), FileRole::Input).with_digest(digest));
    for input in &args.input {
        let name = input
            .file_name()
            .with_context(|| format!("{} has no file name", input.display()))?
            .to_string_lossy()
            .into_owned();
        let digest = store.ingest_file(input)?;
        request
            .inputs
            .push(FileInfo::new(name, FileRole::Input).with_digest(digest));
    }
    if let Some(stdin) = &args.stdin {
        let digest = store.ingest_file(stdin)?;
        request
            .inputs
            .push(FileInfo::new("stdin", FileRole::Stdin).with_digest(digest));
    }

    let response = match &args.server {
        Some(server) => {
            let mut client = Client::connect(server, "gavel-exec", store.clone()).await?;
            let response = client.execute(request).await?;
            for output in &response.outputs {
                if output.contents.is_none() {
                    if let Some(digest) = &output.digest {
                        client.fetch(digest).await?;
                    }
                }
            }
            response
        }
        None => {
            let executor = LocalExecutor::new(
                store.clone(),
                args.temp_dir.clone().unwrap_or_else(|| config.temp_dir()),
                Arc::new(ExecutionSlots::new(config.num_cores())),
            )?;
            executor.execute(&request, &NoRemoteFiles).await?
        }
    };

    report(&store, &response)?;
    Ok(())
}

fn report(store: &FileStore, response: &Response) -> Result<()> {
    info!(
        "status={} code={} signal={} cpu={:.3}s sys={:.3}s wall={:.3}s memory={}KB",
        response.status,
        response.status_code,
        response.signal,
        response.resource_usage.cpu_time,
        response.resource_usage.sys_time,
        response.resource_usage.wall_time,
        response.resource_usage.memory_kb,
    );
    if !response.error_message.is_empty() {
        info!("message: {}", response.error_message);
    }
    for output in &response.outputs {
        let bytes = match &output.contents {
            Some(contents) => contents.clone(),
            None => match &output.digest {
                Some(digest) => store.read_bytes(digest)?,
                None => continue,
            },
        };
        match output.role {
            FileRole::Stdout => print!("{}", String::from_utf8_lossy(&bytes)),
            FileRole::Stderr => eprint!("{}", String::from_utf8_lossy(&bytes)),
            _ => info!("output {} ({} bytes)", output.name, bytes.len()),
        }
    }
    Ok(())
}
