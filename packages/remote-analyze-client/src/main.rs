//! Remote analyze client
//!
//! # Usage
//!
//! ```bash
//! # One-shot: submit, wait, download
//! remote-analyze run -b "gcc -c -Iinclude src/main.c" -o results.zip
//! remote-analyze run --compile-db build/compile_commands.json --timeout 3600
//!
//! # Step by step
//! ID=$(remote-analyze get-id)
//! remote-analyze analyze --id "$ID" --keep-open -b "gcc -c src/a.c"
//! remote-analyze analyze --id "$ID" --compile-db build/compile_commands.json
//! remote-analyze status --id "$ID"
//! remote-analyze results --id "$ID" -o results.zip
//! ```

use anyhow::{bail, Context};
use clap::{Args as ClapArgs, Parser, Subcommand};
use remote_analyze_client::{
    load_compile_database, wait_for_completion, ClientConfig, CompileUnit, RemoteAnalyzeClient,
    Submitter,
};
use remote_analyze_storage::JobId;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "remote-analyze")]
#[command(version, about = "Submit C/C++ translation units for remote analysis", long_about = None)]
struct Cli {
    /// Server address, host:port
    #[arg(long, global = true, env = "REMOTE_ANALYZE_SERVER")]
    server: Option<String>,

    /// Dependency collector program
    #[arg(long, global = true, env = "REMOTE_ANALYZE_COLLECTOR")]
    collector: Option<String>,

    /// Log filter, e.g. "info" or "remote_analyze_client=debug"
    #[arg(long, global = true, env = "RUST_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Allocate a job id
    GetId,
    /// Submit sources to an existing job, then seal it
    Analyze {
        #[arg(long)]
        id: String,
        #[command(flatten)]
        input: Input,
        /// Leave the job open for further `analyze` calls
        #[arg(long)]
        keep_open: bool,
    },
    /// Declare that no more sources follow for a job
    Seal {
        #[arg(long)]
        id: String,
    },
    /// Print the job state
    Status {
        #[arg(long)]
        id: String,
    },
    /// Download the result archive of a completed job
    Results {
        #[arg(long)]
        id: String,
        /// Defaults to `<id>.zip`
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Allocate a job, submit, wait for completion and download the results
    Run {
        #[command(flatten)]
        input: Input,
        #[arg(short, long, default_value = "output.zip")]
        output: PathBuf,
        /// Give up waiting after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[derive(ClapArgs, Debug)]
#[group(required = true, multiple = false)]
struct Input {
    /// A single compile command ending with the source file
    #[arg(short = 'b', long)]
    build_command: Option<String>,

    /// A compile_commands.json
    #[arg(long)]
    compile_db: Option<PathBuf>,
}

impl Input {
    fn units(&self) -> anyhow::Result<Vec<CompileUnit>> {
        if let Some(command) = &self.build_command {
            let cwd = std::env::current_dir().context("reading the working directory")?;
            return Ok(vec![CompileUnit::from_command_line(command, &cwd)?]);
        }
        if let Some(path) = &self.compile_db {
            return Ok(load_compile_database(path)?);
        }
        bail!("either --build-command or --compile-db is required")
    }
}

fn parse_job_id(raw: &str) -> anyhow::Result<JobId> {
    JobId::parse(raw).with_context(|| format!("malformed job id {:?}", raw))
}

async fn submit(
    client: &mut RemoteAnalyzeClient,
    config: &ClientConfig,
    job_id: &JobId,
    input: &Input,
) -> anyhow::Result<()> {
    let units = input.units()?;
    let submitter = Submitter::new(Arc::new(config.collector()));
    let report = submitter.submit_all(client, job_id, &units).await?;

    for (source, reason) in &report.skipped {
        warn!("Not analyzed: {} ({})", source.display(), reason);
    }
    if report.parts.is_empty() {
        bail!("no compilation unit could be submitted");
    }
    info!(
        "Submitted {} part(s) to job {}",
        report.parts.len(),
        job_id
    );
    Ok(())
}

async fn seal(client: &mut RemoteAnalyzeClient, job_id: &JobId) -> anyhow::Result<()> {
    let parts = client.seal(job_id).await?;
    info!("Sealed job {} with {} part(s)", job_id, parts);
    Ok(())
}

async fn download(client: &mut RemoteAnalyzeClient, job_id: &JobId, output: &Path) -> anyhow::Result<()> {
    let archive = client.get_results(job_id).await?;
    tokio::fs::write(output, &archive)
        .await
        .with_context(|| format!("writing {}", output.display()))?;
    println!("{}", output.display());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = ClientConfig::from_env()?;
    if let Some(server) = &cli.server {
        config.server = server.clone();
    }
    if let Some(collector) = &cli.collector {
        config.collector_program = collector.clone();
    }

    let mut client = RemoteAnalyzeClient::connect(&config.server, config.max_frame_bytes).await?;

    match &cli.command {
        Command::GetId => {
            let job_id = client.get_id().await?;
            println!("{}", job_id);
        }
        Command::Analyze {
            id,
            input,
            keep_open,
        } => {
            let job_id = parse_job_id(id)?;
            submit(&mut client, &config, &job_id, input).await?;
            if !keep_open {
                seal(&mut client, &job_id).await?;
            }
        }
        Command::Seal { id } => {
            let job_id = parse_job_id(id)?;
            seal(&mut client, &job_id).await?;
        }
        Command::Status { id } => {
            let job_id = parse_job_id(id)?;
            let state = client.get_status(&job_id).await?;
            println!("{}", state.as_str());
        }
        Command::Results { id, output } => {
            let job_id = parse_job_id(id)?;
            let output = output
                .clone()
                .unwrap_or_else(|| PathBuf::from(format!("{}.zip", job_id)));
            download(&mut client, &job_id, &output).await?;
        }
        Command::Run {
            input,
            output,
            timeout,
        } => {
            let job_id = client.get_id().await?;
            info!("Allocated job {}", job_id);
            submit(&mut client, &config, &job_id, input).await?;
            seal(&mut client, &job_id).await?;
            wait_for_completion(
                &mut client,
                &job_id,
                config.poll_interval(),
                timeout.map(Duration::from_secs),
            )
            .await?;
            download(&mut client, &job_id, output).await?;
        }
    }
    Ok(())
}
