//! upstamp - resumable uploads with timestamp proofs

use anyhow::Context;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use upstamp::cli::{Cli, Commands, ConfigArgs, HashArgs, ProofStatusArgs, UploadArgs};
use upstamp::config::Config;
use upstamp::format::UploadReport;
use upstamp::hasher::hash_source;
use upstamp::progress::ProgressTracker;
use upstamp::proof::ots::Attestation;
use upstamp::proof::{ProofAgent, ProofArtifact};
use upstamp::retry::{backoff_delay, RetryConfig};
use upstamp::source::SourceFile;
use upstamp::transport::Transport;
use upstamp::upload::UploadState;
use upstamp::uploader::Uploader;
use upstamp::UploadStatus;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    init_tracing(cli.verbose, cli.json);

    match cli.command {
        Commands::Upload(args) => run_upload(args).await?,
        Commands::Hash(args) => run_hash(args).await?,
        Commands::ProofStatus(args) => run_proof_status(args).await?,
        Commands::Config(args) => handle_config_command(args)?,
    }

    Ok(())
}

fn init_tracing(verbose: u8, json: bool) {
    let filter = match verbose {
        0 => EnvFilter::new("upstamp=info"),
        1 => EnvFilter::new("upstamp=debug"),
        2 => EnvFilter::new("upstamp=trace"),
        _ => EnvFilter::new("trace"),
    };

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Abort every upload on Ctrl+C. Dropping the returned sender stops the watcher.
fn setup_shutdown_handler(uploader: Arc<Uploader>) -> tokio::sync::oneshot::Sender<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Received Ctrl+C, aborting uploads...");
                uploader.abort_all();
            }
            _ = rx => {
                // Normal shutdown
            }
        }
    });

    tx
}

async fn run_upload(args: UploadArgs) -> anyhow::Result<()> {
    let config = args.to_config()?;
    let retry = RetryConfig::from(&config);
    let progress = config.progress;

    let uploader = if args.dry_run {
        tracing::info!("Dry run mode - uploading to an in-memory server");
        Uploader::new(config, Transport::memory(), None)?
    } else {
        Uploader::from_config(config)?
    };
    let uploader = Arc::new(uploader);
    let shutdown = setup_shutdown_handler(Arc::clone(&uploader));

    let mut events = uploader.subscribe();
    let mut tracker = ProgressTracker::new(progress);
    let start = Instant::now();
    let mut unreadable = 0u64;

    for path in &args.files {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            tracing::error!(path = %path.display(), "Not a file path");
            unreadable += 1;
            continue;
        };
        match SourceFile::open(path).await {
            Ok(source) => {
                let upload = uploader.upload(&name, source)?;
                tracker.add(&upload);
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Cannot read file");
                unreadable += 1;
            }
        }
    }

    let settle = settle(&uploader, &retry);
    tokio::pin!(settle);
    let states = loop {
        tokio::select! {
            states = &mut settle => break states?,
            event = events.recv() => match event {
                Ok(event) => tracker.handle(&event),
                Err(RecvError::Lagged(skipped)) => tracing::debug!(skipped, "Progress display lagged"),
                Err(RecvError::Closed) => break (&mut settle).await?,
            },
        }
    };
    tracker.finish();
    drop(shutdown);

    for upload in uploader.uploads() {
        if let Some(reason) = upload.failure_reason() {
            let reason = if reason.is_empty() { "aborted" } else { reason.as_str() };
            eprintln!("failed: {}: {}", upload.display_name(), reason);
        }
    }

    if let Some(dir) = &args.save_proofs {
        save_proofs(&uploader, dir).await?;
    }

    let report = UploadReport::from_states(&states, start.elapsed(), args.dry_run);
    report.print();

    let unsuccessful = report.unsuccessful() + unreadable;
    if unsuccessful > 0 {
        anyhow::bail!("{} of {} files were not uploaded", unsuccessful, args.files.len());
    }
    Ok(())
}

/// Wait for every upload to settle, resubmitting failures that carry a reason.
/// Aborts and connection failures (empty reason) are left alone.
async fn settle(uploader: &Uploader, retry: &RetryConfig) -> anyhow::Result<Vec<UploadState>> {
    let mut attempt = 0;
    loop {
        let states = uploader.wait_all().await;
        if attempt >= retry.max_retries {
            return Ok(states);
        }

        let retryable: Vec<_> = uploader
            .failed()
            .await?
            .into_iter()
            .filter(|u| u.status() == UploadStatus::Failed)
            .filter(|u| u.failure_reason().is_some_and(|r| !r.is_empty()))
            .collect();
        if retryable.is_empty() {
            return Ok(states);
        }

        let delay = backoff_delay(retry, attempt);
        tracing::info!(
            count = retryable.len(),
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "Retrying failed uploads"
        );
        tokio::time::sleep(delay).await;

        for upload in retryable {
            uploader.retry(upload.id()).await?;
        }
        attempt += 1;
    }
}

async fn save_proofs(uploader: &Uploader, dir: &Path) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    for upload in uploader.uploads() {
        let Some(artifact) = upload.proof().artifact else {
            continue;
        };
        let leaf = upload
            .display_name()
            .rsplit('/')
            .next()
            .unwrap_or_else(|| upload.display_name());
        let path = dir.join(format!("{}.ots", leaf));
        tokio::fs::write(&path, artifact.as_bytes())
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        tracing::info!(path = %path.display(), "Proof saved");
    }
    Ok(())
}

async fn run_hash(args: HashArgs) -> anyhow::Result<()> {
    let chunk_size = Config::parse_size(&args.chunk_size)? as usize;
    Config::check_chunk_size(chunk_size)?;
    let source = SourceFile::open(&args.file).await?;

    let bar = indicatif::ProgressBar::new(1000);
    let fingerprint = hash_source(&source, args.algorithm, chunk_size, |fraction| {
        bar.set_position((fraction * 1000.0) as u64)
    })
    .await?;
    bar.finish_and_clear();

    println!("{}  {}", fingerprint, args.file.display());
    Ok(())
}

async fn run_proof_status(args: ProofStatusArgs) -> anyhow::Result<()> {
    let config = args.to_config();
    let bytes = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("reading {}", args.file.display()))?;
    let artifact = ProofArtifact::from_bytes(bytes);

    let detached = artifact.parse()?;
    println!("File digest: {}", hex::encode(&detached.digest));
    for (_, attestation) in detached.attestations()? {
        match attestation {
            Attestation::Pending { uri } => println!("  pending at {}", uri),
            Attestation::Bitcoin { height } => println!("  bitcoin block {}", height),
            Attestation::Litecoin { height } => println!("  litecoin block {}", height),
            Attestation::Unknown { tag, .. } => println!("  unknown attestation {}", hex::encode(tag)),
        }
    }

    let agent = ProofAgent::from_config(&config)?;
    let status = agent.query_status(&artifact).await;
    println!("Status: {}", status);
    Ok(())
}

fn handle_config_command(args: ConfigArgs) -> anyhow::Result<()> {
    if args.path {
        match Config::default_config_path() {
            Ok(path) => println!("{}", path.display()),
            Err(e) => eprintln!("Error: {}", e),
        }
    } else if args.init {
        let config = Config::default();
        config.save()?;
        println!(
            "Created default configuration at {}",
            Config::default_config_path()?.display()
        );
    } else {
        // Show current config
        let config = Config::load().unwrap_or_default();
        println!("{}", toml::to_string_pretty(&config)?);
    }
    Ok(())
}
