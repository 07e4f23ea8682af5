//! gds-io: GPUDirect Storage accelerated file transfers.
//!
//! Moves file data straight between storage and GPU memory through libcufile
//! when the policy and platform allow it, and through host memory otherwise.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use gds_io::backend::driver::PosixLoader;
use gds_io::backend::policy::{BackendPolicy, PolicyMode};
use gds_io::backend::shim::{CapabilityShim, CapabilityState};
use gds_io::config::{Cli, Command, TransferConfig};
use gds_io::source::{FileReader, FileWriter};
use gds_io::transfer::GdsRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "gds_io=debug"
    } else {
        "gds_io=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("gds-io v{}", env!("CARGO_PKG_VERSION"));

    let mut config = TransferConfig::load(&cli.config)?;
    if cli.emulate {
        // Host buffers of arbitrary length cannot satisfy O_DIRECT.
        config.direct_io = false;
    }
    info!(
        pool_threads = config.pool_threads,
        slice_bytes = config.slice_bytes,
        direct_io = config.direct_io,
        "Configuration loaded"
    );

    let mut builder = GdsRuntime::builder().config(config);
    if let Some(policy) = cli.policy.as_deref() {
        builder = builder.policy(Arc::new(BackendPolicy::with_mode(PolicyMode::resolve(
            Some(policy),
        ))));
    }
    if cli.emulate {
        builder = builder
            .shim(Arc::new(CapabilityShim::new(PosixLoader)))
            .host_memory();
    }
    let runtime = builder.build()?;

    match cli.command {
        Command::Probe { metrics } => probe(&runtime, metrics),
        Command::Read { path, offset, size } => {
            let rt = runtime.clone();
            tokio::task::spawn_blocking(move || read(&rt, &path, offset, size)).await??;
            Ok(())
        }
        Command::Copy { src, dst, chunk } => {
            let rt = runtime.clone();
            tokio::task::spawn_blocking(move || copy(&rt, &src, &dst, chunk)).await??;
            Ok(())
        }
    }
}

fn probe(runtime: &GdsRuntime, metrics: bool) -> anyhow::Result<()> {
    let policy = runtime.policy();
    let enabled = policy.is_enabled();
    info!(mode = %policy.mode(), enabled, "Policy");

    if let Some(path) = policy.rewritten_config() {
        info!(path = %path.display(), "Rewritten backend config");
    }

    if enabled {
        match runtime.shim().state() {
            CapabilityState::Valid(driver) => info!(backend = driver.name(), "Backend available"),
            CapabilityState::Invalid(cause) => info!(%cause, "Backend unavailable"),
        }
    }

    if metrics {
        print!("{}", runtime.metrics().render()?);
    }
    Ok(())
}

fn read(runtime: &GdsRuntime, path: &Path, offset: u64, size: Option<usize>) -> anyhow::Result<()> {
    let reader = FileReader::open(path, runtime)
        .with_context(|| format!("opening {}", path.display()))?;
    let size = match size {
        Some(size) => size,
        None => usize::try_from(reader.size().saturating_sub(offset))?,
    };

    let start = Instant::now();
    let buffer = reader.read(offset, size)?;
    let elapsed = start.elapsed();

    info!(
        path = %path.display(),
        accelerated = reader.is_accelerated(),
        bytes = buffer.len(),
        elapsed_ms = elapsed.as_millis() as u64,
        mib_per_sec = throughput(buffer.len() as u64, elapsed.as_secs_f64()),
        "Read complete"
    );
    Ok(())
}

fn copy(runtime: &GdsRuntime, src: &Path, dst: &Path, chunk: usize) -> anyhow::Result<()> {
    anyhow::ensure!(chunk > 0, "chunk must be at least 1 byte");

    let reader =
        FileReader::open(src, runtime).with_context(|| format!("opening {}", src.display()))?;
    let writer =
        FileWriter::open(dst, runtime).with_context(|| format!("opening {}", dst.display()))?;

    let total = reader.size();
    let mut buffer = runtime.allocator().allocate(chunk)?;
    let start = Instant::now();
    let mut offset = 0u64;

    while offset < total {
        let read = reader.read_into(offset, &mut buffer)?;
        if read == 0 {
            break;
        }
        writer.write(&buffer, offset, read)?;
        offset += read as u64;
    }
    // An existing destination may be longer than what was copied.
    writer.set_len(offset)?;

    let elapsed = start.elapsed();
    info!(
        src = %src.display(),
        dst = %dst.display(),
        read_accelerated = reader.is_accelerated(),
        write_accelerated = writer.is_accelerated(),
        bytes = offset,
        mib_per_sec = throughput(offset, elapsed.as_secs_f64()),
        "Copy complete"
    );
    Ok(())
}

fn throughput(bytes: u64, secs: f64) -> f64 {
    if secs > 0.0 {
        bytes as f64 / (1024.0 * 1024.0) / secs
    } else {
        0.0
    }
}
