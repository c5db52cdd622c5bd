//! # tlsprobe - Main Entry Point
//!
//! Loads the TLS uprobe programs, then keeps them attached to every running
//! Go binary until interrupted with Ctrl+C.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use aya::Ebpf;
use aya_log::EbpfLogger;
use clap::Parser;
use log::{info, warn};

use tlsprobe::analysis::ElfAnalyzer;
use tlsprobe::cli::Args;
use tlsprobe::events::ProcPoller;
use tlsprobe::hooks::AyaAttacher;
use tlsprobe::manager::InstrumentationManager;
use tlsprobe::offsets::EbpfOffsetsStore;
use tlsprobe::preflight::run_preflight_checks;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);
    std::process::exit(match run(args) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else if msg.contains("invalid configuration") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

#[tokio::main]
async fn run(args: Args) -> Result<()> {
    let config = args.to_config();
    if !config.enabled {
        info!("TLS instrumentation disabled, nothing to do");
        return Ok(());
    }
    config.validate()?;

    run_preflight_checks(&args.ebpf_object, &config.proc_root)?;

    // ── Load probes and shared map ──────────────────────────────────────
    let mut bpf = Ebpf::load_file(&args.ebpf_object)
        .with_context(|| format!("Failed to load eBPF object {}", args.ebpf_object.display()))?;
    if let Err(e) = EbpfLogger::init(&mut bpf) {
        warn!("Failed to initialize eBPF logger: {e}");
    }
    let bpf = Arc::new(Mutex::new(bpf));

    let attacher =
        Arc::new(AyaAttacher::new(Arc::clone(&bpf)).context("Failed to load uprobe programs")?);
    let offsets = EbpfOffsetsStore::new(Arc::clone(&bpf)).context("Failed to open offsets map")?;

    // ── Wire the manager to the /proc event source ──────────────────────
    let poller = Arc::new(ProcPoller::new(&config));
    let manager = Arc::new(InstrumentationManager::new(
        config,
        poller.clone(),
        Arc::new(ElfAnalyzer::new()),
        attacher.clone(),
        Arc::new(offsets),
    )?);

    manager.start().context("Failed to start TLS instrumentation")?;
    if let Err(e) = poller.start() {
        manager.stop();
        return Err(e).context("Failed to start process polling");
    }

    println!("tlsprobe v{}", env!("CARGO_PKG_VERSION"));
    println!("watching for Go binaries (Ctrl+C to stop)");

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;

    // Manager teardown blocks on joins, keep it off the async workers
    let stopping = Arc::clone(&manager);
    tokio::task::spawn_blocking(move || stopping.stop()).await.context("Shutdown task failed")?;

    let leftover = attacher.attached_count();
    if leftover > 0 {
        warn!("{leftover} uprobes still attached after shutdown");
    }

    let stats = manager.stats();
    eprintln!("\nstopped: {stats}");
    Ok(())
}
