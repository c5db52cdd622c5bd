//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{ManagerConfig, DEFAULT_EXCLUDE_PATTERN};

#[derive(Parser, Debug)]
#[command(
    name = "tlsprobe",
    about = "Attach TLS uprobes to every running Go binary",
    after_help = "\
EXAMPLES:
    sudo tlsprobe --ebpf-object ./tlsprobe.o                 Hook all Go binaries
    sudo tlsprobe --ebpf-object ./tlsprobe.o --no-scan-existing
                                                            Only hook processes started from now on
    sudo tlsprobe --ebpf-object ./tlsprobe.o --exclude '(^|/)sidecar$'"
)]
pub struct Args {
    /// Compiled eBPF object exposing the TLS uprobe programs and the OFFSETS_DATA map
    #[arg(long, value_name = "FILE", env = "TLSPROBE_EBPF_OBJECT")]
    pub ebpf_object: PathBuf,

    /// Mount point of procfs
    #[arg(long, value_name = "DIR", default_value = "/proc", env = "TLSPROBE_PROC_ROOT")]
    pub proc_root: PathBuf,

    /// Seconds between two dead-process reconciliation passes
    #[arg(long, value_name = "SECS", default_value = "30", env = "TLSPROBE_SCAN_INTERVAL")]
    pub scan_interval: u64,

    /// Milliseconds between two scans of the process table
    #[arg(long, value_name = "MS", default_value = "250", env = "TLSPROBE_POLL_INTERVAL")]
    pub poll_interval: u64,

    /// Binaries remembered as not instrumentable (0 = no cache)
    #[arg(long, value_name = "N", default_value = "1000", env = "TLSPROBE_NEGATIVE_CACHE_SIZE")]
    pub negative_cache_size: usize,

    /// Regex of executable paths never to instrument
    #[arg(long, value_name = "REGEX", default_value = DEFAULT_EXCLUDE_PATTERN, env = "TLSPROBE_EXCLUDE")]
    pub exclude: String,

    /// Ignore processes already running at startup
    #[arg(long)]
    pub no_scan_existing: bool,

    /// Load nothing and exit (instrumentation switched off)
    #[arg(long, env = "TLSPROBE_DISABLE")]
    pub disable: bool,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Build the manager configuration from the parsed arguments
    #[must_use]
    pub fn to_config(&self) -> ManagerConfig {
        ManagerConfig {
            enabled: !self.disable,
            proc_root: self.proc_root.clone(),
            scan_interval: Duration::from_secs(self.scan_interval),
            poll_interval: Duration::from_millis(self.poll_interval),
            negative_cache_capacity: self.negative_cache_size,
            exclude_pattern: self.exclude.clone(),
            scan_existing: !self.no_scan_existing,
            ..ManagerConfig::default()
        }
    }
}
