//! Pre-flight checks for tlsprobe
//!
//! Validates system requirements before attempting to load eBPF programs.
//! Provides clear, actionable error messages when requirements aren't met.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};
use std::path::Path;

/// Minimum kernel version for uprobes attached by file offset through perf
const MIN_KERNEL_VERSION: (u32, u32) = (4, 17);

/// Run all pre-flight checks before eBPF loading
///
/// # Errors
/// Returns an error describing the first unmet requirement.
pub fn run_preflight_checks(ebpf_object: &Path, proc_root: &Path) -> Result<()> {
    check_privileges()?;
    check_kernel_version()?;
    check_ebpf_object(ebpf_object)?;
    check_proc_root(proc_root)?;
    Ok(())
}

/// Check if running with sufficient privileges for eBPF
fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    bail!(
        "Permission denied: tlsprobe requires root privileges to load eBPF programs \
         and read other processes' executables.\n\n\
         Run with: sudo tlsprobe ..."
    );
}

/// Check if the kernel version is sufficient for offset-based uprobes
fn check_kernel_version() -> Result<()> {
    let version_str = std::fs::read_to_string("/proc/version")
        .context("Failed to read kernel version from /proc/version")?;

    let release = version_str.split_whitespace().nth(2).unwrap_or("unknown");
    let Some((major, minor)) = parse_kernel_release(release) else {
        // Can't parse, assume it's fine
        return Ok(());
    };

    if (major, minor) < MIN_KERNEL_VERSION {
        bail!(
            "Kernel version {major}.{minor} is too old.\n\n\
             tlsprobe requires Linux {}.{} or newer for uprobe attachment by file offset.\n\
             Current kernel: {release}",
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
        );
    }

    Ok(())
}

/// `(major, minor)` of a release string like `6.1.0-arch1-1`
fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor))
}

/// Check that the eBPF object exists and is a readable file
fn check_ebpf_object(path: &Path) -> Result<()> {
    if !path.exists() {
        bail!(
            "eBPF object not found: {}\n\n\
             Build the probes first, or point --ebpf-object at the compiled object.",
            path.display()
        );
    }
    if !path.is_file() {
        bail!(
            "Not a file: {}\n\n\
             --ebpf-object must point to a compiled eBPF object, not a directory.",
            path.display()
        );
    }
    std::fs::File::open(path).with_context(|| format!("Cannot read eBPF object {}", path.display()))?;
    Ok(())
}

/// Check that procfs is mounted where we expect it
fn check_proc_root(proc_root: &Path) -> Result<()> {
    std::fs::read_dir(proc_root).with_context(|| {
        format!(
            "Cannot list {}\n\n\
             Is procfs mounted? Use --proc-root if it lives elsewhere.",
            proc_root.display()
        )
    })?;
    Ok(())
}
