//! # Hook Attachment
//!
//! Installs and removes the uprobes of one binary.
//!
//! [`attach_hooks`] is transactional: either every hook of the probe table is
//! installed, or none is left behind.

pub mod uprobe;

use std::path::Path;

use log::{debug, error};
use tlsprobe_common::{
    PROBE_CONN_CLOSE, PROBE_CONN_READ, PROBE_CONN_READ_RETURN, PROBE_CONN_WRITE,
    PROBE_CONN_WRITE_RETURN,
};

use crate::analysis::lookup::{CLOSE_FUNC, READ_FUNC, WRITE_FUNC};
use crate::analysis::{AnalysisResult, FunctionSpec};
use crate::domain::{AttachError, HookHandle, ProbeKind};

pub use uprobe::AyaAttacher;

/// Kernel-level hook service
///
/// Handles are opaque to callers. `detach` must accept any subset of the
/// handles issued so far, in any order.
pub trait HookAttacher: Send + Sync {
    /// Install the probe program of `function`/`kind` at `offset` of the file at `binary_path`
    ///
    /// # Errors
    /// Returns [`AttachError`] if the program is unknown or the kernel refuses the probe.
    fn attach(
        &self,
        binary_path: &Path,
        function: &str,
        offset: u64,
        kind: ProbeKind,
    ) -> Result<HookHandle, AttachError>;

    /// Remove a previously installed hook
    ///
    /// # Errors
    /// Returns [`AttachError`] if the handle is unknown or the kernel call fails.
    fn detach(&self, handle: HookHandle) -> Result<(), AttachError>;
}

/// eBPF programs attached to one Go function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionProbes {
    pub function: &'static str,
    /// Program for the function entry
    pub entry: Option<&'static str>,
    /// Program for every return instruction
    pub ret: Option<&'static str>,
}

pub static PROBE_TABLE: [FunctionProbes; 3] = [
    FunctionProbes {
        function: READ_FUNC,
        entry: Some(PROBE_CONN_READ),
        ret: Some(PROBE_CONN_READ_RETURN),
    },
    FunctionProbes {
        function: WRITE_FUNC,
        entry: Some(PROBE_CONN_WRITE),
        ret: Some(PROBE_CONN_WRITE_RETURN),
    },
    FunctionProbes { function: CLOSE_FUNC, entry: Some(PROBE_CONN_CLOSE), ret: None },
];

/// Probe programs of `function`
#[must_use]
pub fn probes_for(function: &str) -> Option<&'static FunctionProbes> {
    PROBE_TABLE.iter().find(|probes| probes.function == function)
}

/// Name of the program hooked at `kind` of `function`
#[must_use]
pub fn program_for(function: &str, kind: ProbeKind) -> Option<&'static str> {
    let probes = probes_for(function)?;
    match kind {
        ProbeKind::Entry => probes.entry,
        ProbeKind::Return => probes.ret,
    }
}

/// Every program name in the probe table
pub fn all_programs() -> impl Iterator<Item = &'static str> {
    PROBE_TABLE.iter().flat_map(|probes| probes.entry.into_iter().chain(probes.ret))
}

/// Install every hook for `functions` on the binary at `binary_path`
///
/// Return locations are hooked before the entry so that a function never
/// runs with an entry hook whose matching return hook is missing. On the
/// first failure every hook installed so far is detached again.
///
/// # Errors
/// Returns the first [`AttachError`] after rolling back.
pub fn attach_hooks(
    attacher: &dyn HookAttacher,
    result: &AnalysisResult,
    functions: &[FunctionSpec],
    binary_path: &Path,
) -> Result<Vec<HookHandle>, AttachError> {
    let mut handles = Vec::new();
    match attach_all(attacher, result, functions, binary_path, &mut handles) {
        Ok(()) => Ok(handles),
        Err(e) => {
            debug!("rolling back {} hooks on {}: {e}", handles.len(), binary_path.display());
            detach_hooks(attacher, &handles);
            Err(e)
        }
    }
}

fn attach_all(
    attacher: &dyn HookAttacher,
    result: &AnalysisResult,
    functions: &[FunctionSpec],
    binary_path: &Path,
    handles: &mut Vec<HookHandle>,
) -> Result<(), AttachError> {
    for spec in functions {
        let probes = probes_for(spec.name)
            .ok_or_else(|| AttachError::ProgramNotFound(spec.name.to_string()))?;
        if spec.include_returns && probes.ret.is_none() {
            return Err(AttachError::MissingReturnProbe(spec.name.to_string()));
        }
        let location = result
            .function(spec.name)
            .ok_or_else(|| AttachError::MissingFunction(spec.name.to_string()))?;

        if spec.include_returns {
            for &offset in &location.returns {
                handles.push(attacher.attach(binary_path, spec.name, offset, ProbeKind::Return)?);
            }
        }
        if probes.entry.is_some() {
            handles.push(attacher.attach(binary_path, spec.name, location.entry, ProbeKind::Entry)?);
        }
    }
    Ok(())
}

/// Detach every handle, logging failures
///
/// The kernel may already have dropped a probe together with its process,
/// so failures are not propagated. Returns the number of hooks removed.
pub fn detach_hooks(attacher: &dyn HookAttacher, handles: &[HookHandle]) -> usize {
    let mut detached = 0;
    for &handle in handles {
        match attacher.detach(handle) {
            Ok(()) => detached += 1,
            Err(e) => error!("failed detaching {handle}: {e}"),
        }
    }
    detached
}
