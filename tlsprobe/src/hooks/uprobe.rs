//! aya-backed [`HookAttacher`]
//!
//! Every program of the probe table is loaded into the kernel once. Each
//! attachment creates a new uprobe link on one of those programs; the link id
//! is kept behind an opaque [`HookHandle`] until it is detached.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use aya::programs::uprobe::UProbeLinkId;
use aya::programs::UProbe;
use aya::Ebpf;
use log::{debug, info};

use super::{all_programs, program_for, HookAttacher};
use crate::domain::{AttachError, HookHandle, ProbeKind};

pub struct AyaAttacher {
    bpf: Arc<Mutex<Ebpf>>,
    links: Mutex<HashMap<HookHandle, (&'static str, UProbeLinkId)>>,
    next_handle: AtomicU64,
}

impl AyaAttacher {
    /// Load every uprobe program of the probe table
    ///
    /// # Errors
    /// Fails if a program is missing from the object or rejected by the verifier.
    pub fn new(bpf: Arc<Mutex<Ebpf>>) -> Result<Self, AttachError> {
        {
            let mut guard = bpf.lock().unwrap_or_else(PoisonError::into_inner);
            for name in all_programs() {
                let program = uprobe(&mut guard, name)?;
                program.load().map_err(|e| AttachError::Load {
                    program: name.to_string(),
                    error: e.to_string(),
                })?;
                info!("✓ Loaded uprobe program: {name}");
            }
        }

        Ok(Self { bpf, links: Mutex::new(HashMap::new()), next_handle: AtomicU64::new(1) })
    }

    /// Number of hooks currently installed
    #[must_use]
    pub fn attached_count(&self) -> usize {
        self.links.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn uprobe<'a>(bpf: &'a mut Ebpf, name: &str) -> Result<&'a mut UProbe, AttachError> {
    bpf.program_mut(name)
        .ok_or_else(|| AttachError::ProgramNotFound(name.to_string()))?
        .try_into()
        .map_err(|e: aya::programs::ProgramError| AttachError::Load {
            program: name.to_string(),
            error: e.to_string(),
        })
}

impl HookAttacher for AyaAttacher {
    fn attach(
        &self,
        binary_path: &Path,
        function: &str,
        offset: u64,
        kind: ProbeKind,
    ) -> Result<HookHandle, AttachError> {
        let program = program_for(function, kind)
            .ok_or_else(|| AttachError::ProgramNotFound(format!("{function} ({kind})")))?;

        let link_id = {
            let mut guard = self.bpf.lock().unwrap_or_else(PoisonError::into_inner);
            uprobe(&mut guard, program)?.attach(None, offset, binary_path, None).map_err(|e| {
                AttachError::Attach {
                    program: program.to_string(),
                    kind,
                    binary: binary_path.display().to_string(),
                    offset,
                    error: e.to_string(),
                }
            })?
        };

        let handle = HookHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.links.lock().unwrap_or_else(PoisonError::into_inner).insert(handle, (program, link_id));
        debug!("attached {program} at 0x{offset:x} of {} as {handle}", binary_path.display());
        Ok(handle)
    }

    fn detach(&self, handle: HookHandle) -> Result<(), AttachError> {
        let (program, link_id) = self
            .links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle)
            .ok_or(AttachError::UnknownHandle(handle))?;

        let mut guard = self.bpf.lock().unwrap_or_else(PoisonError::into_inner);
        uprobe(&mut guard, program)?
            .detach(link_id)
            .map_err(|e| AttachError::Detach { handle, error: e.to_string() })
    }
}
