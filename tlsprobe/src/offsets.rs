//! # Shared Offsets Store
//!
//! Analysis results are published to the `OFFSETS_DATA` eBPF map, keyed by
//! binary identity, before any hook of that binary is attached: the hook
//! programs look up the struct layout of the binary they fire in.
//!
//! [`OffsetsPublisher`] sits between the manager and the store. It remembers
//! which registry generation wrote each entry so that a late rollback of an
//! unloaded generation cannot delete the entry of a newer one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use aya::maps::HashMap as BpfHashMap;
use aya::Ebpf;
use log::{debug, error};
use tlsprobe_common::{
    TlsBinaryId, TlsConnLayout, TlsOffsetsData, GO_ABI_REGISTER, GO_ABI_STACK, OFFSETS_DATA_MAP,
};

use crate::analysis::{lookup, AnalysisResult, FieldSpec, GoAbi};
use crate::domain::{BinaryId, Generation, OffsetsError};
use crate::registry::BinaryRegistry;

/// Side channel read by the hook programs
pub trait OffsetsStore: Send + Sync {
    /// Verify the store is usable before any process is handled
    ///
    /// # Errors
    /// Returns [`OffsetsError`] if the backing storage is missing.
    fn check(&self) -> Result<(), OffsetsError> {
        Ok(())
    }

    /// Write (or overwrite) the entry of `id`
    ///
    /// # Errors
    /// Returns [`OffsetsError`] if the result cannot be encoded or written.
    fn put(&self, id: BinaryId, result: &AnalysisResult) -> Result<(), OffsetsError>;

    /// Remove the entry of `id`
    ///
    /// # Errors
    /// Returns [`OffsetsError`] if the entry cannot be removed.
    fn delete(&self, id: BinaryId) -> Result<(), OffsetsError>;
}

/// Encode an analysis result in the layout the hook programs expect
///
/// # Errors
/// Returns [`OffsetsError::Encode`] if a required field offset is missing.
pub fn offsets_data(id: BinaryId, result: &AnalysisResult) -> Result<TlsOffsetsData, OffsetsError> {
    let field = |spec: FieldSpec| {
        result.field_offset(&spec).ok_or_else(|| OffsetsError::Encode {
            binary: id,
            reason: format!("missing offset of {spec}"),
        })
    };

    Ok(TlsOffsetsData {
        conn_layout: TlsConnLayout {
            tls_conn_inner_conn_offset: field(lookup::TLS_CONN_INNER_CONN)?,
            tcp_conn_inner_conn_offset: field(lookup::TCP_CONN_INNER_CONN)?,
            conn_fd_offset: field(lookup::CONN_FD)?,
            net_fd_pfd_offset: field(lookup::NET_FD_PFD)?,
            fd_sysfd_offset: field(lookup::FD_SYSFD)?,
        },
        go_version_major: result.go_version.major,
        go_version_minor: result.go_version.minor,
        abi: match result.abi {
            GoAbi::Stack => GO_ABI_STACK,
            GoAbi::Register => GO_ABI_REGISTER,
        },
        _padding: [0; 3],
    })
}

/// [`OffsetsStore`] backed by the `OFFSETS_DATA` eBPF hash map
pub struct EbpfOffsetsStore {
    bpf: Arc<Mutex<Ebpf>>,
}

impl EbpfOffsetsStore {
    /// # Errors
    /// Returns [`OffsetsError::MapNotFound`] if the loaded object has no `OFFSETS_DATA` map.
    pub fn new(bpf: Arc<Mutex<Ebpf>>) -> Result<Self, OffsetsError> {
        let store = Self { bpf };
        store.check()?;
        Ok(store)
    }

    fn with_map<T>(
        &self,
        op: impl FnOnce(&mut BpfHashMap<&mut aya::maps::MapData, TlsBinaryId, TlsOffsetsData>) -> T,
    ) -> Result<T, String> {
        let mut guard = self.bpf.lock().unwrap_or_else(PoisonError::into_inner);
        let map = guard.map_mut(OFFSETS_DATA_MAP).ok_or_else(|| format!("{OFFSETS_DATA_MAP} map not found"))?;
        let mut map = BpfHashMap::try_from(map).map_err(|e| e.to_string())?;
        Ok(op(&mut map))
    }
}

impl OffsetsStore for EbpfOffsetsStore {
    fn check(&self) -> Result<(), OffsetsError> {
        let guard = self.bpf.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.map(OFFSETS_DATA_MAP) {
            Some(_) => Ok(()),
            None => Err(OffsetsError::MapNotFound(OFFSETS_DATA_MAP.to_string())),
        }
    }

    fn put(&self, id: BinaryId, result: &AnalysisResult) -> Result<(), OffsetsError> {
        let data = offsets_data(id, result)?;
        let key = id.to_map_key();
        self.with_map(|map| map.insert(key, data, 0).map_err(|e| e.to_string()))
            .and_then(|r| r)
            .map_err(|error| OffsetsError::Write { binary: id, error })
    }

    fn delete(&self, id: BinaryId) -> Result<(), OffsetsError> {
        let key = id.to_map_key();
        self.with_map(|map| map.remove(&key).map_err(|e| e.to_string()))
            .and_then(|r| r)
            .map_err(|error| OffsetsError::Delete { binary: id, error })
    }
}

/// Generation-aware front of an [`OffsetsStore`]
///
/// Lock order: the ledger is taken before the registry, never after.
pub struct OffsetsPublisher {
    store: Arc<dyn OffsetsStore>,
    owners: Mutex<HashMap<BinaryId, Generation>>,
}

impl OffsetsPublisher {
    #[must_use]
    pub fn new(store: Arc<dyn OffsetsStore>) -> Self {
        Self { store, owners: Mutex::new(HashMap::new()) }
    }

    /// # Errors
    /// Returns the store's error if it is unusable.
    pub fn check(&self) -> Result<(), OffsetsError> {
        self.store.check()
    }

    /// Write `result` for `generation` of `id`
    ///
    /// Returns `Ok(false)` without writing if the generation is no longer
    /// live in `registry` (its last process exited during analysis).
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn publish(
        &self,
        registry: &BinaryRegistry,
        id: BinaryId,
        generation: Generation,
        result: &AnalysisResult,
    ) -> Result<bool, OffsetsError> {
        let mut owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
        if !registry.is_current(id, generation) {
            return Ok(false);
        }
        self.store.put(id, result)?;
        owners.insert(id, generation);
        Ok(true)
    }

    /// Remove the entry of `id` if `generation` wrote it
    ///
    /// Returns whether an entry was removed. Store failures are logged.
    pub fn retract(&self, id: BinaryId, generation: Generation) -> bool {
        let mut owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
        if owners.get(&id) != Some(&generation) {
            return false;
        }
        owners.remove(&id);
        if let Err(e) = self.store.delete(id) {
            error!("could not remove inspection result for {id}: {e}");
        }
        debug!("removed offsets of {id} ({generation})");
        true
    }
}
