//! # Instrumentation Manager
//!
//! Keeps Go TLS uprobes attached to every running Go binary.
//!
//! ## Process start
//!
//! ```text
//! exec(pid) ─▶ resolve /proc/<pid>/exe ─▶ excluded / own pid? ─▶ skip
//!                     │
//!                     ▼
//!              negative cache hit? ─▶ skip
//!                     │
//!                     ▼
//!              registry.register_process
//!                     │ previous count == 0
//!                     ▼
//!              background thread:  analyze ─▶ publish offsets ─▶ attach hooks ─▶ store handles
//! ```
//!
//! Exactly one process per binary generation gets a previous count of 0, so
//! each binary is analyzed once no matter how many processes run it.
//!
//! ## Process exit
//!
//! The exiting pid is deregistered. When it was the last process of its
//! binary, the binary's hooks are detached and its offsets entry removed.
//!
//! ## Races with background work
//!
//! Analysis runs without any lock held. Every step that mutates shared state
//! afterwards (publishing offsets, storing handles) re-checks that the binary
//! generation it was started for is still live, and undoes its own work if it
//! is not. Reconciliation periodically synthesizes exits for tracked pids the
//! event source reports dead, in case exit notifications were lost.
//!
//! Stopping closes the registry before anything else, which turns every
//! generation stale and refuses registrations still on their way in.

use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{bounded, select, tick, Sender};
use log::{debug, info, warn};

use crate::analysis::{lookup, BinaryAnalyzer};
use crate::cache::NegativeCache;
use crate::config::ManagerConfig;
use crate::domain::{AnalysisError, BinaryId, Generation, ManagerError, Pid};
use crate::events::{ProcessEventSource, Subscription};
use crate::hooks::{attach_hooks, detach_hooks, HookAttacher};
use crate::offsets::{OffsetsPublisher, OffsetsStore};
use crate::process_lookup::{BinaryResolver, Resolution, ResolvedBinary};
use crate::registry::{BinaryRegistry, Deregistration, Registration};

/// Counters describing the manager's activity
#[derive(Debug, Default)]
struct ManagerStats {
    processes_registered: AtomicU64,
    binaries_hooked: AtomicU64,
    analysis_failures: AtomicU64,
    negative_cache_hits: AtomicU64,
    attach_failures: AtomicU64,
    hooks_attached: AtomicU64,
    hooks_detached: AtomicU64,
    reconciled_exits: AtomicU64,
    analysis_time_ms: AtomicU64,
}

/// Point-in-time copy of the manager counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub processes_registered: u64,
    /// Binaries analyzed and hooked successfully
    pub binaries_hooked: u64,
    pub analysis_failures: u64,
    pub negative_cache_hits: u64,
    /// Attempts rolled back after analysis succeeded
    pub attach_failures: u64,
    pub hooks_attached: u64,
    pub hooks_detached: u64,
    /// Exits synthesized by reconciliation
    pub reconciled_exits: u64,
    /// Cumulative time spent analyzing and attaching
    pub analysis_time_ms: u64,
}

impl ManagerStats {
    fn incr(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processes_registered: self.processes_registered.load(Ordering::Relaxed),
            binaries_hooked: self.binaries_hooked.load(Ordering::Relaxed),
            analysis_failures: self.analysis_failures.load(Ordering::Relaxed),
            negative_cache_hits: self.negative_cache_hits.load(Ordering::Relaxed),
            attach_failures: self.attach_failures.load(Ordering::Relaxed),
            hooks_attached: self.hooks_attached.load(Ordering::Relaxed),
            hooks_detached: self.hooks_detached.load(Ordering::Relaxed),
            reconciled_exits: self.reconciled_exits.load(Ordering::Relaxed),
            analysis_time_ms: self.analysis_time_ms.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processes: {}, binaries hooked: {} ({} ms), analysis failures: {}, cache hits: {}, \
             attach failures: {}, hooks: {} attached / {} detached, reconciled exits: {}",
            self.processes_registered,
            self.binaries_hooked,
            self.analysis_time_ms,
            self.analysis_failures,
            self.negative_cache_hits,
            self.attach_failures,
            self.hooks_attached,
            self.hooks_detached,
            self.reconciled_exits,
        )
    }
}

struct Reconciler {
    done: Sender<()>,
    handle: JoinHandle<()>,
}

/// Attaches and detaches TLS hooks as processes come and go
pub struct InstrumentationManager {
    config: ManagerConfig,
    resolver: BinaryResolver,
    registry: BinaryRegistry,
    negative_cache: NegativeCache,
    offsets: OffsetsPublisher,
    source: Arc<dyn ProcessEventSource>,
    analyzer: Arc<dyn BinaryAnalyzer>,
    attacher: Arc<dyn HookAttacher>,
    own_pid: Pid,
    stats: ManagerStats,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<Subscription>>,
    reconciler: Mutex<Option<Reconciler>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl InstrumentationManager {
    /// # Errors
    /// Returns [`ManagerError::InvalidConfig`] if `config` does not validate.
    pub fn new(
        config: ManagerConfig,
        source: Arc<dyn ProcessEventSource>,
        analyzer: Arc<dyn BinaryAnalyzer>,
        attacher: Arc<dyn HookAttacher>,
        offsets: Arc<dyn OffsetsStore>,
    ) -> Result<Self, ManagerError> {
        config.validate()?;
        Ok(Self {
            resolver: BinaryResolver::new(&config)?,
            negative_cache: NegativeCache::new(config.negative_cache_capacity),
            registry: BinaryRegistry::new(),
            offsets: OffsetsPublisher::new(offsets),
            source,
            analyzer,
            attacher,
            own_pid: Pid(std::process::id()),
            stats: ManagerStats::default(),
            tasks: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            reconciler: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            config,
        })
    }

    /// Subscribe to process events and start the reconciliation ticker
    ///
    /// A disabled manager returns `Ok` without doing anything.
    ///
    /// # Errors
    /// Fails if the offsets store is unusable or the event source refuses the
    /// subscription; the manager is then left unstarted.
    pub fn start(self: &Arc<Self>) -> Result<(), ManagerError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ManagerError::Stopped);
        }
        if !self.config.enabled {
            info!("TLS instrumentation disabled");
            return Ok(());
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ManagerError::AlreadyStarted);
        }

        if let Err(e) = self.subscribe_and_tick() {
            self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner).clear();
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        info!("TLS instrumentation started (reconciling every {:?})", self.config.scan_interval);
        Ok(())
    }

    fn subscribe_and_tick(self: &Arc<Self>) -> Result<(), ManagerError> {
        self.offsets.check()?;

        let weak = Arc::downgrade(self);
        let on_exec = self.source.subscribe_exec(Arc::new(move |pid| {
            if let Some(manager) = weak.upgrade() {
                manager.handle_process_start(pid);
            }
        }))?;
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner).push(on_exec);

        let weak = Arc::downgrade(self);
        let on_exit = self.source.subscribe_exit(Arc::new(move |pid| {
            if let Some(manager) = weak.upgrade() {
                manager.handle_process_exit(pid);
            }
        }))?;
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner).push(on_exit);

        let (done_tx, done_rx) = bounded::<()>(0);
        let weak: Weak<Self> = Arc::downgrade(self);
        let ticker = tick(self.config.scan_interval);
        let handle = thread::Builder::new().name("tlsprobe-reconcile".into()).spawn(move || loop {
            select! {
                recv(done_rx) -> _ => break,
                recv(ticker) -> _ => match weak.upgrade() {
                    Some(manager) => manager.reconcile(),
                    None => break,
                },
            }
        })?;
        *self.reconciler.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Reconciler { done: done_tx, handle });
        Ok(())
    }

    /// Tear everything down: no hook or offsets entry survives this call
    ///
    /// Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // Starts already past the stop flag are refused from here on, and
        // analyses in flight see their generation go stale
        self.registry.close();

        let reconciler = self.reconciler.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(Reconciler { done, handle }) = reconciler {
            drop(done);
            if handle.join().is_err() {
                warn!("reconciliation thread panicked");
            }
        }

        let subscriptions: Vec<Subscription> =
            self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect();
        for subscription in subscriptions {
            subscription.cancel();
        }
        if self.started.load(Ordering::SeqCst) {
            self.source.stop();
        }

        self.exit_all();
        self.join_tasks();

        info!("TLS instrumentation stopped ({})", self.stats());
    }

    fn exit_all(&self) {
        for pid in self.registry.tracked_pids() {
            self.handle_process_exit(pid);
        }
    }

    fn join_tasks(&self) {
        loop {
            let tasks: Vec<JoinHandle<()>> =
                self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect();
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                if task.join().is_err() {
                    warn!("binary analysis thread panicked");
                }
            }
        }
    }

    /// React to `pid` executing a new image
    pub fn handle_process_start(self: &Arc<Self>, pid: Pid) {
        if self.stopped.load(Ordering::SeqCst) || pid == self.own_pid {
            return;
        }

        let binary = match self.resolver.resolve(pid) {
            Resolution::Found(binary) => binary,
            Resolution::Excluded | Resolution::NotFound => return,
        };

        // Re-exec into another image: the old binary loses this process even
        // if the new one is never hooked
        if self.registry.binary_of(pid).is_some_and(|previous| previous != binary.id) {
            debug!("{pid} re-executed {}", binary.exe_path.display());
            self.handle_process_exit(pid);
        }

        if self.negative_cache.contains(&binary.id) {
            ManagerStats::incr(&self.stats.negative_cache_hits, 1);
            return;
        }

        let registration = match self.registry.register_process(pid, binary.id) {
            Registration::AlreadyTracked(id) if id == binary.id => return,
            Registration::AlreadyTracked(previous) => {
                debug!("{pid} re-executed ({previous} -> {})", binary.id);
                self.handle_process_exit(pid);
                self.registry.register_process(pid, binary.id)
            }
            added @ Registration::Added { .. } => added,
            Registration::Refused => {
                debug!("ignoring {pid}, instrumentation is shutting down");
                return;
            }
        };
        let Registration::Added { previous_count, generation } = registration else {
            return;
        };
        ManagerStats::incr(&self.stats.processes_registered, 1);
        if previous_count > 0 {
            return;
        }

        let id = binary.id;
        let manager = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("tlsprobe-hook-{}", pid.0))
            .spawn(move || manager.hook_new_binary(pid, &binary, generation));
        match spawned {
            Ok(handle) => {
                let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
                tasks.retain(|task| !task.is_finished());
                tasks.push(handle);
            }
            Err(e) => {
                warn!("could not spawn analysis thread for {pid}: {e}");
                self.abandon(pid, id, generation);
            }
        }
    }

    /// Analyze a binary seen for the first time in this generation and hook it
    fn hook_new_binary(&self, pid: Pid, binary: &ResolvedBinary, generation: Generation) {
        let id = binary.id;
        let start = Instant::now();

        let analysis = File::open(&binary.host_path)
            .map_err(AnalysisError::from)
            .and_then(|file| self.analyzer.inspect(&file, &lookup::FUNCTIONS, &lookup::STRUCT_FIELDS));
        let result = match analysis {
            Ok(result) => result,
            Err(e) => {
                ManagerStats::incr(&self.stats.analysis_failures, 1);
                if e.is_not_instrumentable() {
                    self.negative_cache.add(id);
                } else {
                    debug!("could not hook new binary ({id}) {} for {pid}: {e}", binary.host_path.display());
                }
                self.abandon(pid, id, generation);
                return;
            }
        };

        match self.offsets.publish(&self.registry, id, generation, &result) {
            Ok(true) => {}
            Ok(false) => {
                debug!("{id} unloaded before hooks could be attached for {pid}");
                return;
            }
            Err(e) => {
                ManagerStats::incr(&self.stats.attach_failures, 1);
                debug!("could not publish offsets of {id} for {pid}: {e}");
                self.abandon(pid, id, generation);
                return;
            }
        }

        if !self.registry.is_current(id, generation) {
            debug!("{id} unloaded before attachment, discarding offsets");
            self.offsets.retract(id, generation);
            return;
        }

        let handles = match attach_hooks(&*self.attacher, &result, &lookup::FUNCTIONS, &binary.host_path) {
            Ok(handles) => handles,
            Err(e) => {
                ManagerStats::incr(&self.stats.attach_failures, 1);
                debug!("error while attaching hooks on {} for {pid}: {e}", binary.host_path.display());
                self.offsets.retract(id, generation);
                self.abandon(pid, id, generation);
                return;
            }
        };

        let count = handles.len() as u64;
        if self.registry.store_handles(id, generation, handles.clone()) {
            let elapsed = start.elapsed();
            ManagerStats::incr(&self.stats.hooks_attached, count);
            ManagerStats::incr(&self.stats.binaries_hooked, 1);
            ManagerStats::incr(
                &self.stats.analysis_time_ms,
                u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            );
            debug!(
                "attached {count} hooks on {} ({id}, {} {:?} ABI) in {elapsed:?}",
                binary.host_path.display(),
                result.go_version,
                result.abi,
            );
        } else {
            // Last process exited while hooks were being attached
            debug!("{id} unloaded during attachment, rolling back {count} hooks");
            let detached = detach_hooks(&*self.attacher, &handles);
            ManagerStats::incr(&self.stats.hooks_detached, detached as u64);
            self.offsets.retract(id, generation);
        }
    }

    /// Undo the registration that made `pid` the owner of this analysis
    fn abandon(&self, pid: Pid, id: BinaryId, generation: Generation) {
        if let Some(dereg) = self.registry.deregister_owned(pid, id, generation) {
            self.teardown(dereg);
        }
    }

    /// React to `pid` exiting
    pub fn handle_process_exit(&self, pid: Pid) {
        if let Some(dereg) = self.registry.deregister_process(pid) {
            self.teardown(dereg);
        }
    }

    /// Release the hooks and offsets of a binary whose last process is gone
    fn teardown(&self, dereg: Deregistration) {
        if dereg.new_count > 0 {
            return;
        }
        let detached = detach_hooks(&*self.attacher, &dereg.handles);
        ManagerStats::incr(&self.stats.hooks_detached, detached as u64);
        self.offsets.retract(dereg.id, dereg.generation);
        if !dereg.handles.is_empty() {
            debug!("detached {detached} hooks on {}", dereg.id);
        }
    }

    /// Synthesize exits for tracked processes that are no longer running
    pub fn reconcile(&self) {
        let tracked = self.registry.tracked_pids();
        if tracked.is_empty() {
            return;
        }
        let dead = self.source.find_dead_processes(&tracked);
        for &pid in &dead {
            self.handle_process_exit(pid);
        }
        if !dead.is_empty() {
            ManagerStats::incr(&self.stats.reconciled_exits, dead.len() as u64);
            debug!("reconciled {} dead processes out of {}", dead.len(), tracked.len());
        }
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Pids currently counted by the registry
    #[must_use]
    pub fn tracked_processes(&self) -> HashSet<Pid> {
        self.registry.tracked_pids()
    }

    #[must_use]
    pub fn binary_process_count(&self, id: BinaryId) -> usize {
        self.registry.process_count(id)
    }

    #[must_use]
    pub fn registry(&self) -> &BinaryRegistry {
        &self.registry
    }

    #[must_use]
    pub fn negative_cache(&self) -> &NegativeCache {
        &self.negative_cache
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }
}
