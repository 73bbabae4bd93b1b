//! Exported targets and the target registry
//!
//! One [`Target`] exists per exported iSCSI name and couples the name with
//! its [`BlockStore`]. The [`TargetRegistry`] is the name-keyed table the
//! server consults at login and discovery time.

use crate::error::{IscsiError, ScsiResult};
use crate::storage::BlockStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Window over which throughput is averaged
const PERFORMANCE_WINDOW: Duration = Duration::from_secs(5);

/// Throughput bookkeeping over a sliding window.
///
/// Each completed transfer contributes a (bytes, start, end) point; points
/// older than the window are discarded when the rate is queried.
#[derive(Debug, Default)]
pub struct TargetPerformance {
    points: Mutex<Vec<(u64, Instant, Instant)>>,
}

impl TargetPerformance {
    pub fn add_point(&self, bytes_transferred: u64, start: Instant, end: Instant) {
        if let Ok(mut points) = self.points.lock() {
            points.push((bytes_transferred, start, end));
        }
    }

    /// Average bytes per second over the window, 0 when idle
    pub fn bytes_per_second(&self) -> u64 {
        let now = Instant::now();
        let Ok(mut points) = self.points.lock() else {
            return 0;
        };
        points.retain(|(_, _, end)| now.duration_since(*end) < PERFORMANCE_WINDOW);
        let total: u64 = points.iter().map(|(b, _, _)| *b).sum();
        total / PERFORMANCE_WINDOW.as_secs()
    }
}

/// One exported target: an iSCSI name, an optional alias and a block store
pub struct Target {
    name: String,
    alias: Option<String>,
    store: Arc<dyn BlockStore>,
    read_performance: TargetPerformance,
    write_performance: TargetPerformance,
    /// Live sessions referencing this target; guards removal
    session_count: AtomicUsize,
}

impl Target {
    pub fn new(name: String, alias: Option<String>, store: Arc<dyn BlockStore>) -> Self {
        Target {
            name,
            alias,
            store,
            read_performance: TargetPerformance::default(),
            write_performance: TargetPerformance::default(),
            session_count: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    pub fn add_read_point(&self, bytes: u64, start: Instant, end: Instant) {
        self.read_performance.add_point(bytes, start, end);
    }

    pub fn add_write_point(&self, bytes: u64, start: Instant, end: Instant) {
        self.write_performance.add_point(bytes, start, end);
    }

    pub fn bytes_read_per_second(&self) -> u64 {
        self.read_performance.bytes_per_second()
    }

    pub fn bytes_written_per_second(&self) -> u64 {
        self.write_performance.bytes_per_second()
    }

    pub(crate) fn acquire(&self) {
        self.session_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release(&self) {
        self.session_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Number of live sessions bound to this target
    pub fn session_count(&self) -> usize {
        self.session_count.load(Ordering::SeqCst)
    }
}

/// Table of exported targets, keyed by target name.
///
/// Lookups take the shared lock; add/remove take the write lock. Removing a
/// target that still has bound sessions is refused.
#[derive(Default)]
pub struct TargetRegistry {
    targets: RwLock<HashMap<String, Arc<Target>>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target. Fails if the name is already exported.
    pub fn add(&self, target: Target) -> ScsiResult<()> {
        let mut targets = self
            .targets
            .write()
            .map_err(|_| IscsiError::Session("target registry lock poisoned".to_string()))?;
        if targets.contains_key(target.name()) {
            return Err(IscsiError::Config(format!(
                "duplicate target name: {}",
                target.name()
            )));
        }
        targets.insert(target.name().to_string(), Arc::new(target));
        Ok(())
    }

    /// Look up a target by name
    pub fn lookup(&self, name: &str) -> Option<Arc<Target>> {
        self.targets.read().ok()?.get(name).cloned()
    }

    /// All exported target names, in no particular order
    pub fn names(&self) -> Vec<String> {
        self.targets
            .read()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove a target. Refused while any session references it.
    pub fn remove(&self, name: &str) -> ScsiResult<()> {
        let mut targets = self
            .targets
            .write()
            .map_err(|_| IscsiError::Session("target registry lock poisoned".to_string()))?;
        match targets.get(name) {
            None => Err(IscsiError::Session(format!("target not found: {name}"))),
            Some(t) if t.session_count() > 0 => Err(IscsiError::Session(format!(
                "target {name} is in use by {} session(s)",
                t.session_count()
            ))),
            Some(_) => {
                targets.remove(name);
                Ok(())
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.targets.read().map(|t| t.is_empty()).unwrap_or(true)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
