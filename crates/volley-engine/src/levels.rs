//! Per-toss log level overrides on top of a process-wide log filter.
//!
//! Tosses that run concurrently share one filter. [`LogLevelOverrides`] keeps
//! the live overrides in start order: the newest one is in force, and the
//! baseline filter comes back only when the last override ends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::level_filters::LevelFilter;

/// Switches the process-wide log filter.
pub trait LogLevelControl: Send + Sync {
    /// Put every target at `level`.
    fn apply(&self, level: LevelFilter);

    /// Reinstate the filter that was in force before any override, including
    /// its per-target directives.
    fn reset(&self);
}

/// Live overrides of one [`LogLevelControl`].
pub struct LogLevelOverrides {
    control: Arc<dyn LogLevelControl>,
    active: Mutex<Vec<(u64, LevelFilter)>>,
    next_id: AtomicU64,
}

impl LogLevelOverrides {
    pub fn new(control: Arc<dyn LogLevelControl>) -> Self {
        Self {
            control,
            active: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Start an override. It ends when the returned guard is dropped, also
    /// during unwinding.
    pub fn push(self: &Arc<Self>, level: LevelFilter) -> LevelGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.push((id, level));
        self.control.apply(level);
        LevelGuard {
            overrides: Arc::clone(self),
            id,
        }
    }

    /// Number of overrides still in force.
    pub fn depth(&self) -> usize {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn release(&self, id: u64) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let Some(pos) = active.iter().position(|(live, _)| *live == id) else {
            return;
        };
        let was_newest = pos + 1 == active.len();
        active.remove(pos);
        match active.last() {
            None => self.control.reset(),
            Some((_, level)) if was_newest => self.control.apply(*level),
            Some(_) => {}
        }
    }
}

/// Ends its override on drop.
pub struct LevelGuard {
    overrides: Arc<LogLevelOverrides>,
    id: u64,
}

impl Drop for LevelGuard {
    fn drop(&mut self) {
        self.overrides.release(self.id);
    }
}
