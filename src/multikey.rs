use crate::entry::Namespace;
use parking_lot::Mutex;

/// Which indexed paths became multi-valued while applying a batch, per index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultikeyPathInfo {
    pub ns: Namespace,
    pub index_name: String,
    pub paths: Vec<String>,
}

/// Per-worker collector for multikey path changes. The storage engine reports
/// into it during apply; the worker drains it on exit and hands the paths
/// back to the scheduler.
#[derive(Default)]
pub struct MultikeyPathTracker {
    inner: Mutex<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    tracking: bool,
    paths: Vec<MultikeyPathInfo>,
}

impl MultikeyPathTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_tracking(&self) {
        self.inner.lock().tracking = true;
    }

    pub fn stop_tracking(&self) {
        self.inner.lock().tracking = false;
    }

    pub fn is_tracking(&self) -> bool {
        self.inner.lock().tracking
    }

    /// Records path info. Ignored unless tracking is active.
    pub fn add_path_info(&self, info: MultikeyPathInfo) {
        let mut state = self.inner.lock();
        if state.tracking {
            state.paths.push(info);
        }
    }

    pub fn drain(&self) -> Vec<MultikeyPathInfo> {
        std::mem::take(&mut self.inner.lock().paths)
    }
}
