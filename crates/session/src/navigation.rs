//! Navigation dispatch
//!
//! Decides whether a redirect target stays inside the application (history
//! push plus a synchronous "location changed" signal) or leaves it (full
//! navigation). An unparseable target cannot be shown to be same-origin, so
//! it is treated as external and handed over verbatim.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;
use url::{Position, Url};

/// Outcome of resolving a target against the application origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    /// Same origin: path, query and fragment to push into history.
    InApp { path: String },
    /// Different origin or unparseable: full navigation to this target.
    External { url: String },
}

/// Resolve `target` (absolute or origin-relative) against `origin`.
pub fn resolve(origin: &Url, target: &str) -> Navigation {
    match origin.join(target) {
        Ok(url) if url.origin() == origin.origin() => Navigation::InApp {
            path: url[Position::BeforePath..].to_string(),
        },
        Ok(url) => Navigation::External { url: url.into() },
        Err(e) => {
            debug!(target, error = %e, "unparseable navigation target, treating as external");
            Navigation::External {
                url: target.to_string(),
            }
        }
    }
}

/// The host's navigation primitives.
pub trait Navigator: Send + Sync {
    /// Push a same-origin path into history without reloading.
    fn push_history(&self, path: &str);

    /// Tell in-app routing that the location changed.
    fn notify_location_changed(&self);

    /// Full navigation to an absolute URL.
    fn assign(&self, url: &str);
}

/// Resolve `target` and perform the matching navigation. Failures are not
/// retried; callers that need confirmation observe the resulting location.
pub fn navigate(navigator: &dyn Navigator, origin: &Url, target: &str) {
    match resolve(origin, target) {
        Navigation::InApp { path } => {
            navigator.push_history(&path);
            navigator.notify_location_changed();
        }
        Navigation::External { url } => navigator.assign(&url),
    }
}

type Listener = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct HistoryState {
    entries: Vec<String>,
    external: Vec<String>,
}

/// In-memory history with synchronous location listeners.
///
/// Useful wherever there is no browser: tests, and server hosts that
/// translate navigations into HTTP redirects.
pub struct MemoryHistory {
    state: Mutex<HistoryState>,
    listeners: Mutex<Vec<Listener>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HistoryState::default()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Register a listener called with the current path on every location change.
    /// Listeners may navigate again from inside the callback.
    pub fn subscribe(&self, listener: impl Fn(&str) + Send + Sync + 'static) {
        lock(&self.listeners).push(Arc::new(listener));
    }

    /// Current in-app path, if any in-app navigation happened.
    pub fn current_path(&self) -> Option<String> {
        lock(&self.state).entries.last().cloned()
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.state).entries.clone()
    }

    /// Full navigations, oldest first.
    pub fn external_navigations(&self) -> Vec<String> {
        lock(&self.state).external.clone()
    }
}

impl Default for MemoryHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl Navigator for MemoryHistory {
    fn push_history(&self, path: &str) {
        lock(&self.state).entries.push(path.to_string());
    }

    fn notify_location_changed(&self) {
        let Some(path) = self.current_path() else {
            return;
        };
        // Called outside the lock so a listener can navigate or subscribe
        let listeners: Vec<Listener> = lock(&self.listeners).clone();
        for listener in listeners {
            listener(&path);
        }
    }

    fn assign(&self, url: &str) {
        lock(&self.state).external.push(url.to_string());
    }
}

// Every mutation is a single push, so a poisoned table is still consistent.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
