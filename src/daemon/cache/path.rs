use std::{collections::HashMap, path::PathBuf, sync::Mutex, time::Duration};

use tracing::debug;

/// A full process-path enumeration is comparatively expensive, so it runs
/// at most this often.
const PATH_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

struct PathState {
    /// Keys are case-folded program names.
    entries: HashMap<String, PathBuf>,
    refreshed_at: Option<i64>,
}

/// Cache of program name → executable path. Entries are only ever
/// overwritten by a newer enumeration, never evicted.
pub struct PathCache {
    state: Mutex<PathState>,
}

impl PathCache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PathState {
                entries: HashMap::new(),
                refreshed_at: None,
            }),
        }
    }

    pub fn lookup(&self, program: &str) -> Option<PathBuf> {
        let state = self.state.lock().expect("path cache lock poisoned");
        state.entries.get(&program.to_lowercase()).cloned()
    }

    /// Runs `enumerate` and merges the result, unless a refresh already
    /// happened within [PATH_REFRESH_INTERVAL]. The lock is not held across
    /// the enumeration.
    pub fn refresh_if_stale(
        &self,
        now_ms: i64,
        enumerate: impl FnOnce() -> HashMap<String, PathBuf>,
    ) {
        {
            let state = self.state.lock().expect("path cache lock poisoned");
            let fresh = state
                .refreshed_at
                .is_some_and(|at| now_ms - at <= PATH_REFRESH_INTERVAL.as_millis() as i64);
            if fresh {
                return;
            }
        }

        let discovered = enumerate();
        debug!("Path enumeration found {} executables", discovered.len());

        let mut state = self.state.lock().expect("path cache lock poisoned");
        for (name, path) in discovered {
            state.entries.insert(name.to_lowercase(), path);
        }
        state.refreshed_at = Some(now_ms);
    }
}

impl Default for PathCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enumeration(pairs: &[(&str, &str)]) -> HashMap<String, PathBuf> {
        pairs
            .iter()
            .map(|(name, path)| (name.to_string(), PathBuf::from(path)))
            .collect()
    }

    #[test]
    fn refresh_populates_entries() {
        let cache = PathCache::new();
        cache.refresh_if_stale(0, || enumeration(&[("Firefox", "/usr/bin/firefox")]));
        assert_eq!(cache.lookup("firefox"), Some(PathBuf::from("/usr/bin/firefox")));
        assert_eq!(cache.lookup("FIREFOX"), Some(PathBuf::from("/usr/bin/firefox")));
    }

    #[test]
    fn refresh_is_rate_limited() {
        let cache = PathCache::new();
        cache.refresh_if_stale(0, || enumeration(&[("a", "/bin/a")]));
        // Within the interval the closure must not run.
        cache.refresh_if_stale(1_000, || panic!("refreshed too early"));
        assert_eq!(cache.lookup("a"), Some(PathBuf::from("/bin/a")));
    }

    #[test]
    fn stale_entries_are_overwritten_not_evicted() {
        let cache = PathCache::new();
        cache.refresh_if_stale(0, || enumeration(&[("a", "/bin/a"), ("b", "/bin/b")]));
        let past = PATH_REFRESH_INTERVAL.as_millis() as i64 + 1;
        cache.refresh_if_stale(past, || enumeration(&[("a", "/opt/a")]));
        // "a" was replaced, "b" survives even though the newer enumeration
        // didn't mention it.
        assert_eq!(cache.lookup("a"), Some(PathBuf::from("/opt/a")));
        assert_eq!(cache.lookup("b"), Some(PathBuf::from("/bin/b")));
    }
}
