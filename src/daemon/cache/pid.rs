use std::{collections::HashMap, sync::Mutex, time::Duration};

/// Pids are recycled by the OS, so entries must expire rather than live for
/// the process lifetime.
const PID_TTL: Duration = Duration::from_secs(5 * 60);

struct PidEntry {
    /// `None` records a failed lookup so it isn't repeated every tick.
    name: Option<String>,
    cached_at: i64,
}

/// Cache of pid → resolved program name lookups.
pub struct PidCache {
    entries: Mutex<HashMap<u32, PidEntry>>,
}

impl PidCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Outer `None` is a miss; `Some(None)` is a cached negative result.
    pub fn lookup(&self, pid: u32, now_ms: i64) -> Option<Option<String>> {
        let entries = self.entries.lock().expect("pid cache lock poisoned");
        let entry = entries.get(&pid)?;
        if now_ms - entry.cached_at > PID_TTL.as_millis() as i64 {
            return None;
        }
        Some(entry.name.clone())
    }

    pub fn store(&self, pid: u32, name: Option<String>, now_ms: i64) {
        let mut entries = self.entries.lock().expect("pid cache lock poisoned");
        entries.insert(
            pid,
            PidEntry {
                name,
                cached_at: now_ms,
            },
        );
    }
}

impl Default for PidCache {
    fn default() -> Self {
        Self::new()
    }
}
