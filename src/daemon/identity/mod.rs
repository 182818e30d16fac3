//! Turns raw window observations into the stable program identifier used
//! everywhere downstream. Window-class strings are unreliable (arbitrary
//! encodings, browser-dependent casing), so the resolver prefers the
//! process table when a pid is available and falls back to decoding the
//! class string otherwise.

pub mod encoding;

use std::sync::Arc;

use crate::{
    daemon::cache::MetadataCache,
    system_api::{ForegroundWindow, ProcessProbe},
};

const EXECUTABLE_SUFFIX: &str = ".exe";

pub struct IdentityResolver {
    caches: Arc<MetadataCache>,
    processes: Arc<dyn ProcessProbe>,
}

impl IdentityResolver {
    pub fn new(caches: Arc<MetadataCache>, processes: Arc<dyn ProcessProbe>) -> Self {
        Self { caches, processes }
    }

    /// Resolves an observation to a program name. Returns `None` when
    /// neither the process table nor the window class yields anything
    /// usable.
    pub fn resolve(&self, window: &ForegroundWindow, now_ms: i64) -> Option<String> {
        if let Some(pid) = window.process_id {
            match self.caches.pid_name(pid, now_ms) {
                Some(Some(name)) => return Some(name),
                // Cached negative: the lookup failed recently, don't repeat
                // it, go straight to the fallback.
                Some(None) => {}
                None => {
                    let name = self
                        .processes
                        .name_by_pid(pid)
                        .map(|raw| normalize_program(&encoding::decode(&raw)))
                        .filter(|name| !name.is_empty());
                    self.caches.store_pid_name(pid, name.clone(), now_ms);
                    if let Some(name) = name {
                        return Some(name);
                    }
                }
            }
        }

        let fallback = normalize_program(&encoding::decode(&window.window_class));
        (!fallback.is_empty()).then_some(fallback)
    }
}

/// Trims and strips the platform executable suffix. Case is preserved;
/// callers that need a case-insensitive key fold it themselves.
pub fn normalize_program(name: &str) -> String {
    let trimmed = name.trim();
    let len = trimmed.len();
    if len > EXECUTABLE_SUFFIX.len()
        && trimmed.is_char_boundary(len - EXECUTABLE_SUFFIX.len())
        && trimmed[len - EXECUTABLE_SUFFIX.len()..].eq_ignore_ascii_case(EXECUTABLE_SUFFIX)
    {
        trimmed[..len - EXECUTABLE_SUFFIX.len()].to_string()
    } else {
        trimmed.to_string()
    }
}
