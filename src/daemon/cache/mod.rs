//! Small bounded caches sitting next to the sampling loop. Each has its own
//! refresh policy; none of them sits on the database path. Entries are
//! mutated only through the methods here, reads are shared with the
//! identity resolver and the sampler.

pub mod icon;
pub mod path;
pub mod pid;

use std::{path::PathBuf, sync::Arc};

use icon::IconCache;
use path::PathCache;
use pid::PidCache;
use tracing::warn;

use crate::system_api::ProcessProbe;

pub struct MetadataCache {
    icons: IconCache,
    paths: PathCache,
    pids: PidCache,
}

impl MetadataCache {
    pub async fn load(icon_file: PathBuf) -> Self {
        Self {
            icons: IconCache::load(icon_file).await,
            paths: PathCache::new(),
            pids: PidCache::new(),
        }
    }

    pub fn pid_name(&self, pid: u32, now_ms: i64) -> Option<Option<String>> {
        self.pids.lookup(pid, now_ms)
    }

    pub fn store_pid_name(&self, pid: u32, name: Option<String>, now_ms: i64) {
        self.pids.store(pid, name, now_ms);
    }

    pub fn path_for(&self, program: &str) -> Option<PathBuf> {
        self.paths.lookup(program)
    }

    pub fn icon_entry(&self, program: &str) -> Option<icon::IconEntry> {
        self.icons.entry(program)
    }

    /// Warms the path and icon caches for a program just seen in the
    /// foreground. Runs as a spawned task; the sampling tick never waits
    /// for it.
    pub async fn warm(self: Arc<Self>, program: String, probe: Arc<dyn ProcessProbe>, now_ms: i64) {
        self.paths
            .refresh_if_stale(now_ms, || probe.process_paths());

        if self.icons.needs_fetch(&program, now_ms) {
            let path = self.paths.lookup(&program);
            let icon = probe.icon_for(&program, path);
            self.icons.store(&program, icon, now_ms);
            self.schedule_flush();
        }
    }

    /// Schedules a debounced flush of the icon cache. At most one flush is
    /// pending at a time; a burst of stores produces a single write.
    pub fn schedule_flush(self: &Arc<Self>) {
        if !self.icons.try_begin_flush() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(icon::FLUSH_DEBOUNCE).await;
            if let Err(e) = this.icons.flush_now().await {
                warn!("Failed to flush icon cache {e:?}");
            }
            this.icons.end_flush();
        });
    }

    /// Final chance to persist icons, called on shutdown.
    pub async fn flush_if_dirty(&self) {
        if !self.icons.is_dirty() {
            return;
        }
        if let Err(e) = self.icons.flush_now().await {
            warn!("Failed to flush icon cache during shutdown {e:?}");
        }
    }
}
