use std::{collections::HashMap, path::PathBuf, sync::Mutex, time::Duration};

use anyhow::Result;
use fs4::tokio::AsyncFileExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Programs without a resolvable icon are retried after this long. An icon
/// can become available later, for example once the executable path has
/// been learned.
const NEGATIVE_ICON_TTL: Duration = Duration::from_secs(30 * 60);

/// Quiet period before a scheduled flush hits the disk.
pub const FLUSH_DEBOUNCE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IconEntry {
    /// Opaque icon payload; `None` records that the platform had nothing.
    pub data: Option<Vec<u8>>,
    pub updated_at: i64,
}

struct IconState {
    /// Keys are case-folded program names.
    entries: HashMap<String, IconEntry>,
    dirty: bool,
    /// Bumped on every store so a flush can tell whether writes raced it.
    version: u64,
}

/// Icon cache with debounced persistence. The only cache that survives a
/// restart; everything else is rebuilt from the running system.
pub struct IconCache {
    file_path: PathBuf,
    state: Mutex<IconState>,
    flush_pending: Mutex<bool>,
}

impl IconCache {
    /// Loads the persisted cache. A missing or corrupt file starts empty;
    /// losing cached icons is never worth failing startup over.
    pub async fn load(file_path: PathBuf) -> Self {
        let entries = match tokio::fs::read(&file_path).await {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, IconEntry>>(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Icon cache file {file_path:?} is corrupted, starting empty: {e}");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        debug!("Loaded {} cached icons", entries.len());

        Self {
            file_path,
            state: Mutex::new(IconState {
                entries,
                dirty: false,
                version: 0,
            }),
            flush_pending: Mutex::new(false),
        }
    }

    pub fn entry(&self, program: &str) -> Option<IconEntry> {
        let state = self.state.lock().expect("icon cache lock poisoned");
        state.entries.get(&program.to_lowercase()).cloned()
    }

    /// Whether a platform fetch attempt is warranted for this program.
    pub fn needs_fetch(&self, program: &str, now_ms: i64) -> bool {
        match self.entry(program) {
            None => true,
            Some(IconEntry { data: Some(_), .. }) => false,
            Some(IconEntry {
                data: None,
                updated_at,
            }) => now_ms - updated_at > NEGATIVE_ICON_TTL.as_millis() as i64,
        }
    }

    pub fn store(&self, program: &str, data: Option<Vec<u8>>, now_ms: i64) {
        let mut state = self.state.lock().expect("icon cache lock poisoned");
        state.entries.insert(
            program.to_lowercase(),
            IconEntry {
                data,
                updated_at: now_ms,
            },
        );
        state.dirty = true;
        state.version += 1;
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().expect("icon cache lock poisoned").dirty
    }

    /// Claims the single flush slot. Returns false when a flush is already
    /// pending, so bursts of stores coalesce into one write.
    pub fn try_begin_flush(&self) -> bool {
        let mut pending = self.flush_pending.lock().expect("flush flag lock poisoned");
        if *pending {
            return false;
        }
        *pending = true;
        true
    }

    pub fn end_flush(&self) {
        *self.flush_pending.lock().expect("flush flag lock poisoned") = false;
    }

    /// Serializes the whole cache to disk. On failure the dirty flag stays
    /// set so the write is retried on the next schedule or at shutdown.
    pub async fn flush_now(&self) -> Result<()> {
        let (snapshot, version) = {
            let state = self.state.lock().expect("icon cache lock poisoned");
            if !state.dirty {
                return Ok(());
            }
            (state.entries.clone(), state.version)
        };

        self.write_snapshot(&snapshot).await?;

        let mut state = self.state.lock().expect("icon cache lock poisoned");
        // A store may have raced the write; only mark clean if nothing did.
        if state.version == version {
            state.dirty = false;
        }
        Ok(())
    }

    async fn write_snapshot(&self, snapshot: &HashMap<String, IconEntry>) -> Result<()> {
        let bytes = serde_json::to_vec(snapshot)?;

        let mut file = tokio::fs::File::create(&self.file_path).await?;
        file.lock_exclusive()?;
        let write_result = async {
            file.write_all(&bytes).await?;
            file.flush().await?;
            Ok::<_, std::io::Error>(())
        }
        .await;
        file.unlock_async().await?;
        write_result?;

        debug!("Flushed {} icons to {:?}", snapshot.len(), self.file_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn positive_entries_stop_fetching() {
        let dir = tempdir().unwrap();
        let cache = IconCache::load(dir.path().join("icons.json")).await;
        assert!(cache.needs_fetch("firefox", 0));
        cache.store("Firefox", Some(vec![1, 2, 3]), 0);
        assert!(!cache.needs_fetch("firefox", i64::MAX / 2));
    }

    #[tokio::test]
    async fn negative_entries_expire() {
        let dir = tempdir().unwrap();
        let cache = IconCache::load(dir.path().join("icons.json")).await;
        cache.store("firefox", None, 0);
        assert!(!cache.needs_fetch("firefox", 1_000));
        let past_ttl = NEGATIVE_ICON_TTL.as_millis() as i64 + 1;
        assert!(cache.needs_fetch("firefox", past_ttl));
    }

    #[tokio::test]
    async fn flush_round_trips_through_the_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("icons.json");

        let cache = IconCache::load(file.clone()).await;
        cache.store("Firefox", Some(vec![9, 8, 7]), 42);
        cache.flush_now().await.unwrap();
        assert!(!cache.is_dirty());

        let reloaded = IconCache::load(file).await;
        assert_eq!(
            reloaded.entry("firefox"),
            Some(IconEntry {
                data: Some(vec![9, 8, 7]),
                updated_at: 42
            })
        );
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("icons.json");
        tokio::fs::write(&file, b"{not json").await.unwrap();

        let cache = IconCache::load(file).await;
        assert_eq!(cache.entry("anything"), None);
    }

    #[tokio::test]
    async fn failed_flush_keeps_the_dirty_flag() {
        let dir = tempdir().unwrap();
        // Pointing the cache at a directory makes the create fail.
        let cache = IconCache::load(dir.path().to_path_buf()).await;
        cache.store("firefox", None, 0);

        assert!(cache.flush_now().await.is_err());
        assert!(cache.is_dirty());
    }

    #[tokio::test]
    async fn flush_slot_is_single_flight() {
        let dir = tempdir().unwrap();
        let cache = IconCache::load(dir.path().join("icons.json")).await;

        assert!(cache.try_begin_flush());
        assert!(!cache.try_begin_flush());
        cache.end_flush();
        assert!(cache.try_begin_flush());
    }
}
