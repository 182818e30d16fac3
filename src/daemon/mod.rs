use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use cache::MetadataCache;
use sampling::SamplerModule;
use settings::{EngineSettings, SettingsHandle};
use storage::AggregationStore;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::{
    system_api,
    utils::clock::{Clock, DefaultClock},
};

pub mod args;
pub mod cache;
pub mod identity;
pub mod sampling;
pub mod settings;
pub mod shutdown;
pub mod storage;

pub const DATABASE_FILE: &str = "data.db";
pub const ICON_CACHE_FILE: &str = "icons.json";

/// Represents the starting point for the daemon.
pub async fn start_daemon(dir: PathBuf, initial_settings: EngineSettings) -> Result<()> {
    std::env::set_current_dir("/")?;

    let store = AggregationStore::new(dir.join(DATABASE_FILE))?;
    let caches = Arc::new(MetadataCache::load(dir.join(ICON_CACHE_FILE)).await);

    // The handle is the write side of the runtime configuration. It stays
    // alive for the whole daemon lifetime; a future command surface would
    // borrow it.
    let (settings_handle, settings) = SettingsHandle::new(initial_settings);

    let shutdown_token = CancellationToken::new();

    let sampler = create_sampler(
        store,
        caches.clone(),
        settings,
        &shutdown_token,
        DefaultClock,
    );

    let (_, sampler_result) = tokio::join!(
        shutdown::detect_shutdown(shutdown_token.clone()),
        sampler.run(),
    );

    if let Err(e) = sampler_result {
        error!("Sampling module got an error {:?}", e);
    }

    // Last chance for icons gathered since the previous debounce.
    caches.flush_if_dirty().await;

    drop(settings_handle);
    Ok(())
}

fn create_sampler(
    store: AggregationStore,
    caches: Arc<MetadataCache>,
    settings: watch::Receiver<EngineSettings>,
    shutdown_token: &CancellationToken,
    clock: impl Clock,
) -> SamplerModule {
    SamplerModule::new(
        store,
        system_api::foreground_probe(),
        system_api::input_observer(),
        system_api::process_probe(),
        caches,
        settings,
        shutdown_token.clone(),
        Box::new(clock),
    )
}

#[cfg(test)]
mod daemon_tests {
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
    use tempfile::tempdir;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use crate::{
        daemon::{
            cache::MetadataCache,
            sampling::SamplerModule,
            settings::{EngineSettings, SettingsHandle},
            storage::{AggregationStore, Scope},
        },
        system_api::{
            ForegroundWindow, InputEvent, InputSink, InputSubscription, MockForegroundProbe,
            MockInputObserver, MockProcessProbe, ProcessProbe, RawText,
        },
        utils::{clock::Clock, logging::TEST_LOGGING},
    };

    const TEST_START_DATE: NaiveDateTime =
        NaiveDateTime::new(NaiveDate::from_ymd_opt(2018, 7, 4).unwrap(), NaiveTime::MIN);

    #[derive(Clone)]
    struct TestClock {
        start_time: DateTime<Utc>,
        reference: Instant,
    }

    #[async_trait]
    impl Clock for TestClock {
        fn time(&self) -> DateTime<Utc> {
            self.start_time + self.reference.elapsed()
        }

        fn instant(&self) -> Instant {
            Instant::now()
        }

        async fn sleep_until(&self, instant: tokio::time::Instant) {
            tokio::time::sleep_until(instant).await;
        }
    }

    fn test_clock() -> TestClock {
        TestClock {
            start_time: Utc.from_utc_datetime(&TEST_START_DATE),
            reference: Instant::now(),
        }
    }

    struct TestSetup {
        _dir: tempfile::TempDir,
        store: AggregationStore,
        sampler: SamplerModule,
        settings_handle: SettingsHandle,
        shutdown: CancellationToken,
    }

    async fn setup(observer: MockInputObserver, probe: MockForegroundProbe) -> TestSetup {
        *TEST_LOGGING;
        let dir = tempdir().unwrap();
        let store = AggregationStore::new(dir.path().join("data.db")).unwrap();
        let caches = Arc::new(MetadataCache::load(dir.path().join("icons.json")).await);
        let (settings_handle, settings) = SettingsHandle::new(EngineSettings::default());
        let shutdown = CancellationToken::new();

        let mut processes = MockProcessProbe::new();
        processes.expect_running_process_names().returning(Vec::new);
        processes.expect_process_paths().returning(HashMap::new);
        processes.expect_icon_for().returning(|_, _| None);
        let processes: Arc<dyn ProcessProbe> = Arc::new(processes);

        let sampler = SamplerModule::new(
            store.clone(),
            Some(Box::new(probe)),
            Some(Box::new(observer)),
            processes,
            caches,
            settings,
            shutdown.clone(),
            Box::new(test_clock()),
        );

        TestSetup {
            _dir: dir,
            store,
            sampler,
            settings_handle,
            shutdown,
        }
    }

    fn capturing_observer(slot: Arc<Mutex<Option<InputSink>>>) -> MockInputObserver {
        let mut observer = MockInputObserver::new();
        observer.expect_subscribe().returning(move |sink| {
            *slot.lock().unwrap() = Some(sink);
            Ok(InputSubscription::noop())
        });
        observer
    }

    fn steady_probe(program: &'static str) -> MockForegroundProbe {
        let mut probe = MockForegroundProbe::new();
        probe.expect_active_window().returning(move || {
            Ok(Some(ForegroundWindow {
                process_id: None,
                window_class: RawText::Text(program.to_string()),
                window_title: RawText::Text(program.to_string()),
            }))
        });
        probe
    }

    /// Spins virtual time until `ready` reports true.
    async fn wait_for(mut ready: impl FnMut() -> bool) {
        while !ready() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Smoke test: the loop ticks, counts keystrokes, and lands rows in the
    /// store, all against simulated time.
    #[tokio::test(start_paused = true)]
    async fn smoke_test_sampler_loop() -> Result<()> {
        let slot = Arc::new(Mutex::new(None));
        let setup = setup(capturing_observer(slot.clone()), steady_probe("test")).await;

        let shutdown = setup.shutdown.clone();
        let run = tokio::spawn(setup.sampler.run());

        // Wait for the loop to seed and subscribe, then simulate typing.
        wait_for(|| slot.lock().unwrap().is_some()).await;
        {
            let sink = slot.lock().unwrap().clone().unwrap();
            for _ in 0..30 {
                sink(InputEvent::KeyDown);
            }
        }

        // Wait until the typing tick has landed in the store.
        loop {
            if !setup
                .store
                .activity_records_since(Scope::Minute, 0)
                .await?
                .is_empty()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        run.await??;

        let foreground = setup
            .store
            .foreground_records_since(Scope::Minute, 0)
            .await?;
        assert!(!foreground.is_empty());
        assert_eq!(foreground[0].program, "test");
        assert!(foreground.iter().map(|row| row.seconds).sum::<i64>() >= 5);

        let activity = setup.store.activity_records_since(Scope::Minute, 0).await?;
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].program, "test");
        assert_eq!(activity[0].event, "type");
        assert_eq!(activity[0].seconds, 5);
        Ok(())
    }

    /// Changing the interval re-subscribes exactly once, so listeners can't
    /// accumulate.
    #[tokio::test(start_paused = true)]
    async fn interval_change_rearms_the_observer() -> Result<()> {
        let subscribe_count = Arc::new(Mutex::new(0u32));
        let detach_count = Arc::new(Mutex::new(0u32));

        let mut observer = MockInputObserver::new();
        {
            let subscribe_count = subscribe_count.clone();
            let detach_count = detach_count.clone();
            observer.expect_subscribe().returning(move |_| {
                *subscribe_count.lock().unwrap() += 1;
                let detach_count = detach_count.clone();
                Ok(InputSubscription::new(move || {
                    *detach_count.lock().unwrap() += 1;
                }))
            });
        }

        let mut probe = MockForegroundProbe::new();
        probe.expect_active_window().returning(|| Ok(None));

        let setup = setup(observer, probe).await;
        let shutdown = setup.shutdown.clone();
        let settings_handle = setup.settings_handle;

        let run = tokio::spawn(setup.sampler.run());
        {
            let subscribe_count = subscribe_count.clone();
            wait_for(move || *subscribe_count.lock().unwrap() == 1).await;
        }

        settings_handle.set_check_interval(Duration::from_secs(2));
        {
            let subscribe_count = subscribe_count.clone();
            wait_for(move || *subscribe_count.lock().unwrap() == 2).await;
        }

        shutdown.cancel();
        run.await??;

        assert_eq!(*subscribe_count.lock().unwrap(), 2);
        // Both subscriptions were torn down: one on reconfigure, one on
        // shutdown.
        assert_eq!(*detach_count.lock().unwrap(), 2);
        Ok(())
    }

    /// Missing platform hooks are a soft failure: the loop idles until
    /// shutdown and never touches the store.
    #[tokio::test(start_paused = true)]
    async fn missing_capabilities_disable_sampling() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir().unwrap();
        let store = AggregationStore::new(dir.path().join("data.db")).unwrap();
        let caches = Arc::new(MetadataCache::load(dir.path().join("icons.json")).await);
        let (_settings_handle, settings) = SettingsHandle::new(EngineSettings::default());
        let shutdown = CancellationToken::new();

        let mut processes = MockProcessProbe::new();
        processes.expect_running_process_names().times(0);
        let processes: Arc<dyn ProcessProbe> = Arc::new(processes);

        let sampler = SamplerModule::new(
            store.clone(),
            None,
            None,
            processes,
            caches,
            settings,
            shutdown.clone(),
            Box::new(test_clock()),
        );

        let run = tokio::spawn(sampler.run());
        tokio::time::sleep(Duration::from_secs(30)).await;
        shutdown.cancel();
        run.await??;

        assert!(store
            .foreground_records_since(Scope::Minute, 0)
            .await?
            .is_empty());
        Ok(())
    }

    /// Subscriptions are detach-safe even when nothing was ever armed.
    #[test]
    fn subscription_teardown_is_safe_without_start() {
        let subscription = InputSubscription::noop();
        subscription.detach();

        let detached = Arc::new(Mutex::new(false));
        {
            let detached = detached.clone();
            let subscription = InputSubscription::new(move || {
                *detached.lock().unwrap() = true;
            });
            drop(subscription);
        }
        assert!(*detached.lock().unwrap());
    }
}
