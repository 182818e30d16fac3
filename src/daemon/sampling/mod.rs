//! The sampling loop. On a fixed wall-clock cadence it drains the input
//! accumulator, asks the platform what is focused and what is running,
//! classifies the slice, and drives the aggregation store. Everything here
//! degrades per tick: a failed probe or a failed write costs at most one
//! tick's contribution.

pub mod accumulator;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use accumulator::{InputAccumulator, InputCounts};
use anyhow::Result;
use futures::future::join_all;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    daemon::{
        cache::MetadataCache,
        identity::{encoding, normalize_program, IdentityResolver},
        settings::EngineSettings,
        storage::{ActivityEvent, AggregationStore, Scope},
    },
    system_api::{ForegroundProbe, InputObserver, InputSink, InputSubscription, ProcessProbe},
    utils::clock::Clock,
};

enum Wake {
    Shutdown,
    SettingsChanged(bool),
    Tick,
}

pub struct SamplerModule {
    store: AggregationStore,
    probe: Option<Box<dyn ForegroundProbe>>,
    observer: Option<Box<dyn InputObserver>>,
    processes: Arc<dyn ProcessProbe>,
    resolver: IdentityResolver,
    caches: Arc<MetadataCache>,
    accumulator: Arc<InputAccumulator>,
    settings: watch::Receiver<EngineSettings>,
    shutdown: CancellationToken,
    clock: Box<dyn Clock>,
    /// Case-folded name → display name of every program ever seen in the
    /// foreground. Membership makes a running program background-eligible.
    seen_foreground: HashMap<String, String>,
}

impl SamplerModule {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: AggregationStore,
        probe: Option<Box<dyn ForegroundProbe>>,
        observer: Option<Box<dyn InputObserver>>,
        processes: Arc<dyn ProcessProbe>,
        caches: Arc<MetadataCache>,
        settings: watch::Receiver<EngineSettings>,
        shutdown: CancellationToken,
        clock: Box<dyn Clock>,
    ) -> Self {
        let resolver = IdentityResolver::new(caches.clone(), processes.clone());
        Self {
            store,
            probe,
            observer,
            processes,
            resolver,
            caches,
            accumulator: Arc::new(InputAccumulator::new()),
            settings,
            shutdown,
            clock,
            seen_foreground: HashMap::new(),
        }
    }

    /// Executes the sampling event loop until shutdown. Missing platform
    /// capabilities disable sampling permanently with a single warning;
    /// the daemon itself stays up.
    pub async fn run(mut self) -> Result<()> {
        let (Some(mut probe), Some(mut observer)) = (self.probe.take(), self.observer.take())
        else {
            warn!("Activity tracking is disabled because platform hooks are unavailable");
            self.shutdown.cancelled().await;
            return Ok(());
        };

        self.seed_seen_foreground().await;

        let mut subscription = match subscribe(observer.as_mut(), &self.accumulator) {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!("Activity tracking is disabled, input hooks failed to attach {e:?}");
                self.shutdown.cancelled().await;
                return Ok(());
            }
        };

        let mut interval = self.settings.borrow().check_interval;
        let mut next_tick = self.clock.instant() + interval;
        info!("Sampling every {interval:?}");

        loop {
            let wake = tokio::select! {
                _ = self.shutdown.cancelled() => Wake::Shutdown,
                changed = self.settings.changed() => Wake::SettingsChanged(changed.is_ok()),
                _ = self.clock.sleep_until(next_tick) => Wake::Tick,
            };

            match wake {
                Wake::Shutdown => {
                    subscription.detach();
                    return Ok(());
                }
                Wake::SettingsChanged(false) => {
                    // Every settings handle is gone; nothing can ever
                    // reconfigure or resume us.
                    subscription.detach();
                    return Ok(());
                }
                Wake::SettingsChanged(true) => {
                    let current = *self.settings.borrow_and_update();
                    if current.check_interval == interval {
                        continue;
                    }
                    interval = current.check_interval;
                    // Full teardown and re-arm. Detaching before
                    // re-subscribing guarantees listeners never accumulate.
                    subscription.detach();
                    subscription = match subscribe(observer.as_mut(), &self.accumulator) {
                        Ok(subscription) => subscription,
                        Err(e) => {
                            warn!("Input hooks failed to re-attach, sampling disabled {e:?}");
                            self.shutdown.cancelled().await;
                            return Ok(());
                        }
                    };
                    next_tick = self.clock.instant() + interval;
                    info!("Check interval changed to {interval:?}");
                }
                Wake::Tick => {
                    next_tick += interval;
                    self.tick(probe.as_mut(), interval).await;
                }
            }
        }
    }

    /// Background eligibility survives restarts through the persisted
    /// foreground rows.
    async fn seed_seen_foreground(&mut self) {
        match self.store.list_foreground_programs().await {
            Ok(programs) => {
                for program in programs {
                    self.seen_foreground
                        .insert(program.to_lowercase(), program);
                }
                debug!(
                    "Seeded {} background-eligible programs",
                    self.seen_foreground.len()
                );
            }
            Err(e) => error!("Failed to seed foreground programs {e:?}"),
        }
    }

    async fn tick(&mut self, probe: &mut dyn ForegroundProbe, interval: Duration) {
        if !self.settings.borrow().recording {
            // Events gathered while paused must not leak into the next
            // recorded tick.
            self.accumulator.drain();
            return;
        }

        // The single logical read-and-clear: everything arriving after this
        // line belongs to the next tick.
        let counts = self.accumulator.drain();
        let now_ms = self.clock.now_ms();
        let seconds = interval.as_secs() as i64;

        let window = match probe.active_window() {
            Ok(window) => window,
            Err(e) => {
                error!("Foreground probe failed {e:?}");
                None
            }
        };
        let Some(window) = window else {
            debug!("No focused window this tick");
            return;
        };

        let resolved = self.resolver.resolve(&window, now_ms);
        let title = encoding::decode(&window.window_title);

        if let Some(program) = &resolved {
            self.seen_foreground
                .insert(program.to_lowercase(), program.clone());

            let increments = Scope::ALL.map(|scope| {
                let store = self.store.clone();
                let program = program.clone();
                async move {
                    store
                        .increment_foreground_record(
                            scope,
                            scope.bucket_start(now_ms),
                            &program,
                            seconds,
                        )
                        .await
                }
            });
            for result in join_all(increments).await {
                if let Err(e) = result {
                    error!("Failed to store foreground record {e:?}");
                }
            }

            // Fire and forget; the tick never waits on metadata.
            tokio::spawn(self.caches.clone().warm(
                program.clone(),
                self.processes.clone(),
                now_ms,
            ));

            self.record_background(program, now_ms, seconds).await;
        }

        if !counts.is_empty() {
            let program = resolved.unwrap_or_default();
            let event = classify(counts, seconds);
            let increments = Scope::ALL.map(|scope| {
                let store = self.store.clone();
                let program = program.clone();
                let title = title.clone();
                async move {
                    store
                        .increment_activity_record(
                            scope,
                            scope.bucket_start(now_ms),
                            &program,
                            &title,
                            event,
                            seconds,
                        )
                        .await
                }
            });
            for result in join_all(increments).await {
                if let Err(e) = result {
                    error!("Failed to store activity record {e:?}");
                }
            }
        }
    }

    /// Credits running programs that were foreground once but aren't now.
    async fn record_background(&mut self, current_program: &str, now_ms: i64, seconds: i64) {
        let running = self.processes.running_process_names();
        if running.is_empty() {
            return;
        }

        let current_key = current_program.to_lowercase();
        let mut handled = HashSet::new();
        let mut eligible = Vec::new();
        for name in running {
            let key = normalize_program(&name).to_lowercase();
            if key.is_empty() || key == current_key || !handled.insert(key.clone()) {
                continue;
            }
            if let Some(display) = self.seen_foreground.get(&key) {
                eligible.push(display.clone());
            }
        }

        let increments = eligible.iter().flat_map(|program| {
            Scope::ALL.map(|scope| {
                let store = self.store.clone();
                let program = program.clone();
                async move {
                    store
                        .increment_background_record(
                            scope,
                            scope.bucket_start(now_ms),
                            &program,
                            seconds,
                        )
                        .await
                }
            })
        });
        for result in join_all(increments).await {
            if let Err(e) = result {
                error!("Failed to store background record {e:?}");
            }
        }
    }
}

fn subscribe(
    observer: &mut dyn InputObserver,
    accumulator: &Arc<InputAccumulator>,
) -> Result<InputSubscription> {
    let accumulator = accumulator.clone();
    let sink: InputSink = Arc::new(move |event| accumulator.record(event));
    observer.subscribe(sink)
}

/// A slice counts as typing when there were more keystrokes than seconds in
/// the interval; anything else is reading/pointing.
fn classify(counts: InputCounts, interval_secs: i64) -> ActivityEvent {
    if counts.keystrokes as i64 > interval_secs {
        ActivityEvent::Type
    } else {
        ActivityEvent::Read
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use tokio::time::Instant;

    use crate::{
        daemon::settings::SettingsHandle,
        system_api::{
            ForegroundWindow, InputEvent, MockForegroundProbe, MockProcessProbe, RawText,
        },
        utils::logging::TEST_LOGGING,
    };

    use super::*;

    const INTERVAL: Duration = Duration::from_secs(5);
    // 2024-03-15T13:45:31.250Z
    const TEST_NOW_MS: i64 = 1_710_510_331_250;

    struct FixedClock;

    #[async_trait::async_trait]
    impl Clock for FixedClock {
        fn time(&self) -> chrono::DateTime<chrono::Utc> {
            chrono::DateTime::from_timestamp_millis(TEST_NOW_MS).unwrap()
        }

        fn instant(&self) -> Instant {
            Instant::now()
        }

        async fn sleep_until(&self, instant: tokio::time::Instant) {
            tokio::time::sleep_until(instant).await;
        }
    }

    fn window(program: &str) -> ForegroundWindow {
        ForegroundWindow {
            process_id: None,
            window_class: RawText::Text(program.to_string()),
            window_title: RawText::Text(format!("{program} - main")),
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        sampler: SamplerModule,
        store: AggregationStore,
        _handle: SettingsHandle,
    }

    async fn fixture(processes: MockProcessProbe) -> Fixture {
        *TEST_LOGGING;
        let dir = tempdir().unwrap();
        let store = AggregationStore::new(dir.path().join("data.db")).unwrap();
        let caches = Arc::new(MetadataCache::load(dir.path().join("icons.json")).await);
        let (handle, settings) = SettingsHandle::new(EngineSettings::default());

        let sampler = SamplerModule::new(
            store.clone(),
            None,
            None,
            Arc::new(processes),
            caches,
            settings,
            CancellationToken::new(),
            Box::new(FixedClock),
        );
        Fixture {
            _dir: dir,
            sampler,
            store,
            _handle: handle,
        }
    }

    fn quiet_processes() -> MockProcessProbe {
        let mut processes = MockProcessProbe::new();
        processes.expect_running_process_names().returning(Vec::new);
        processes
            .expect_process_paths()
            .returning(HashMap::new);
        processes.expect_icon_for().returning(|_, _| None);
        processes
    }

    #[tokio::test]
    async fn typing_tick_records_activity_at_all_scopes() {
        let mut fixture = fixture(quiet_processes()).await;
        let mut probe = MockForegroundProbe::new();
        probe
            .expect_active_window()
            .returning(|| Ok(Some(window("Foo"))));

        for _ in 0..10 {
            fixture.sampler.accumulator.record(InputEvent::KeyDown);
        }
        fixture.sampler.tick(&mut probe, INTERVAL).await;

        for scope in Scope::ALL {
            let rows = fixture
                .store
                .activity_records_since(scope, 0)
                .await
                .unwrap();
            assert_eq!(rows.len(), 1, "{scope:?}");
            assert_eq!(rows[0].program, "Foo");
            assert_eq!(rows[0].title, "Foo - main");
            assert_eq!(rows[0].event, "type");
            assert_eq!(rows[0].seconds, 5);
            assert_eq!(rows[0].timestamp, scope.bucket_start(TEST_NOW_MS));
        }
    }

    #[tokio::test]
    async fn pointer_only_tick_classifies_read() {
        let mut fixture = fixture(quiet_processes()).await;
        let mut probe = MockForegroundProbe::new();
        probe
            .expect_active_window()
            .returning(|| Ok(Some(window("Foo"))));

        for _ in 0..20 {
            fixture.sampler.accumulator.record(InputEvent::MouseMove);
        }
        fixture.sampler.tick(&mut probe, INTERVAL).await;

        let rows = fixture
            .store
            .activity_records_since(Scope::Minute, 0)
            .await
            .unwrap();
        assert_eq!(rows[0].event, "read");
    }

    #[tokio::test]
    async fn idle_tick_records_foreground_but_no_activity() {
        let mut fixture = fixture(quiet_processes()).await;
        let mut probe = MockForegroundProbe::new();
        probe
            .expect_active_window()
            .returning(|| Ok(Some(window("Foo"))));

        fixture.sampler.tick(&mut probe, INTERVAL).await;

        assert!(fixture
            .store
            .activity_records_since(Scope::Minute, 0)
            .await
            .unwrap()
            .is_empty());
        for scope in Scope::ALL {
            let rows = fixture
                .store
                .foreground_records_since(scope, 0)
                .await
                .unwrap();
            assert_eq!(rows.len(), 1, "{scope:?}");
            assert_eq!(rows[0].program, "Foo");
            assert_eq!(rows[0].seconds, 5);
        }
    }

    #[tokio::test]
    async fn background_needs_prior_foreground_presence() {
        let mut processes = MockProcessProbe::new();
        processes
            .expect_running_process_names()
            .returning(|| vec!["Bar.exe".to_string(), "Baz".to_string(), "Foo".to_string()]);
        processes
            .expect_process_paths()
            .returning(HashMap::new);
        processes.expect_icon_for().returning(|_, _| None);

        let mut fixture = fixture(processes).await;

        // First tick: "Bar" holds the foreground and becomes eligible.
        let mut probe = MockForegroundProbe::new();
        probe
            .expect_active_window()
            .returning(|| Ok(Some(window("Bar"))));
        fixture.sampler.tick(&mut probe, INTERVAL).await;

        // Second tick: "Foo" is focused, "Bar" still runs, "Baz" was never
        // foreground.
        let mut probe = MockForegroundProbe::new();
        probe
            .expect_active_window()
            .returning(|| Ok(Some(window("Foo"))));
        fixture.sampler.tick(&mut probe, INTERVAL).await;

        let rows = fixture
            .store
            .background_records_since(Scope::Minute, 0)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].program, "Bar");
        assert_eq!(rows[0].seconds, 5);
    }

    #[tokio::test]
    async fn no_window_means_no_rows() {
        let mut fixture = fixture(quiet_processes()).await;
        let mut probe = MockForegroundProbe::new();
        probe.expect_active_window().returning(|| Ok(None));

        fixture.sampler.accumulator.record(InputEvent::KeyDown);
        fixture.sampler.tick(&mut probe, INTERVAL).await;

        assert!(fixture
            .store
            .foreground_records_since(Scope::Minute, 0)
            .await
            .unwrap()
            .is_empty());
        assert!(fixture
            .store
            .activity_records_since(Scope::Minute, 0)
            .await
            .unwrap()
            .is_empty());
        // The accumulator was still cleared; those events are spent.
        assert!(fixture.sampler.accumulator.drain().is_empty());
    }

    #[tokio::test]
    async fn probe_errors_skip_the_tick() {
        let mut fixture = fixture(quiet_processes()).await;
        let mut probe = MockForegroundProbe::new();
        probe
            .expect_active_window()
            .returning(|| Err(anyhow::anyhow!("probe exploded")));

        fixture.sampler.tick(&mut probe, INTERVAL).await;

        assert!(fixture
            .store
            .foreground_records_since(Scope::Minute, 0)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn paused_recording_discards_events() {
        let mut fixture = fixture(quiet_processes()).await;
        fixture._handle.set_recording(false);

        let mut probe = MockForegroundProbe::new();
        probe.expect_active_window().times(0);

        fixture.sampler.accumulator.record(InputEvent::KeyDown);
        fixture.sampler.tick(&mut probe, INTERVAL).await;

        assert!(fixture.sampler.accumulator.drain().is_empty());
        assert!(fixture
            .store
            .foreground_records_since(Scope::Minute, 0)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn repeated_ticks_accumulate_in_one_bucket() {
        let mut fixture = fixture(quiet_processes()).await;
        let mut probe = MockForegroundProbe::new();
        probe
            .expect_active_window()
            .returning(|| Ok(Some(window("Foo"))));

        for _ in 0..3 {
            fixture.sampler.tick(&mut probe, INTERVAL).await;
        }

        let rows = fixture
            .store
            .foreground_records_since(Scope::Minute, 0)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].seconds, 15);
    }

    #[test]
    fn classification_threshold_is_the_interval_length() {
        let keystrokes = |keystrokes| InputCounts {
            keystrokes,
            pointer: 0,
        };
        assert_eq!(classify(keystrokes(6), 5), ActivityEvent::Type);
        assert_eq!(classify(keystrokes(5), 5), ActivityEvent::Read);
        assert_eq!(
            classify(
                InputCounts {
                    keystrokes: 0,
                    pointer: 100
                },
                5
            ),
            ActivityEvent::Read
        );
    }
}
