use std::time::Duration;

use tokio::sync::watch;

pub const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(1);
pub const MAX_CHECK_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Runtime-mutable engine configuration. The sampler holds the receiving
/// end and re-arms itself when values change; it never mutates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub recording: bool,
    pub check_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            recording: true,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

impl EngineSettings {
    pub fn with_interval_secs(interval_secs: u64) -> Self {
        Self {
            check_interval: clamp_interval(Duration::from_secs(interval_secs)),
            ..Self::default()
        }
    }
}

pub fn clamp_interval(interval: Duration) -> Duration {
    interval.clamp(MIN_CHECK_INTERVAL, MAX_CHECK_INTERVAL)
}

/// Writing side of the settings channel, owned by the command surface.
pub struct SettingsHandle {
    sender: watch::Sender<EngineSettings>,
}

impl SettingsHandle {
    pub fn new(initial: EngineSettings) -> (Self, watch::Receiver<EngineSettings>) {
        let (sender, receiver) = watch::channel(initial);
        (Self { sender }, receiver)
    }

    pub fn set_check_interval(&self, interval: Duration) {
        let interval = clamp_interval(interval);
        self.sender.send_modify(|settings| {
            settings.check_interval = interval;
        });
    }

    pub fn set_recording(&self, recording: bool) {
        self.sender.send_modify(|settings| {
            settings.recording = recording;
        });
    }

    pub fn current(&self) -> EngineSettings {
        *self.sender.borrow()
    }
}
