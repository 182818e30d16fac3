//! Platform integration layer. Defines the narrow contracts the engine
//! consumes (foreground window probe, global input observer, process table)
//! and selects an implementation for the current platform. Everything
//! behind these traits is allowed to be missing at runtime; the daemon
//! checks capabilities once at startup and degrades instead of failing.

#[cfg(feature = "win")]
pub mod win;
#[cfg(feature = "x11")]
pub mod x11;

#[cfg(feature = "win")]
extern crate windows;

#[cfg(feature = "x11")]
extern crate xcb;

pub mod process;

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use anyhow::Result;

/// Text as it arrives from a platform surface, before any decoding. X11
/// properties come in as raw bytes in whatever encoding the application
/// chose; Windows wide strings are already valid UTF-16 and arrive as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawText {
    Bytes(Vec<u8>),
    Text(String),
}

impl RawText {
    pub fn is_empty(&self) -> bool {
        match self {
            RawText::Bytes(bytes) => bytes.is_empty(),
            RawText::Text(text) => text.is_empty(),
        }
    }
}

impl From<&str> for RawText {
    fn from(value: &str) -> Self {
        RawText::Text(value.to_string())
    }
}

/// A single observation of the focused window.
#[derive(Debug, Clone)]
pub struct ForegroundWindow {
    pub process_id: Option<u32>,
    pub window_class: RawText,
    pub window_title: RawText,
}

/// Probe for the window currently holding input focus.
#[cfg_attr(test, mockall::automock)]
pub trait ForegroundProbe: Send {
    /// Returns `Ok(None)` when no window holds focus. Losing focus is not
    /// an error condition.
    fn active_window(&mut self) -> Result<Option<ForegroundWindow>>;
}

/// Kinds of input activity the engine counts. No payload is carried; only
/// occurrences matter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    KeyDown,
    MouseDown,
    MouseMove,
    Wheel,
}

pub type InputSink = Arc<dyn Fn(InputEvent) + Send + Sync>;

/// Observer of global keyboard/pointer activity. Implementations deliver
/// events from their own OS thread; the sink must therefore be cheap and
/// thread-safe.
#[cfg_attr(test, mockall::automock)]
pub trait InputObserver: Send {
    fn subscribe(&mut self, sink: InputSink) -> Result<InputSubscription>;
}

/// Handle for an active input subscription. Dropping it detaches the
/// underlying hooks, so re-subscribing can never accumulate listeners.
pub struct InputSubscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl InputSubscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to tear down. Used by tests and by
    /// observers that are detached externally.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn detach(mut self) {
        self.run_cancel();
    }

    fn run_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for InputSubscription {
    fn drop(&mut self) {
        self.run_cancel();
    }
}

/// Read access to the process table. All methods tolerate platform errors
/// by returning empty results; the engine treats "nothing" and "failed"
/// identically (skip this tick's contribution).
#[cfg_attr(test, mockall::automock)]
pub trait ProcessProbe: Send + Sync {
    fn running_process_names(&self) -> Vec<String>;

    fn process_paths(&self) -> HashMap<String, PathBuf>;

    fn name_by_pid(&self, pid: u32) -> Option<RawText>;

    /// Best-effort icon lookup for a program. The payload is opaque binary
    /// data; `None` means the platform has no icon to offer right now.
    fn icon_for(&self, program: &str, path: Option<PathBuf>) -> Option<Vec<u8>>;
}

/// Capability check for the foreground probe. `None` means this build or
/// this machine can't tell which window is focused.
pub fn foreground_probe() -> Option<Box<dyn ForegroundProbe>> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "win")] {
            Some(Box::new(win::WinForegroundProbe::new()))
        }
        else if #[cfg(feature = "x11")] {
            match x11::X11ForegroundProbe::new() {
                Ok(probe) => Some(Box::new(probe)),
                Err(e) => {
                    tracing::warn!("X11 foreground probe unavailable {e:?}");
                    None
                }
            }
        }
        else {
            None
        }
    }
}

/// Capability check for the global input observer.
pub fn input_observer() -> Option<Box<dyn InputObserver>> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "win")] {
            Some(Box::new(win::WinInputObserver::new()))
        }
        else if #[cfg(feature = "x11")] {
            match x11::X11InputObserver::new() {
                Ok(observer) => Some(Box::new(observer)),
                Err(e) => {
                    tracing::warn!("X11 input observer unavailable {e:?}");
                    None
                }
            }
        }
        else {
            None
        }
    }
}

/// The process probe is available on every supported platform.
pub fn process_probe() -> Arc<dyn ProcessProbe> {
    Arc::new(process::SysinfoProbe::new())
}
