// SPDX-License-Identifier: CEPL-1.0
use std::sync::{Arc, Mutex};
use tracing::Level;

/// Sink for component events. Handed to each component when it is built, so
/// nothing in the engine reaches for a process-wide logger.
pub trait Diagnostics: Send + Sync {
    fn record(&self, level: Level, component: &'static str, message: &str);
}

pub type SharedDiagnostics = Arc<dyn Diagnostics>;

impl std::fmt::Debug for dyn Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Diagnostics")
    }
}

/// Convenience helpers over [`Diagnostics::record`].
pub trait DiagnosticsExt {
    fn debug(&self, component: &'static str, message: impl AsRef<str>);
    fn info(&self, component: &'static str, message: impl AsRef<str>);
    fn warn(&self, component: &'static str, message: impl AsRef<str>);
    fn error(&self, component: &'static str, message: impl AsRef<str>);

    /// Lifecycle event for a GPU object coming into existence.
    fn created(&self, component: &'static str, what: impl AsRef<str>) {
        self.debug(component, format!("created {}", what.as_ref()));
    }

    /// Lifecycle event for a GPU object being released.
    fn destroyed(&self, component: &'static str, what: impl AsRef<str>) {
        self.debug(component, format!("destroyed {}", what.as_ref()));
    }
}

impl<D: Diagnostics + ?Sized> DiagnosticsExt for D {
    fn debug(&self, component: &'static str, message: impl AsRef<str>) {
        self.record(Level::DEBUG, component, message.as_ref());
    }
    fn info(&self, component: &'static str, message: impl AsRef<str>) {
        self.record(Level::INFO, component, message.as_ref());
    }
    fn warn(&self, component: &'static str, message: impl AsRef<str>) {
        self.record(Level::WARN, component, message.as_ref());
    }
    fn error(&self, component: &'static str, message: impl AsRef<str>) {
        self.record(Level::ERROR, component, message.as_ref());
    }
}

/// Forwards every event to `tracing`, tagging it with the component name.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingDiagnostics;

impl TracingDiagnostics {
    pub fn shared() -> SharedDiagnostics {
        Arc::new(Self)
    }
}

impl Diagnostics for TracingDiagnostics {
    fn record(&self, level: Level, component: &'static str, message: &str) {
        // tracing macros need the level as a constant
        match level {
            Level::ERROR => tracing::error!(component, "{message}"),
            Level::WARN => tracing::warn!(component, "{message}"),
            Level::INFO => tracing::info!(component, "{message}"),
            Level::DEBUG => tracing::debug!(component, "{message}"),
            _ => tracing::trace!(component, "{message}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedEvent {
    pub level: Level,
    pub component: &'static str,
    pub message: String,
}

/// In-memory sink. Tests inspect what a component reported without
/// installing a subscriber.
#[derive(Debug, Default)]
pub struct CaptureDiagnostics {
    events: Mutex<Vec<CapturedEvent>>,
}

impl CaptureDiagnostics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Messages from one component at or above `level` in severity.
    pub fn messages(&self, component: &str, level: Level) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.component == component && e.level <= level)
            .map(|e| e.message)
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.events().iter().any(|e| e.message.contains(needle))
    }

    pub fn clear(&self) {
        if let Ok(mut e) = self.events.lock() {
            e.clear();
        }
    }
}

impl Diagnostics for CaptureDiagnostics {
    fn record(&self, level: Level, component: &'static str, message: &str) {
        if let Ok(mut e) = self.events.lock() {
            e.push(CapturedEvent {
                level,
                component,
                message: message.to_owned(),
            });
        }
    }
}
