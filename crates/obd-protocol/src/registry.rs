//! PID decoder registry
//!
//! Maps a request code to a factory producing a fresh decoder. The registry
//! is built explicitly and passed to whoever polls; there is no process-wide
//! default instance.

use crate::pid::{PidDecoder, StandardDecoder, SupportBitmapDecoder, STANDARD_PIDS};
use crate::support::SUPPORT_BLOCKS;
use std::collections::HashMap;
use std::sync::Arc;

/// Produces a new decoder for one PID
pub type DecoderFactory = Arc<dyn Fn() -> Box<dyn PidDecoder> + Send + Sync>;

/// Request code to decoder factory
#[derive(Clone, Default)]
pub struct PidRegistry {
    factories: HashMap<String, DecoderFactory>,
}

impl PidRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with every built-in telemetry PID and the
    /// support-bitmap PIDs
    pub fn with_standard_pids() -> Self {
        let mut registry = Self::new();
        for spec in STANDARD_PIDS {
            registry.register(spec.code, move || {
                Box::new(StandardDecoder::new(spec)) as Box<dyn PidDecoder>
            });
        }
        for origin in SUPPORT_BLOCKS {
            registry.register(&format!("01{origin:02X}"), move || {
                Box::new(SupportBitmapDecoder::new(origin)) as Box<dyn PidDecoder>
            });
        }
        registry
    }

    /// Register (or replace) the factory for `pid`
    pub fn register<F>(&mut self, pid: &str, factory: F)
    where
        F: Fn() -> Box<dyn PidDecoder> + Send + Sync + 'static,
    {
        self.factories
            .insert(pid.trim().to_ascii_uppercase(), Arc::new(factory));
    }

    /// A fresh decoder for `pid`, or `None` if nothing is registered
    pub fn try_create(&self, pid: &str) -> Option<Box<dyn PidDecoder>> {
        self.factories
            .get(&pid.trim().to_ascii_uppercase())
            .map(|factory| factory())
    }

    /// Whether a decoder is registered for `pid`
    pub fn contains(&self, pid: &str) -> bool {
        self.factories.contains_key(&pid.trim().to_ascii_uppercase())
    }

    /// Registered codes, sorted
    pub fn pids(&self) -> Vec<String> {
        let mut pids: Vec<String> = self.factories.keys().cloned().collect();
        pids.sort();
        pids
    }

    /// Number of registered codes
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for PidRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PidRegistry")
            .field("pids", &self.pids())
            .finish()
    }
}
