use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::ProviderKind;

/// Coarse model class an overload flag applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelClass {
    /// Reasoning models (thinking budget / thoughts).
    Thinking,
    Standard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverloadKey {
    pub provider: ProviderKind,
    pub class: ModelClass,
}

impl OverloadKey {
    pub fn new(provider: ProviderKind, class: ModelClass) -> Self {
        Self { provider, class }
    }

    fn index(&self) -> usize {
        let provider = match self.provider {
            ProviderKind::Gemini => 0,
            ProviderKind::OpenAi => 1,
            ProviderKind::Pollinations => 2,
        };
        let class = match self.class {
            ModelClass::Thinking => 0,
            ModelClass::Standard => 1,
        };
        provider * 2 + class
    }
}

const SLOTS: usize = 6;

/// Process-wide "currently overloaded" flags, shared by reference between
/// every orchestrator built from the same factory.
///
/// Reads and writes use relaxed atomics and the last write wins. Two
/// requests racing on the same flag cost at most one extra retry-then-fallback
/// cycle, so no stronger ordering is used.
#[derive(Debug, Default)]
pub struct OverloadState {
    flags: [AtomicBool; SLOTS],
}

impl OverloadState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_overloaded(&self, key: OverloadKey) -> bool {
        self.flags[key.index()].load(Ordering::Relaxed)
    }

    pub fn set_overloaded(&self, key: OverloadKey, value: bool) {
        let previous = self.flags[key.index()].swap(value, Ordering::Relaxed);
        if previous != value {
            tracing::info!(
                provider = key.provider.as_str(),
                class = ?key.class,
                overloaded = value,
                "overload flag changed"
            );
        }
    }

    pub fn clear_all(&self) {
        for flag in &self.flags {
            flag.store(false, Ordering::Relaxed);
        }
    }
}
