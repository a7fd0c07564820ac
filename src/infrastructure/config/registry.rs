//! Process-wide configuration registry.
//!
//! Single source of truth for timeouts, retry policy, scheduler policy,
//! and caps. Readers always see a consistent snapshot; `reload` swaps
//! the whole snapshot atomically.
//!
//! Singleton construction is guarded against re-entrancy: a
//! `get_instance()` issued while `init` is still running receives a
//! fallback handle whose getters log a warning and serve compiled
//! defaults. The initializing flag is cleared even when init fails.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::domain::errors::OrchestratorResult;
use crate::domain::models::config::{Config, Limits, RetryPolicy, SchedulerPolicy, TimeoutKind};
use crate::infrastructure::config::loader::ConfigLoader;

static INSTANCE: RwLock<Option<Arc<RegistryInner>>> = RwLock::new(None);
static INITIALIZING: AtomicBool = AtomicBool::new(false);

#[derive(Debug)]
struct RegistryInner {
    snapshot: RwLock<Arc<Config>>,
}

/// Clears the initializing flag on every exit path of `init`.
struct InitGuard;

impl Drop for InitGuard {
    fn drop(&mut self) {
        INITIALIZING.store(false, Ordering::SeqCst);
    }
}

/// Handle through which components read configuration.
#[derive(Clone)]
pub struct ConfigRegistry(Handle);

#[derive(Clone)]
enum Handle {
    Live(Arc<RegistryInner>),
    /// Served during re-entrant initialization; getters return defaults.
    Fallback,
}

impl std::fmt::Debug for ConfigRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Handle::Live(_) => write!(f, "ConfigRegistry::Live"),
            Handle::Fallback => write!(f, "ConfigRegistry::Fallback"),
        }
    }
}

impl ConfigRegistry {
    /// Initialize the registry with a validated configuration.
    pub fn init(config: Config) -> OrchestratorResult<()> {
        INITIALIZING.store(true, Ordering::SeqCst);
        let _guard = InitGuard;

        ConfigLoader::validate(&config)?;

        let inner = Arc::new(RegistryInner {
            snapshot: RwLock::new(Arc::new(config)),
        });
        *INSTANCE.write().expect("registry lock poisoned") = Some(inner);
        Ok(())
    }

    /// Obtain the process-wide handle.
    ///
    /// During a re-entrant `init` (or before any init) this returns the
    /// fallback handle rather than blocking or panicking.
    pub fn get_instance() -> Self {
        if INITIALIZING.load(Ordering::SeqCst) {
            tracing::warn!("config registry requested during initialization, serving defaults");
            return Self(Handle::Fallback);
        }
        match INSTANCE.read().expect("registry lock poisoned").as_ref() {
            Some(inner) => Self(Handle::Live(Arc::clone(inner))),
            None => {
                tracing::warn!("config registry not initialized, serving defaults");
                Self(Handle::Fallback)
            }
        }
    }

    /// Atomically replace the configuration snapshot.
    pub fn reload(config: Config) -> OrchestratorResult<()> {
        ConfigLoader::validate(&config)?;
        if let Some(inner) = INSTANCE.read().expect("registry lock poisoned").as_ref() {
            *inner.snapshot.write().expect("snapshot lock poisoned") = Arc::new(config);
            Ok(())
        } else {
            Self::init(config)
        }
    }

    /// Drop the registry. Safe to call twice.
    pub fn teardown() {
        *INSTANCE.write().expect("registry lock poisoned") = None;
        INITIALIZING.store(false, Ordering::SeqCst);
    }

    /// Test hook: reset process-wide state between scenarios.
    #[doc(hidden)]
    pub fn reset_for_tests() {
        Self::teardown();
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self.0, Handle::Fallback)
    }

    /// Consistent snapshot of the whole configuration tree.
    pub fn snapshot(&self) -> Arc<Config> {
        match &self.0 {
            Handle::Live(inner) => {
                Arc::clone(&inner.snapshot.read().expect("snapshot lock poisoned"))
            }
            Handle::Fallback => {
                tracing::warn!("serving default config snapshot from fallback handle");
                Arc::new(Config::default())
            }
        }
    }

    pub fn timeout(&self, kind: TimeoutKind) -> Duration {
        self.snapshot().timeouts.for_kind(kind)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.snapshot().retry.clone()
    }

    pub fn scheduler_policy(&self) -> SchedulerPolicy {
        self.snapshot().scheduler.clone()
    }

    pub fn limits(&self) -> Limits {
        self.snapshot().limits.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Registry state is process-wide; serialize the tests that touch it.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_init_and_read() {
        let _guard = TEST_LOCK.lock().unwrap();
        ConfigRegistry::reset_for_tests();

        let mut config = Config::default();
        config.limits.max_tasks = 42;
        ConfigRegistry::init(config).unwrap();

        let handle = ConfigRegistry::get_instance();
        assert!(!handle.is_fallback());
        assert_eq!(handle.limits().max_tasks, 42);
        assert_eq!(
            handle.timeout(TimeoutKind::LlmRequest),
            Duration::from_secs(60)
        );

        ConfigRegistry::teardown();
    }

    #[test]
    fn test_uninitialized_returns_fallback_defaults() {
        let _guard = TEST_LOCK.lock().unwrap();
        ConfigRegistry::reset_for_tests();

        let handle = ConfigRegistry::get_instance();
        assert!(handle.is_fallback());
        assert_eq!(handle.limits().max_tasks, 100);
        assert_eq!(handle.retry_policy().max_retries, 3);
    }

    #[test]
    fn test_reentrant_init_sees_fallback() {
        let _guard = TEST_LOCK.lock().unwrap();
        ConfigRegistry::reset_for_tests();

        INITIALIZING.store(true, Ordering::SeqCst);
        let handle = ConfigRegistry::get_instance();
        assert!(handle.is_fallback());
        INITIALIZING.store(false, Ordering::SeqCst);

        ConfigRegistry::teardown();
    }

    #[test]
    fn test_initializing_flag_cleared_on_failed_init() {
        let _guard = TEST_LOCK.lock().unwrap();
        ConfigRegistry::reset_for_tests();

        let mut config = Config::default();
        config.retry.max_retries = 99;
        assert!(ConfigRegistry::init(config).is_err());
        assert!(!INITIALIZING.load(Ordering::SeqCst));

        // A valid init still works afterwards.
        ConfigRegistry::init(Config::default()).unwrap();
        assert!(!ConfigRegistry::get_instance().is_fallback());
        ConfigRegistry::teardown();
    }

    #[test]
    fn test_reload_swaps_snapshot() {
        let _guard = TEST_LOCK.lock().unwrap();
        ConfigRegistry::reset_for_tests();

        ConfigRegistry::init(Config::default()).unwrap();
        let handle = ConfigRegistry::get_instance();
        let before = handle.snapshot();
        assert_eq!(before.limits.max_depth, 3);

        let mut updated = Config::default();
        updated.limits.max_depth = 5;
        ConfigRegistry::reload(updated).unwrap();

        // Old snapshot stays consistent; new reads see the swap.
        assert_eq!(before.limits.max_depth, 3);
        assert_eq!(handle.snapshot().limits.max_depth, 5);

        ConfigRegistry::teardown();
    }

    #[test]
    fn test_reload_rejects_invalid_config() {
        let _guard = TEST_LOCK.lock().unwrap();
        ConfigRegistry::reset_for_tests();

        ConfigRegistry::init(Config::default()).unwrap();
        let mut bad = Config::default();
        bad.retry.backoff_multiplier = 50.0;
        assert!(ConfigRegistry::reload(bad).is_err());
        // Previous snapshot untouched.
        assert_eq!(
            ConfigRegistry::get_instance().retry_policy().backoff_multiplier,
            2.0
        );

        ConfigRegistry::teardown();
    }

    #[test]
    fn test_teardown_twice_is_safe() {
        let _guard = TEST_LOCK.lock().unwrap();
        ConfigRegistry::init(Config::default()).unwrap();
        ConfigRegistry::teardown();
        ConfigRegistry::teardown();
        assert!(ConfigRegistry::get_instance().is_fallback());
    }
}
