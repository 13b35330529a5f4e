//! The process-wide platform singleton.

use std::sync::{Arc, Mutex, OnceLock};

use crate::platform::Platform;
use crate::transport::Transport;

#[derive(Default)]
struct ManagerState {
    transports: Vec<Arc<dyn Transport>>,
    platform: Option<Platform>,
}

fn state() -> &'static Mutex<ManagerState> {
    static STATE: OnceLock<Mutex<ManagerState>> = OnceLock::new();
    STATE.get_or_init(|| Mutex::new(ManagerState::default()))
}

/// Process-wide accessor for the one [`Platform`].
///
/// Transports register during startup; the first [`PlatformManager::platform`]
/// call composes them into the singleton, and every later call (from any
/// thread) hands back the same instance. `init`/`release` live on the
/// returned platform itself.
///
/// Code that wants its own isolated platform (tests, mostly) should use
/// [`Platform::with_transports`] and skip this module entirely.
pub struct PlatformManager;

impl PlatformManager {
    /// Registers a transport backend. Registration after the platform was
    /// first handed out only takes effect after [`PlatformManager::reset`].
    pub fn register_transport(transport: Arc<dyn Transport>) {
        state().lock().unwrap().transports.push(transport);
    }

    /// The singleton platform, built on first call from the registered
    /// transports.
    pub fn platform() -> Platform {
        let mut state = state().lock().unwrap();
        let ManagerState {
            transports,
            platform,
        } = &mut *state;
        platform
            .get_or_insert_with(|| Platform::with_transports(transports.clone()))
            .clone()
    }

    /// Drops the singleton and the transport registry.
    ///
    /// A test hook: it does not release the old platform, it only forgets
    /// it, so call `release` first if devices are held.
    pub fn reset() {
        let mut state = state().lock().unwrap();
        state.platform = None;
        state.transports.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;

    // The singleton is process-wide, so everything lives in one test case.
    #[test]
    fn test_same_instance_and_reset() {
        PlatformManager::reset();
        PlatformManager::register_transport(Arc::new(MockTransport::new()));

        let a = PlatformManager::platform();
        let b = PlatformManager::platform();
        // Cheap identity check: subscribing on one is visible through the
        // other only if they share state.
        use crate::events::EventKind;
        use std::sync::atomic::{AtomicUsize, Ordering};
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let sub = a.on(EventKind::PlatformInitialized, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            b.init(Default::default()).await.unwrap();
            b.release(Default::default()).await.unwrap();
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        sub.dispose();

        PlatformManager::reset();
        let c = PlatformManager::platform();
        // A fresh platform with no transports enumerates nothing.
        rt.block_on(async {
            c.init(Default::default()).await.unwrap();
            assert!(c.device_info().await.unwrap().is_empty());
            c.release(Default::default()).await.unwrap();
        });
    }
}
