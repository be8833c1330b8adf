use agent_relay::config::RelayConfig;
use agent_relay::store::{DurableStore, FileStore, FileStoreOptions};
use agent_relay::Relay;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Config pointing at `dir` with a fast poll loop.
pub fn config_for(dir: &Path) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.storage.data_dir = Some(dir.to_path_buf());
    config.flow.poll_interval_ms = 10;
    config
}

/// A relay over its own `FileStore` handle, as a separate process would have.
pub fn file_relay(dir: &Path) -> Relay {
    let store: Arc<dyn DurableStore> =
        Arc::new(FileStore::open(dir, FileStoreOptions::default()).unwrap());
    Relay::with_store(store, config_for(dir))
}

/// Poll `check` until it holds or `limit` passes.
pub fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < limit {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}
