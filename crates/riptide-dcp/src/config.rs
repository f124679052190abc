//! Replication tunables and their live-update plumbing.
//!
//! [`DcpSettings`] is the startup snapshot. [`TunableStore`] is the
//! engine-facing facade for the handful of keys that may change at runtime;
//! interested components register [`ValueChangedListener`]s and are pushed
//! the new value on every set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

/// Config key: how many buffered messages a consumer processes before
/// yielding back to the scheduler.
pub const KEY_CONSUMER_YIELD_LIMIT: &str = "dcp_consumer_process_buffered_messages_yield_limit";
/// Config key: consumer buffered-message batch size.
pub const KEY_CONSUMER_BATCH_SIZE: &str = "dcp_consumer_process_buffered_messages_batch_size";
/// Config key: minimum compression ratio producers must achieve before
/// sending values compressed.
pub const KEY_MIN_COMPRESSION_RATIO: &str = "dcp_min_compression_ratio";
/// Config key: the engine memory quota; drives backfill admission.
pub const KEY_MAX_SIZE: &str = "max_size";

/// Startup configuration for the replication layer.
#[derive(Debug, Clone)]
pub struct DcpSettings {
    /// Number of vbuckets in the bucket.
    pub num_vbuckets: u16,
    /// In-flight unacknowledged events permitted per acking channel.
    pub ack_window_size: usize,
    /// A data event requests an ack every this many events.
    pub ack_interval: u32,
    /// How long unacked entries may sit before the channel is torn down.
    pub ack_grace_period: Duration,
    /// How long a channel may stay paused before the manager forces a
    /// disconnect.
    pub conn_keep_alive: Duration,
    /// Background fetch batch bound per dispatcher job.
    pub bg_max_pending: usize,
    /// Consumer processor yield threshold.
    pub consumer_yield_threshold: usize,
    /// Consumer buffered-message batch size.
    pub consumer_batch_size: usize,
    /// Initial minimum compression ratio for producers.
    pub min_compression_ratio: f32,
    /// Engine memory quota in bytes.
    pub max_data_size: usize,
}

impl Default for DcpSettings {
    fn default() -> Self {
        Self {
            num_vbuckets: 1024,
            ack_window_size: 10,
            ack_interval: 1000,
            ack_grace_period: Duration::from_secs(5 * 60),
            conn_keep_alive: Duration::from_secs(5 * 60),
            bg_max_pending: 256,
            consumer_yield_threshold: 10,
            consumer_batch_size: 10,
            min_compression_ratio: 0.85,
            max_data_size: 100 * 1024 * 1024,
        }
    }
}

impl DcpSettings {
    /// Validate and clamp configuration values.
    #[must_use]
    pub fn validated(mut self) -> Self {
        if self.num_vbuckets == 0 {
            self.num_vbuckets = 1;
        }
        if self.ack_window_size == 0 {
            self.ack_window_size = 1;
        }
        if self.ack_interval == 0 {
            self.ack_interval = 1;
        }
        if self.bg_max_pending == 0 {
            self.bg_max_pending = 1;
        }
        self
    }
}

/// A typed observer of one or more configuration keys.
///
/// Default implementations ignore the change, so a listener only overrides
/// the value kinds it cares about.
pub trait ValueChangedListener: Send + Sync {
    fn size_value_changed(&self, _key: &str, _value: usize) {}
    fn float_value_changed(&self, _key: &str, _value: f64) {}
}

#[derive(Default)]
struct TunableValues {
    sizes: HashMap<String, usize>,
    floats: HashMap<String, f64>,
}

/// Live configuration store with change listeners.
#[derive(Default)]
pub struct TunableStore {
    values: Mutex<TunableValues>,
    listeners: Mutex<HashMap<String, Vec<Arc<dyn ValueChangedListener>>>>,
}

impl TunableStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for changes to `key`.
    pub fn add_listener(&self, key: &str, listener: Arc<dyn ValueChangedListener>) {
        self.listeners
            .lock()
            .entry(key.to_owned())
            .or_default()
            .push(listener);
    }

    /// Store a size value and push it to every listener on `key`.
    pub fn set_size(&self, key: &str, value: usize) {
        self.values.lock().sizes.insert(key.to_owned(), value);
        debug!(target: "riptide_dcp::config", key, value, "size tunable changed");
        for listener in self.listeners_for(key) {
            listener.size_value_changed(key, value);
        }
    }

    /// Store a float value and push it to every listener on `key`.
    pub fn set_float(&self, key: &str, value: f64) {
        self.values.lock().floats.insert(key.to_owned(), value);
        debug!(target: "riptide_dcp::config", key, value, "float tunable changed");
        for listener in self.listeners_for(key) {
            listener.float_value_changed(key, value);
        }
    }

    #[must_use]
    pub fn get_size(&self, key: &str) -> Option<usize> {
        self.values.lock().sizes.get(key).copied()
    }

    #[must_use]
    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.values.lock().floats.get(key).copied()
    }

    /// Snapshot the listener list so notification runs without the
    /// listener lock held.
    fn listeners_for(&self, key: &str) -> Vec<Arc<dyn ValueChangedListener>> {
        self.listeners.lock().get(key).cloned().unwrap_or_default()
    }
}
