//! Process-wide byte counters, exposed under a filesystem-like namespace.
//! Counters are advisory: increments are not atomic with respect to reads,
//! and every counter is monotonically non-decreasing.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::{Mutex, Once};

use once_cell::sync::Lazy;

pub const UDP_RX_BYTES: &str = "/inet/socket/udp/rx_bytes";
pub const UDP_TX_BYTES: &str = "/inet/socket/udp/tx_bytes";
pub const TCP_ACCEPTS: &str = "/inet/socket/tcp/accepts";
pub const TCP_RX_BYTES: &str = "/inet/socket/tcp/rx_bytes";
pub const TCP_TX_BYTES: &str = "/inet/socket/tcp/tx_bytes";
pub const RAW_RX_BYTES: &str = "/inet/socket/raw/rx_bytes";
pub const RAW_TX_BYTES: &str = "/inet/socket/raw/tx_bytes";

const ALL_COUNTERS: &[&str] = &[
    UDP_RX_BYTES,
    UDP_TX_BYTES,
    TCP_ACCEPTS,
    TCP_RX_BYTES,
    TCP_TX_BYTES,
    RAW_RX_BYTES,
    RAW_TX_BYTES,
];

static REGISTRY: Lazy<Mutex<Counter>> = Lazy::new(|| Mutex::new(Counter::new()));
static INIT: Once = Once::new();

/// Register the socket counters. Idempotent: later calls are no-ops and never
/// reset values accumulated in the meantime.
pub fn init() {
    INIT.call_once(|| {
        let mut counters = REGISTRY.lock().unwrap();
        for id in ALL_COUNTERS {
            counters.register(id);
        }
        log::debug!("registered {} socket counters", ALL_COUNTERS.len());
    });
}

/// Increment the counter for `id` by `value`, creating it if needed. Returns
/// the value after the increment.
pub(crate) fn add(id: &str, value: u64) -> u64 {
    REGISTRY.lock().unwrap().add_value(id, value)
}

/// Current value of the counter for `id`, or 0 if it was never touched.
pub fn value(id: &str) -> u64 {
    REGISTRY.lock().unwrap().get_value(id)
}

/// A string representation of all counters, heaviest hitters first.
pub fn snapshot() -> String {
    REGISTRY.lock().unwrap().to_string()
}

/// A map of named monotonic counters. Unknown keys spring into existence at
/// zero on first use.
struct Counter {
    items: HashMap<String, u64>,
}

impl Counter {
    fn new() -> Counter {
        Counter {
            items: HashMap::new(),
        }
    }

    /// Ensure a key exists without changing its value.
    fn register(&mut self, id: &str) {
        self.items.entry(id.to_string()).or_insert(0);
    }

    /// Increment the counter value by the given value for the key given by id.
    /// Returns the value of the counter after it was incremented.
    fn add_value(&mut self, id: &str, value: u64) -> u64 {
        let entry = self.items.entry(id.to_string()).or_insert(0);
        *entry += value;
        *entry
    }

    /// Returns the counter value for the key given by id, or 0 if no
    /// operations have been performed on the key.
    fn get_value(&self, id: &str) -> u64 {
        self.items.get(id).copied().unwrap_or(0)
    }
}

impl Display for Counter {
    /// Returns a string representation of the counters in the form
    ///   `{key1:value1, key2:value2, ..., keyN:valueN}`
    /// sorted by value with the largest value first.
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut items: Vec<_> = self.items.iter().collect();
        items.sort_by(|(ka, a), (kb, b)| b.cmp(a).then(ka.cmp(kb)));

        write!(f, "{{")?;
        for (i, (key, value)) in items.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{key}:{value}")?;
        }
        write!(f, "}}")
    }
}
