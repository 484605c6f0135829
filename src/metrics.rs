//! Prometheus text exposition for the two counters spec.md §6 names.
//!
//! Grounded on `crates/server/src/web.rs`'s `metrics` handler: this spec's
//! surface is two numbers, so a hand-rolled `# HELP`/`# TYPE` string is the
//! honest match for what the teacher does at that scale rather than pulling
//! in a metrics-registry crate.

use std::sync::atomic::{AtomicI64, AtomicU64};

pub struct Metrics {
    pub current_clients: AtomicI64,
    pub total_clients: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            current_clients: AtomicI64::new(0),
            total_clients: AtomicU64::new(0),
        }
    }

    pub fn render_prometheus(&self) -> String {
        use std::sync::atomic::Ordering::Relaxed;
        format!(
            "# HELP streama_current_clients Number of currently connected listeners\n\
             # TYPE streama_current_clients gauge\n\
             streama_current_clients {}\n\
             \n\
             # HELP streama_total_clients Cumulative count of listeners that have connected\n\
             # TYPE streama_total_clients counter\n\
             streama_total_clients {}\n",
            self.current_clients.load(Relaxed),
            self.total_clients.load(Relaxed),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering::Relaxed;

    #[test]
    fn renders_both_series() {
        let m = Metrics::new();
        m.current_clients.fetch_add(3, Relaxed);
        m.total_clients.fetch_add(7, Relaxed);
        let text = m.render_prometheus();
        assert!(text.contains("streama_current_clients 3"));
        assert!(text.contains("streama_total_clients 7"));
    }
}
