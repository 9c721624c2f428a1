use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

pub struct ServerMetrics {
    ws_rate_total: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    ws_duration_count: Mutex<HashMap<String, u64>>,
    ws_duration_sum_ms: Mutex<HashMap<String, u64>>,
    ack_latency_ms: AtomicU64,
    persist_total: AtomicU64,
    persist_failures_total: AtomicU64,
}

static GLOBAL_METRICS: OnceLock<Arc<ServerMetrics>> = OnceLock::new();

impl Default for ServerMetrics {
    fn default() -> Self {
        Self {
            ws_rate_total: Mutex::new(HashMap::new()),
            ws_errors_total: Mutex::new(HashMap::new()),
            ws_duration_count: Mutex::new(HashMap::new()),
            ws_duration_sum_ms: Mutex::new(HashMap::new()),
            ack_latency_ms: AtomicU64::new(0),
            persist_total: AtomicU64::new(0),
            persist_failures_total: AtomicU64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<ServerMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<ServerMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_ws_request(endpoint: &str, is_error: bool, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_request(endpoint, is_error, latency_ms);
    }
}

pub fn observe_ack_latency_ms(latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.observe_ack_latency_ms(latency_ms);
    }
}

pub fn record_persist(failed: bool) {
    if let Some(metrics) = global_metrics() {
        metrics.record_persist(failed);
    }
}

impl ServerMetrics {
    pub fn record_ws_request(&self, endpoint: &str, is_error: bool, latency_ms: u64) {
        increment_counter(&self.ws_rate_total, endpoint, 1);
        increment_counter(&self.ws_duration_count, endpoint, 1);
        increment_counter(&self.ws_duration_sum_ms, endpoint, latency_ms);
        if is_error {
            increment_counter(&self.ws_errors_total, endpoint, 1);
        }
    }

    pub fn observe_ack_latency_ms(&self, latency_ms: u64) {
        self.ack_latency_ms.store(latency_ms, Ordering::Relaxed);
    }

    pub fn record_persist(&self, failed: bool) {
        self.persist_total.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.persist_failures_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn ws_request_count(&self, endpoint: &str) -> u64 {
        counter_value(&self.ws_rate_total, endpoint)
    }

    pub fn ws_error_count(&self, endpoint: &str) -> u64 {
        counter_value(&self.ws_errors_total, endpoint)
    }

    pub fn ws_duration_sum_ms(&self, endpoint: &str) -> u64 {
        counter_value(&self.ws_duration_sum_ms, endpoint)
    }

    pub fn last_ack_latency_ms(&self) -> u64 {
        self.ack_latency_ms.load(Ordering::Relaxed)
    }

    pub fn persist_counts(&self) -> (u64, u64) {
        (
            self.persist_total.load(Ordering::Relaxed),
            self.persist_failures_total.load(Ordering::Relaxed),
        )
    }
}

fn increment_counter(counters: &Mutex<HashMap<String, u64>>, key: &str, amount: u64) {
    let mut guard = counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard.entry(key.to_string()).or_insert(0) += amount;
}

fn counter_value(counters: &Mutex<HashMap<String, u64>>, key: &str) -> u64 {
    let guard = counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.get(key).copied().unwrap_or(0)
}
