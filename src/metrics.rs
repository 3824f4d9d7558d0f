use axum::{Router, routing::get};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::MetricsConfig;

#[derive(Default)]
pub struct Metrics {
    pub sessions_total: AtomicU64,
    pub sessions_active: AtomicU64,
    pub messages_received: AtomicU64,
    pub validations_total: AtomicU64,
    pub validations_rejected: AtomicU64,
    pub feedback_accepted: AtomicU64,
    pub feedback_rejected: AtomicU64,
    pub rate_limits_hit: AtomicU64,
    pub suspicious_actions: AtomicU64,
    pub query_cache_hits: AtomicU64,
    pub query_reads: AtomicU64,
    pub query_errors: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_sessions(&self) {
        self.sessions_total.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_sessions(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_messages(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_validation(&self, is_valid: bool) {
        self.validations_total.fetch_add(1, Ordering::Relaxed);
        if !is_valid {
            self.validations_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_accepted(&self) {
        self.feedback_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.feedback_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limits(&self) {
        self.rate_limits_hit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_suspicious(&self) {
        self.suspicious_actions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_hits(&self) {
        self.query_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_query_reads(&self) {
        self.query_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_query_errors(&self) {
        self.query_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn format_prometheus(&self) -> String {
        let counters: [(&str, &str, &str, &AtomicU64); 12] = [
            ("sessions_total", "counter", "Total sessions opened", &self.sessions_total),
            ("sessions_active", "gauge", "Open sessions", &self.sessions_active),
            ("messages_received", "counter", "Total messages received", &self.messages_received),
            ("validations_total", "counter", "Validation calls", &self.validations_total),
            ("validations_rejected", "counter", "Validation calls with blocking errors", &self.validations_rejected),
            ("feedback_accepted", "counter", "Feedback submissions cleared", &self.feedback_accepted),
            ("feedback_rejected", "counter", "Feedback submissions refused", &self.feedback_rejected),
            ("rate_limits_hit", "counter", "Rate limits triggered", &self.rate_limits_hit),
            ("suspicious_actions", "counter", "Actions recorded while suspicious", &self.suspicious_actions),
            ("query_cache_hits", "counter", "Queries served from cache", &self.query_cache_hits),
            ("query_reads", "counter", "Document store reads", &self.query_reads),
            ("query_errors", "counter", "Failed document store reads", &self.query_errors),
        ];

        let mut out = String::new();
        for (name, kind, help, value) in counters {
            out.push_str(&format!(
                "# HELP feedback_guard_{name} {help}\n\
                 # TYPE feedback_guard_{name} {kind}\n\
                 feedback_guard_{name} {}\n",
                value.load(Ordering::Relaxed),
            ));
        }
        out
    }
}

pub async fn run_metrics_server(config: MetricsConfig, metrics: Arc<Metrics>) {
    if !config.enable {
        return;
    }

    let path = config.path.clone();
    let app = Router::new()
        .route(&path, get(move || {
            let m = metrics.clone();
            async move { m.format_prometheus() }
        }));

    let addr: std::net::SocketAddr = match config.bind_addr.parse() {
        Ok(a) => a,
        Err(e) => {
            tracing::error!("Invalid metrics bind address: {}", e);
            return;
        }
    };

    info!("Metrics server listening on {}{}", addr, path);

    match TcpListener::bind(addr).await {
        Ok(listener) => {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Metrics server stopped: {}", e);
            }
        }
        Err(e) => tracing::error!("Failed to bind metrics server: {}", e),
    }
}
