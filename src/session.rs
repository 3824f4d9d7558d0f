use dashmap::DashMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::QueryConfig;
use crate::error::GuardError;
use crate::guard::{GuardConfig, SecurityGuard};
use crate::query::{CachedQuery, QueryOptions};
use crate::store::{DocumentStore, QueryFilter};

const MS_PER_MINUTE: f64 = 60_000.0;

/// Registry entry visible to `/stats`; the live state stays with the connection.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub ip: IpAddr,
    /// Behavior score as of `scored_at`, before any later idle decay.
    pub risk_score: f64,
    pub scored_at: u64,
}

/// State owned by one connected feedback form.
pub struct Session {
    pub id: String,
    pub ip: IpAddr,
    pub guard: SecurityGuard,
    queries: HashMap<String, CachedQuery>,
    query_defaults: QueryOptions,
    max_open_queries: usize,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
}

impl Session {
    /// Opens (or reopens) a query under a client-chosen handle.
    pub fn open_query(
        &mut self,
        handle: &str,
        collection: &str,
        filters: Vec<QueryFilter>,
        options: Option<QueryOptions>,
    ) -> Result<&mut CachedQuery, GuardError> {
        if !self.queries.contains_key(handle) && self.queries.len() >= self.max_open_queries {
            return Err(GuardError::Session(format!(
                "At most {} open queries per session",
                self.max_open_queries
            )));
        }

        let query = CachedQuery::new(
            self.store.clone(),
            self.clock.clone(),
            collection,
            filters,
            options.unwrap_or_else(|| self.query_defaults.clone()),
        );
        self.queries.insert(handle.to_string(), query);
        self.queries
            .get_mut(handle)
            .ok_or_else(|| GuardError::Session("Query vanished after insert".into()))
    }

    pub fn query_mut(&mut self, handle: &str) -> Option<&mut CachedQuery> {
        self.queries.get_mut(handle)
    }

    pub fn open_query_count(&self) -> usize {
        self.queries.len()
    }
}

pub struct SessionManager {
    sessions: DashMap<String, SessionInfo>,
    ip_counts: DashMap<IpAddr, usize>,
    max_per_ip: usize,
    guard_config: GuardConfig,
    query_config: QueryConfig,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
}

impl SessionManager {
    pub fn new(
        max_per_ip: usize,
        guard_config: GuardConfig,
        query_config: QueryConfig,
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            ip_counts: DashMap::new(),
            max_per_ip,
            guard_config,
            query_config,
            store,
            clock,
        }
    }

    pub fn create_session(&self, ip: IpAddr) -> Result<Session, GuardError> {
        let guard = SecurityGuard::new(self.guard_config.clone(), self.clock.clone())?;

        let mut count = self.ip_counts.entry(ip).or_insert(0);
        if *count >= self.max_per_ip {
            return Err(GuardError::Session(format!("Too many sessions from {}", ip)));
        }
        *count += 1;
        drop(count);

        let session = Session {
            id: Uuid::new_v4().to_string(),
            ip,
            guard,
            queries: HashMap::new(),
            query_defaults: self.query_config.defaults.clone(),
            max_open_queries: self.query_config.max_open_queries,
            store: self.store.clone(),
            clock: self.clock.clone(),
        };

        self.sessions.insert(
            session.id.clone(),
            SessionInfo {
                id: session.id.clone(),
                ip,
                risk_score: 0.0,
                scored_at: self.clock.now_ms(),
            },
        );
        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn update_risk(&self, id: &str, risk_score: f64) {
        if let Some(mut info) = self.sessions.get_mut(id) {
            info.risk_score = risk_score;
            info.scored_at = self.clock.now_ms();
        }
    }

    /// Snapshot score with the idle decay since it was recorded.
    pub fn current_risk(&self, info: &SessionInfo) -> f64 {
        let idle_minutes = self.clock.now_ms().saturating_sub(info.scored_at) as f64 / MS_PER_MINUTE;
        let decay = self.guard_config.behavior.decay_per_minute * idle_minutes;
        (info.risk_score - decay).clamp(0.0, 100.0)
    }

    pub fn is_suspicious(&self, id: &str) -> bool {
        self.sessions
            .get(id)
            .map_or(false, |info| self.exceeds_threshold(&info))
    }

    pub fn remove_session(&self, id: &str) {
        if let Some((_, session)) = self.sessions.remove(id) {
            self.ip_counts.entry(session.ip).and_modify(|c| {
                *c = c.saturating_sub(1);
            });
            self.ip_counts.remove_if(&session.ip, |_, c| *c == 0);
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn suspicious_count(&self) -> usize {
        self.sessions.iter().filter(|s| self.exceeds_threshold(s)).count()
    }

    fn exceeds_threshold(&self, info: &SessionInfo) -> bool {
        self.current_risk(info) > self.guard_config.behavior.suspicious_threshold
    }
}
