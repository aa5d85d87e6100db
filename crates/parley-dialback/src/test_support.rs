//! In-memory collaborators for unit tests.

use crate::error::TransportError;
use crate::ports::{DomainDirectory, TimerService, TimerTask, Transport};
use crate::session::ConnectionId;
use parley_types::{DomainError, DomainPairId, Element};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Records every write, connect and close.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    written: Mutex<Vec<(ConnectionId, Vec<Element>)>>,
    closed: Mutex<HashSet<ConnectionId>>,
    stops: Mutex<Vec<(ConnectionId, bool)>>,
    connects: Mutex<Vec<(ConnectionId, DomainPairId)>>,
    next_id: AtomicU64,
}

impl RecordingTransport {
    pub(crate) fn batches(&self, conn: ConnectionId) -> Vec<Vec<Element>> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == conn)
            .map(|(_, b)| b.clone())
            .collect()
    }

    pub(crate) fn packets(&self, conn: ConnectionId) -> Vec<Element> {
        self.batches(conn).into_iter().flatten().collect()
    }

    pub(crate) fn stop_calls(&self, conn: ConnectionId) -> Vec<bool> {
        self.stops
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == conn)
            .map(|(_, forced)| *forced)
            .collect()
    }

    pub(crate) fn connects(&self) -> Vec<(ConnectionId, DomainPairId)> {
        self.connects.lock().unwrap().clone()
    }
}

impl Transport for RecordingTransport {
    fn write_packets(&self, conn: ConnectionId, packets: Vec<Element>) -> Result<(), TransportError> {
        if self.closed.lock().unwrap().contains(&conn) {
            return Err(TransportError::Closed(conn));
        }
        self.written.lock().unwrap().push((conn, packets));
        Ok(())
    }

    fn connect(&self, pair: &DomainPairId) -> Result<ConnectionId, TransportError> {
        let id = ConnectionId(1000 + self.next_id.fetch_add(1, Ordering::SeqCst));
        self.connects.lock().unwrap().push((id, pair.clone()));
        Ok(id)
    }

    fn stop(&self, conn: ConnectionId) {
        self.stops.lock().unwrap().push((conn, false));
        self.closed.lock().unwrap().insert(conn);
    }

    fn force_stop(&self, conn: ConnectionId) {
        self.stops.lock().unwrap().push((conn, true));
        self.closed.lock().unwrap().insert(conn);
    }

    fn is_open(&self, conn: ConnectionId) -> bool {
        !self.closed.lock().unwrap().contains(&conn)
    }
}

/// Fixed set of served domains.
pub(crate) struct StaticDirectory {
    domains: HashMap<String, (String, bool)>,
}

impl StaticDirectory {
    pub(crate) fn new(domains: &[(&str, &str, bool)]) -> Self {
        Self {
            domains: domains
                .iter()
                .map(|(d, s, tls)| (d.to_string(), (s.to_string(), *tls)))
                .collect(),
        }
    }
}

impl DomainDirectory for StaticDirectory {
    fn is_local_domain(&self, domain: &str) -> bool {
        self.domains.contains_key(domain)
    }

    fn secret_for(&self, local_domain: &str) -> Result<String, DomainError> {
        self.domains
            .get(local_domain)
            .map(|(secret, _)| secret.clone())
            .ok_or_else(|| DomainError::NotLocalDomain(local_domain.to_string()))
    }

    fn is_tls_required(&self, local_domain: &str) -> bool {
        self.domains.get(local_domain).is_some_and(|(_, tls)| *tls)
    }
}

/// Timer that only collects tasks; tests fire them explicitly.
#[derive(Default)]
pub(crate) struct ManualTimer {
    tasks: Mutex<Vec<(Duration, TimerTask)>>,
}

impl ManualTimer {
    pub(crate) fn delays(&self) -> Vec<Duration> {
        self.tasks.lock().unwrap().iter().map(|(d, _)| *d).collect()
    }

    pub(crate) fn fire_all(&self) {
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for (_, task) in tasks {
            task();
        }
    }
}

impl TimerService for ManualTimer {
    fn schedule(&self, delay: Duration, task: TimerTask) {
        self.tasks.lock().unwrap().push((delay, task));
    }
}
