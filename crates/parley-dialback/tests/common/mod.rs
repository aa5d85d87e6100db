//! Shared test harness: S2S managers wired through an in-memory network.
//!
//! Each server gets its own `ConnectionManager`. Transport calls only queue
//! events; `Network::run` delivers them one at a time, so no manager is ever
//! re-entered from inside its own call.

#![allow(dead_code)]

use parley_dialback::{
    ConnectionId, ConnectionManager, DomainDirectory, S2SConfig, S2SSession, StreamAttributes,
    TimerService, TimerTask, Transport, TransportError,
};
use parley_types::{DomainError, DomainPairId, Element};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Served domains: name, secret, TLS required.
pub struct StaticDirectory {
    domains: HashMap<String, (String, bool)>,
}

impl StaticDirectory {
    pub fn new(domains: &[(&str, &str, bool)]) -> Self {
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
            .map(|(s, _)| s.clone())
            .ok_or_else(|| DomainError::NotLocalDomain(local_domain.to_string()))
    }

    fn is_tls_required(&self, local_domain: &str) -> bool {
        self.domains.get(local_domain).is_some_and(|(_, tls)| *tls)
    }
}

/// Timer that never fires on its own.
#[derive(Default)]
pub struct ManualTimer {
    tasks: Mutex<Vec<(Duration, TimerTask)>>,
}

impl ManualTimer {
    pub fn fire_all(&self) {
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for (_, task) in tasks {
            task();
        }
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }
}

impl TimerService for ManualTimer {
    fn schedule(&self, delay: Duration, task: TimerTask) {
        self.tasks.lock().unwrap().push((delay, task));
    }
}

enum Event {
    Connect {
        server: usize,
        conn: ConnectionId,
        pair: DomainPairId,
    },
    Deliver {
        from: ConnectionId,
        packets: Vec<Element>,
    },
    Close {
        conn: ConnectionId,
    },
}

#[derive(Default)]
struct Wire {
    next_id: u64,
    owner: HashMap<ConnectionId, usize>,
    peers: HashMap<ConnectionId, ConnectionId>,
    closed: HashSet<ConnectionId>,
    events: VecDeque<Event>,
    sent: Vec<(ConnectionId, Element)>,
    stops: Vec<(ConnectionId, bool)>,
}

impl Wire {
    fn allocate(&mut self, server: usize) -> ConnectionId {
        self.next_id += 1;
        let conn = ConnectionId(self.next_id);
        self.owner.insert(conn, server);
        conn
    }
}

pub struct Server {
    pub manager: ConnectionManager,
    pub directory: Arc<StaticDirectory>,
}

/// A set of servers and the connections between them.
pub struct Network {
    versioned: bool,
    wire: Mutex<Wire>,
    servers: RwLock<Vec<Arc<Server>>>,
}

struct NetTransport {
    net: Arc<Network>,
    server: usize,
}

impl Transport for NetTransport {
    fn write_packets(&self, conn: ConnectionId, packets: Vec<Element>) -> Result<(), TransportError> {
        let mut wire = self.net.wire.lock().unwrap();
        if wire.closed.contains(&conn) {
            return Err(TransportError::Closed(conn));
        }
        for p in &packets {
            wire.sent.push((conn, p.clone()));
        }
        wire.events.push_back(Event::Deliver { from: conn, packets });
        Ok(())
    }

    fn connect(&self, pair: &DomainPairId) -> Result<ConnectionId, TransportError> {
        let mut wire = self.net.wire.lock().unwrap();
        let conn = wire.allocate(self.server);
        wire.events.push_back(Event::Connect {
            server: self.server,
            conn,
            pair: pair.clone(),
        });
        Ok(conn)
    }

    fn stop(&self, conn: ConnectionId) {
        self.net.close(conn, false);
    }

    fn force_stop(&self, conn: ConnectionId) {
        self.net.close(conn, true);
    }

    fn is_open(&self, conn: ConnectionId) -> bool {
        !self.net.wire.lock().unwrap().closed.contains(&conn)
    }
}

fn header(pairs: &[(&str, &str)]) -> StreamAttributes {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn attr_in(text: &str, name: &str) -> Option<String> {
    let start = text.find(&format!(" {name}='"))? + name.len() + 3;
    let len = text[start..].find('\'')?;
    Some(text[start..start + len].to_string())
}

impl Network {
    /// `versioned` streams carry `version='1.0'` and exchange features.
    pub fn new(versioned: bool) -> Arc<Self> {
        Arc::new(Self {
            versioned,
            wire: Mutex::new(Wire::default()),
            servers: RwLock::new(Vec::new()),
        })
    }

    pub fn add_server(self: &Arc<Self>, domains: &[(&str, &str, bool)], config: S2SConfig) -> usize {
        self.add_server_with_timer(domains, config, Arc::new(ManualTimer::default()))
    }

    pub fn add_server_with_timer(
        self: &Arc<Self>,
        domains: &[(&str, &str, bool)],
        config: S2SConfig,
        timer: Arc<dyn TimerService>,
    ) -> usize {
        let index = self.servers.read().unwrap().len();
        let directory = Arc::new(StaticDirectory::new(domains));
        let transport = Arc::new(NetTransport {
            net: Arc::clone(self),
            server: index,
        });
        let manager = ConnectionManager::new(config, directory.clone(), transport, timer);
        self.servers
            .write()
            .unwrap()
            .push(Arc::new(Server { manager, directory }));
        index
    }

    pub fn server(&self, index: usize) -> Arc<Server> {
        Arc::clone(&self.servers.read().unwrap()[index])
    }

    fn server_for(&self, domain: &str) -> Option<usize> {
        self.servers
            .read()
            .unwrap()
            .iter()
            .position(|s| s.directory.is_local_domain(domain))
    }

    fn close(&self, conn: ConnectionId, forced: bool) {
        let mut wire = self.wire.lock().unwrap();
        wire.stops.push((conn, forced));
        if wire.closed.insert(conn) {
            wire.events.push_back(Event::Close { conn });
        }
    }

    /// Accepts an inbound connection on `server` with no peer behind it and
    /// processes a stream header `to`/`from`.
    pub fn accept_unlinked(&self, server: usize, to: &str, from: &str) -> Arc<S2SSession> {
        let conn = self.wire.lock().unwrap().allocate(server);
        let srv = self.server(server);
        let session = srv.manager.connection_accepted(conn, "192.0.2.200");
        srv.manager.stream_opened(conn, &header(&[("to", to), ("from", from)]));
        session
    }

    /// Feeds `stanza` to the manager owning `conn` as if the peer sent it.
    pub fn inject(&self, conn: ConnectionId, stanza: &Element) -> bool {
        let owner = self.wire.lock().unwrap().owner[&conn];
        self.server(owner).manager.process(conn, stanza)
    }

    /// Sends `stanza` from `conn` to its peer through the network.
    pub fn send_from(&self, conn: ConnectionId, stanza: Element) {
        self.wire.lock().unwrap().events.push_back(Event::Deliver {
            from: conn,
            packets: vec![stanza],
        });
    }

    /// Delivers queued events until the network is idle.
    pub fn run(&self) {
        for _ in 0..10_000 {
            let event = self.wire.lock().unwrap().events.pop_front();
            match event {
                Some(Event::Connect { server, conn, pair }) => self.establish(server, conn, &pair),
                Some(Event::Deliver { from, packets }) => self.deliver(from, packets),
                Some(Event::Close { conn }) => self.propagate_close(conn),
                None => return,
            }
        }
        panic!("network did not settle");
    }

    fn establish(&self, server: usize, conn: ConnectionId, pair: &DomainPairId) {
        let source = self.server(server);
        // Unknown peers leave the connection dangling so tests can drive it.
        let Some(target_index) = self.server_for(pair.remote()) else {
            return;
        };
        let target = self.server(target_index);
        let accepted = {
            let mut wire = self.wire.lock().unwrap();
            let accepted = wire.allocate(target_index);
            wire.peers.insert(conn, accepted);
            wire.peers.insert(accepted, conn);
            accepted
        };

        target.manager.connection_accepted(accepted, "192.0.2.10");
        target.manager.service_started(accepted).unwrap();
        source.manager.service_started(conn).unwrap();

        let mut open = header(&[("to", pair.remote()), ("from", pair.local())]);
        if self.versioned {
            open.insert("version".into(), "1.0".into());
        }
        let reply = target
            .manager
            .stream_opened(accepted, &open)
            .unwrap_or_default();
        if reply.contains("<stream:error") {
            return;
        }

        let mut answer = header(&[("to", pair.local()), ("from", pair.remote())]);
        if let Some(id) = attr_in(&reply, "id") {
            answer.insert("id".into(), id);
        }
        if self.versioned {
            answer.insert("version".into(), "1.0".into());
        }
        source.manager.stream_opened(conn, &answer);
        if self.versioned {
            let features = parley_dialback::stanzas::stream_features(target.manager.stream_features(accepted));
            source.manager.process(conn, &features);
        }
    }

    fn deliver(&self, from: ConnectionId, packets: Vec<Element>) {
        let target = {
            let wire = self.wire.lock().unwrap();
            wire.peers
                .get(&from)
                .filter(|peer| !wire.closed.contains(peer))
                .map(|peer| (wire.owner[peer], *peer))
        };
        let Some((server, conn)) = target else {
            return;
        };
        let server = self.server(server);
        for packet in packets {
            server.manager.process(conn, &packet);
        }
    }

    fn propagate_close(&self, conn: ConnectionId) {
        let (owner, peer) = {
            let mut wire = self.wire.lock().unwrap();
            let owner = wire.owner[&conn];
            let peer = wire.peers.get(&conn).copied();
            let peer = peer.filter(|p| wire.closed.insert(*p));
            (owner, peer.map(|p| (wire.owner[&p], p)))
        };
        self.server(owner).manager.connection_closed(conn);
        if let Some((server, peer)) = peer {
            self.server(server).manager.connection_closed(peer);
        }
    }

    /// Everything written on `conn`, in order.
    pub fn sent_on(&self, conn: ConnectionId) -> Vec<Element> {
        self.wire
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|(c, _)| *c == conn)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Close requests for `conn`: `true` for forced.
    pub fn stops(&self, conn: ConnectionId) -> Vec<bool> {
        self.wire
            .lock()
            .unwrap()
            .stops
            .iter()
            .filter(|(c, _)| *c == conn)
            .map(|(_, forced)| *forced)
            .collect()
    }

    pub fn peer_of(&self, conn: ConnectionId) -> Option<ConnectionId> {
        self.wire.lock().unwrap().peers.get(&conn).copied()
    }

    /// Connections owned by `server`, in id order.
    pub fn connections_of(&self, server: usize) -> Vec<ConnectionId> {
        let wire = self.wire.lock().unwrap();
        let mut conns: Vec<_> = wire
            .owner
            .iter()
            .filter(|(_, s)| **s == server)
            .map(|(c, _)| *c)
            .collect();
        conns.sort();
        conns
    }
}

/// Stream header attributes for driving a manager by hand.
pub fn stream_header(pairs: &[(&str, &str)]) -> StreamAttributes {
    header(pairs)
}
