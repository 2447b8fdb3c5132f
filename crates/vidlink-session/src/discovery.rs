//! Peer discovery.
//!
//! Discovery is pluggable: a host session hands each result set to
//! [`SessionHandle::update_discovered`](crate::session::SessionHandle::update_discovered),
//! which filters out its own name and republishes the list.

use std::io;
use tracing::debug;

use crate::connection::Endpoint;

pub type ResultsCallback = Box<dyn FnMut(Vec<Endpoint>) + Send>;

pub trait Discovery: Send {
    /// Begin reporting peers. `on_results` receives the complete current
    /// set each time it changes.
    fn start(&mut self, on_results: ResultsCallback) -> io::Result<()>;

    fn stop(&mut self);
}

/// Reports a fixed peer list once, on start.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    peers: Vec<Endpoint>,
    running: bool,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<Endpoint>) -> Self {
        StaticDiscovery {
            peers,
            running: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

impl Discovery for StaticDiscovery {
    fn start(&mut self, mut on_results: ResultsCallback) -> io::Result<()> {
        debug!(peers = self.peers.len(), "static discovery started");
        self.running = true;
        on_results(self.peers.clone());
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn reports_configured_peers_on_start() {
        let peers = vec![
            Endpoint::new("kitchen", "127.0.0.1:7000".parse().unwrap()),
            Endpoint::new("garage", "127.0.0.1:7001".parse().unwrap()),
        ];
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let mut discovery = StaticDiscovery::new(peers.clone());
        discovery
            .start(Box::new(move |results| sink.lock().unwrap().push(results)))
            .unwrap();
        assert!(discovery.is_running());
        assert_eq!(*seen.lock().unwrap(), vec![peers]);

        discovery.stop();
        assert!(!discovery.is_running());
    }
}
