//! Inbound side of the streamer: accepts TCP peers and hands them to a
//! session.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::session::SessionHandle;

const ACCEPT_POLL: Duration = Duration::from_millis(20);

pub struct PeerListener {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PeerListener {
    /// Bind `addr` and start accepting. Port 0 picks a free port; see
    /// [`local_addr`](Self::local_addr).
    pub fn bind(addr: SocketAddr, session: SessionHandle) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));

        let flag = running.clone();
        let thread = thread::Builder::new()
            .name("vidlink-listen".into())
            .spawn(move || accept_loop(listener, session, flag))?;

        info!(addr = %local_addr, "listening for peers");
        Ok(PeerListener {
            local_addr,
            running,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PeerListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: TcpListener, session: SessionHandle, running: Arc<AtomicBool>) {
    while running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                // Accepted sockets may inherit non-blocking mode.
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(%peer, error = %e, "dropping peer: cannot switch to blocking mode");
                    continue;
                }
                debug!(%peer, "accepted peer");
                if let Err(e) = session.adopt(stream) {
                    warn!(%peer, error = %e, "failed to start inbound connection");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!(error = %e, "accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    debug!("listener exiting");
}
