//! iSCSI target server
//!
//! Binds the listen socket, accepts TCP connections with TCP_NODELAY and
//! hands each one to a worker thread running a [`Connection`]. The server
//! owns the target registry and the live-session set; everything protocol
//! happens downstream of the accept loop.

use crate::connection::{Connection, ConnectionContext};
use crate::error::ScsiResult;
use crate::session::SessionRegistry;
use crate::target::TargetRegistry;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Default iSCSI port
pub const ISCSI_PORT: u16 = 3260;

/// The iSCSI target server
pub struct TargetServer {
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
}

impl TargetServer {
    /// Create a builder for configuring the server
    pub fn builder() -> TargetServerBuilder {
        TargetServerBuilder::new()
    }

    /// The address the listener is bound to (useful with port 0)
    pub fn local_addr(&self) -> ScsiResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Registry of exported targets
    pub fn targets(&self) -> &Arc<TargetRegistry> {
        &self.ctx.targets
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.ctx.sessions.count()
    }

    /// Run the accept loop. Blocks until [`stop`](Self::stop) is called.
    pub fn run(&self) -> ScsiResult<()> {
        let local = self.local_addr()?;
        log::info!("iSCSI target listening on {local}");

        // Non-blocking accept so stop() is observed promptly
        self.listener.set_nonblocking(true)?;
        self.ctx.running.store(true, Ordering::SeqCst);

        while self.ctx.running.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    log::info!("new connection from {peer}");
                    if let Err(e) = stream.set_nodelay(true) {
                        log::warn!("failed to set TCP_NODELAY for {peer}: {e}");
                    }
                    let portal = stream.local_addr().unwrap_or(local);
                    let ctx = Arc::clone(&self.ctx);
                    thread::spawn(move || {
                        Connection::new(stream, peer, portal, ctx).run();
                    });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    log::error!("accept error: {e}");
                }
            }
        }

        log::info!("iSCSI target shutting down");
        Ok(())
    }

    /// Signal the accept loop (and idle connections) to stop
    pub fn stop(&self) {
        log::info!("stopping iSCSI target server");
        self.ctx.running.store(false, Ordering::SeqCst);
    }

    /// Whether the accept loop is running
    pub fn is_running(&self) -> bool {
        self.ctx.running.load(Ordering::SeqCst)
    }
}

/// Builder for configuring a [`TargetServer`]
pub struct TargetServerBuilder {
    bind_addr: Option<String>,
    allow_sloppy_negotiation: bool,
    targets: Option<Arc<TargetRegistry>>,
}

impl Default for TargetServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetServerBuilder {
    fn new() -> Self {
        TargetServerBuilder {
            bind_addr: None,
            allow_sloppy_negotiation: false,
            targets: None,
        }
    }

    /// Set the bind address (default: 0.0.0.0:3260)
    pub fn bind_addr(mut self, addr: &str) -> Self {
        self.bind_addr = Some(addr.to_string());
        self
    }

    /// Accept text negotiation that deviates slightly from RFC 3720
    pub fn allow_sloppy_negotiation(mut self, allow: bool) -> Self {
        self.allow_sloppy_negotiation = allow;
        self
    }

    /// Use a pre-populated target registry
    pub fn targets(mut self, targets: Arc<TargetRegistry>) -> Self {
        self.targets = Some(targets);
        self
    }

    /// Bind the listen socket and build the server
    pub fn bind(self) -> ScsiResult<TargetServer> {
        let bind_addr = self
            .bind_addr
            .unwrap_or_else(|| format!("0.0.0.0:{ISCSI_PORT}"));
        let listener = TcpListener::bind(&bind_addr)?;

        Ok(TargetServer {
            listener,
            ctx: Arc::new(ConnectionContext {
                targets: self.targets.unwrap_or_default(),
                sessions: Arc::new(SessionRegistry::new()),
                running: Arc::new(AtomicBool::new(false)),
                allow_sloppy_negotiation: self.allow_sloppy_negotiation,
            }),
        })
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemBlockStore;
    use crate::target::Target;

    #[test]
    fn test_builder_binds_ephemeral_port() {
        let server = TargetServer::builder()
            .bind_addr("127.0.0.1:0")
            .bind()
            .unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(!server.is_running());
    }

    #[test]
    fn test_builder_with_registry() {
        let targets = Arc::new(TargetRegistry::new());
        targets
            .add(Target::new(
                "iqn.2010-04.example:disk".to_string(),
                None,
                Arc::new(MemBlockStore::new(512)),
            ))
            .unwrap();

        let server = TargetServer::builder()
            .bind_addr("127.0.0.1:0")
            .targets(targets)
            .bind()
            .unwrap();
        assert!(server
            .targets()
            .lookup("iqn.2010-04.example:disk")
            .is_some());
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn test_bind_failure() {
        // port 1 needs privileges; binding must fail with a clean error
        let result = TargetServer::builder().bind_addr("127.0.0.1:1").bind();
        if let Ok(server) = result {
            // running as root: fall back to checking double-bind
            let addr = server.local_addr().unwrap();
            assert!(TargetServer::builder()
                .bind_addr(&addr.to_string())
                .bind()
                .is_err());
        }
    }

    #[test]
    fn test_stop_flag() {
        let server = TargetServer::builder()
            .bind_addr("127.0.0.1:0")
            .bind()
            .unwrap();
        server.ctx.running.store(true, Ordering::SeqCst);
        assert!(server.is_running());
        server.stop();
        assert!(!server.is_running());
    }
}
