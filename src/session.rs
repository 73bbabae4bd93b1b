//! iSCSI session state
//!
//! A session groups the connections opened by one initiator login (this
//! target enforces MaxConnections=1, so in practice one connection) and owns
//! the command sequence window every connection in the session gates on.
//! Sequence numbers live behind the session's own lock; with a single
//! connection contention is nil, but the discipline is what makes the
//! invariants hold.

use crate::error::{IscsiError, ScsiResult};
use crate::settings::{
    SessionSettingsBuilder, SessionType, Settings, SettingsHandle, DEFAULT_COMMAND_WINDOW,
};
use crate::target::Target;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

/// The portal group tag this target reports (single portal group)
pub const PORTAL_GROUP_TAG: u16 = 1;

/// How an arriving command CmdSN relates to the session window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdSnDisposition {
    /// CmdSN == ExpCmdSN: execute now
    Expected,
    /// In the window but not next: hold until the gap fills
    Queue,
    /// Outside [ExpCmdSN, MaxCmdSN]: silently dropped
    Drop,
}

/// The CmdSN sliding window (ExpCmdSN / MaxCmdSN)
#[derive(Debug, Clone, Copy)]
pub struct SequenceWindow {
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
}

impl SequenceWindow {
    pub fn new(initial_cmd_sn: u32) -> Self {
        SequenceWindow {
            exp_cmd_sn: initial_cmd_sn,
            max_cmd_sn: initial_cmd_sn.wrapping_add(DEFAULT_COMMAND_WINDOW - 1),
        }
    }

    /// Serial-arithmetic containment check, wraparound-safe
    pub fn contains(&self, sn: u32) -> bool {
        let from_exp = sn.wrapping_sub(self.exp_cmd_sn) as i32;
        let to_max = self.max_cmd_sn.wrapping_sub(sn) as i32;
        from_exp >= 0 && to_max >= 0
    }

    pub fn classify(&self, cmd_sn: u32) -> CmdSnDisposition {
        if cmd_sn == self.exp_cmd_sn {
            CmdSnDisposition::Expected
        } else if self.contains(cmd_sn) {
            CmdSnDisposition::Queue
        } else {
            CmdSnDisposition::Drop
        }
    }

    /// Advance after completing a non-immediate command
    pub fn advance(&mut self) {
        self.exp_cmd_sn = self.exp_cmd_sn.wrapping_add(1);
        self.max_cmd_sn = self.exp_cmd_sn.wrapping_add(DEFAULT_COMMAND_WINDOW - 1);
    }
}

/// Mutable session identity, filled in as login negotiation progresses
#[derive(Default)]
pub struct SessionIdentity {
    pub initiator_name: Option<String>,
    pub initiator_alias: Option<String>,
    pub session_type: SessionType,
    /// None for discovery sessions
    pub target: Option<Arc<Target>>,
}

/// One iSCSI session.
///
/// Created on the first LOGIN_REQUEST carrying TSIH=0; the TSIH is assigned
/// by the registry when login completes. Destroyed when the last connection
/// closes or on LOGOUT with reason "close session".
pub struct Session {
    isid: [u8; 6],
    tsih: AtomicU16,
    window: Mutex<SequenceWindow>,
    identity: Mutex<SessionIdentity>,
    settings: Mutex<SessionSettingsBuilder>,
    /// Latest committed settings snapshot; swapped atomically on publish
    published: SettingsHandle,
}

impl Session {
    /// Create a fresh session from the first login PDU's ISID and CmdSN.
    /// The login PDU is immediate, so ExpCmdSN starts at its CmdSN.
    pub fn new(isid: [u8; 6], initial_cmd_sn: u32) -> Self {
        Session {
            isid,
            tsih: AtomicU16::new(0),
            window: Mutex::new(SequenceWindow::new(initial_cmd_sn)),
            identity: Mutex::new(SessionIdentity::default()),
            settings: Mutex::new(SessionSettingsBuilder::default()),
            published: SettingsHandle::new(Settings::defaults()),
        }
    }

    /// Publish a committed settings snapshot. Readers holding the previous
    /// `Arc` keep a consistent view; new readers see this one.
    pub fn publish_settings(&self, snapshot: Arc<Settings>) {
        self.published.publish(snapshot);
    }

    /// The latest published settings snapshot
    pub fn current_settings(&self) -> Arc<Settings> {
        self.published.current()
    }

    pub fn isid(&self) -> [u8; 6] {
        self.isid
    }

    pub fn tsih(&self) -> u16 {
        self.tsih.load(Ordering::SeqCst)
    }

    /// Snapshot of (ExpCmdSN, MaxCmdSN) for response headers
    pub fn cmd_window(&self) -> (u32, u32) {
        match self.window.lock() {
            Ok(w) => (w.exp_cmd_sn, w.max_cmd_sn),
            Err(e) => {
                let w = e.into_inner();
                (w.exp_cmd_sn, w.max_cmd_sn)
            }
        }
    }

    /// Classify an arriving command's CmdSN against the window
    pub fn classify_cmd_sn(&self, cmd_sn: u32) -> CmdSnDisposition {
        match self.window.lock() {
            Ok(w) => w.classify(cmd_sn),
            Err(e) => e.into_inner().classify(cmd_sn),
        }
    }

    /// Advance the window after completing a non-immediate command
    pub fn advance_cmd_sn(&self) {
        match self.window.lock() {
            Ok(mut w) => w.advance(),
            Err(e) => e.into_inner().advance(),
        }
    }

    /// Run `f` with the session identity locked
    pub fn with_identity<T>(&self, f: impl FnOnce(&mut SessionIdentity) -> T) -> T {
        match self.identity.lock() {
            Ok(mut id) => f(&mut id),
            Err(e) => f(&mut e.into_inner()),
        }
    }

    /// Run `f` with the session-scoped settings builder locked
    pub fn with_settings<T>(&self, f: impl FnOnce(&mut SessionSettingsBuilder) -> T) -> T {
        match self.settings.lock() {
            Ok(mut s) => f(&mut s),
            Err(e) => f(&mut e.into_inner()),
        }
    }

    pub fn session_type(&self) -> SessionType {
        self.with_identity(|id| id.session_type)
    }

    pub fn target(&self) -> Option<Arc<Target>> {
        self.with_identity(|id| id.target.clone())
    }
}

/// The live-session set.
///
/// Insert happens on login completion (which also assigns the TSIH), removal
/// on terminal connection close. The registry enforces that no two sessions
/// share an (ISID, TargetName, PortalGroupTag) triple.
pub struct SessionRegistry {
    sessions: Mutex<Vec<Arc<Session>>>,
    next_tsih: AtomicU16,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        SessionRegistry {
            sessions: Mutex::new(Vec::new()),
            next_tsih: AtomicU16::new(1),
        }
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a TSIH and add the session to the live set.
    ///
    /// Fails when another live session already holds the same
    /// (ISID, TargetName) pair; session reinstatement is not supported.
    pub fn register(&self, session: &Arc<Session>) -> ScsiResult<u16> {
        let target_name = session
            .target()
            .map(|t| t.name().to_string())
            .unwrap_or_default();

        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| IscsiError::Session("session registry lock poisoned".to_string()))?;

        let duplicate = sessions.iter().any(|existing| {
            existing.isid() == session.isid()
                && existing
                    .target()
                    .map(|t| t.name().to_string())
                    .unwrap_or_default()
                    == target_name
        });
        if duplicate {
            return Err(IscsiError::Session(format!(
                "session for ISID {:02x?} and target {target_name:?} already exists",
                session.isid()
            )));
        }

        // TSIH 0 means "no session" on the wire; skip it on wrap
        let mut tsih = self.next_tsih.fetch_add(1, Ordering::SeqCst);
        if tsih == 0 {
            tsih = self.next_tsih.fetch_add(1, Ordering::SeqCst);
        }
        session.tsih.store(tsih, Ordering::SeqCst);

        if let Some(target) = session.target() {
            target.acquire();
        }
        sessions.push(Arc::clone(session));
        log::info!(
            "session registered: TSIH {tsih}, ISID {:02x?}, target {target_name:?}",
            session.isid()
        );
        Ok(tsih)
    }

    /// Remove a session from the live set and release its target
    pub fn remove(&self, session: &Arc<Session>) {
        let Ok(mut sessions) = self.sessions.lock() else {
            return;
        };
        let before = sessions.len();
        sessions.retain(|s| !Arc::ptr_eq(s, session));
        if sessions.len() != before {
            if let Some(target) = session.target() {
                target.release();
            }
            log::info!("session removed: TSIH {}", session.tsih());
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemBlockStore;

    #[test]
    fn test_window_classify() {
        let w = SequenceWindow::new(100);
        assert_eq!(w.max_cmd_sn, 131);
        assert_eq!(w.classify(100), CmdSnDisposition::Expected);
        assert_eq!(w.classify(101), CmdSnDisposition::Queue);
        assert_eq!(w.classify(131), CmdSnDisposition::Queue);
        assert_eq!(w.classify(132), CmdSnDisposition::Drop);
        assert_eq!(w.classify(99), CmdSnDisposition::Drop);
        assert_eq!(w.classify(50), CmdSnDisposition::Drop);
    }

    #[test]
    fn test_window_advance() {
        let mut w = SequenceWindow::new(5);
        w.advance();
        assert_eq!(w.exp_cmd_sn, 6);
        assert_eq!(w.max_cmd_sn, 6 + DEFAULT_COMMAND_WINDOW - 1);
    }

    #[test]
    fn test_window_wraparound() {
        let w = SequenceWindow::new(u32::MAX - 2);
        assert!(w.contains(u32::MAX));
        assert!(w.contains(0)); // wrapped
        assert_eq!(w.classify(u32::MAX - 2), CmdSnDisposition::Expected);
        assert_eq!(w.classify(u32::MAX - 3), CmdSnDisposition::Drop);
    }

    #[test]
    fn test_settings_publication() {
        use crate::settings::ConnectionSettingsBuilder;

        let session = Session::new([0; 6], 1);
        assert_eq!(session.current_settings().settings_id, 0);

        let snapshot =
            session.with_settings(|s| s.commit(&ConnectionSettingsBuilder::default()));
        session.publish_settings(Arc::clone(&snapshot));
        assert_eq!(session.current_settings().settings_id, 1);
    }

    #[test]
    fn test_session_window_shared() {
        let session = Session::new([1, 2, 3, 4, 5, 6], 10);
        assert_eq!(session.cmd_window(), (10, 41));
        session.advance_cmd_sn();
        assert_eq!(session.cmd_window(), (11, 42));
    }

    fn normal_session(isid: [u8; 6], target: &Arc<Target>) -> Arc<Session> {
        let session = Arc::new(Session::new(isid, 1));
        session.with_identity(|id| {
            id.session_type = SessionType::Normal;
            id.target = Some(Arc::clone(target));
        });
        session
    }

    #[test]
    fn test_registry_assigns_unique_tsih() {
        let registry = SessionRegistry::new();
        let target = Arc::new(Target::new(
            "iqn.t".to_string(),
            None,
            Arc::new(MemBlockStore::new(512)),
        ));

        let a = normal_session([1, 0, 0, 0, 0, 0], &target);
        let b = normal_session([2, 0, 0, 0, 0, 0], &target);

        let tsih_a = registry.register(&a).unwrap();
        let tsih_b = registry.register(&b).unwrap();
        assert_ne!(tsih_a, 0);
        assert_ne!(tsih_b, 0);
        assert_ne!(tsih_a, tsih_b);
        assert_eq!(registry.count(), 2);
        assert_eq!(target.session_count(), 2);
    }

    #[test]
    fn test_registry_rejects_duplicate_triple() {
        let registry = SessionRegistry::new();
        let target = Arc::new(Target::new(
            "iqn.t".to_string(),
            None,
            Arc::new(MemBlockStore::new(512)),
        ));

        let a = normal_session([9, 9, 9, 9, 9, 9], &target);
        let b = normal_session([9, 9, 9, 9, 9, 9], &target);

        registry.register(&a).unwrap();
        assert!(registry.register(&b).is_err());
    }

    #[test]
    fn test_registry_remove_releases_target() {
        let registry = SessionRegistry::new();
        let target = Arc::new(Target::new(
            "iqn.t".to_string(),
            None,
            Arc::new(MemBlockStore::new(512)),
        ));

        let s = normal_session([1, 1, 1, 1, 1, 1], &target);
        registry.register(&s).unwrap();
        assert_eq!(target.session_count(), 1);

        registry.remove(&s);
        assert_eq!(registry.count(), 0);
        assert_eq!(target.session_count(), 0);
    }
}
