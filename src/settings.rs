//! Text parameter negotiation and negotiated settings snapshots
//!
//! RFC 3720 Section 12. Negotiation runs during login (and over TEXT
//! requests in full feature phase) and stages results into two builders:
//! connection-scoped keys into a [`ConnectionSettingsBuilder`] owned by the
//! connection, session-wide keys into a [`SessionSettingsBuilder`] owned by
//! the session. Committing materializes an immutable [`Settings`] snapshot
//! with a monotonically increasing `settings_id`; publication replaces an
//! `Arc` pointer, so readers always observe a consistent snapshot.

use crate::digest::Digest;
use crate::error::{IscsiError, ScsiResult};
use std::sync::{Arc, RwLock};

/// Session type (RFC 3720 Section 5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionType {
    /// Normal session for SCSI commands
    #[default]
    Normal,
    /// Discovery session for target discovery (SendTargets)
    Discovery,
}

/// Default command window width (MaxCmdSN - ExpCmdSN + 1)
pub const DEFAULT_COMMAND_WINDOW: u32 = 32;

// Target-preferred values offered during negotiation
const DEFAULT_MAX_RECV_DATA_SEGMENT_LENGTH: u32 = 8192;
const DEFAULT_MAX_BURST_LENGTH: u32 = 262_144;
const DEFAULT_FIRST_BURST_LENGTH: u32 = 65_536;
const DEFAULT_TIME2WAIT: u16 = 2;
const DEFAULT_TIME2RETAIN: u16 = 20;

/// Immutable snapshot of all negotiated parameters.
///
/// Once published no field changes; later negotiation rounds produce a new
/// snapshot with a higher [`settings_id`](Settings::settings_id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub settings_id: u64,

    // connection-scoped
    pub header_digest: Digest,
    pub data_digest: Digest,
    /// Largest data segment this target accepts in one PDU
    pub max_recv_data_segment_length: u32,
    /// Largest data segment the initiator accepts; caps Data-In bursts
    pub peer_max_recv_data_segment_length: u32,
    pub target_name: Option<String>,

    // session-scoped
    pub initiator_name: Option<String>,
    pub initiator_alias: Option<String>,
    pub session_type: SessionType,
    pub max_connections: u32,
    pub initial_r2t: bool,
    pub immediate_data: bool,
    pub max_burst_length: u32,
    pub first_burst_length: u32,
    pub default_time2wait: u16,
    pub default_time2retain: u16,
    pub max_outstanding_r2t: u32,
    pub data_pdu_in_order: bool,
    pub data_sequence_in_order: bool,
    pub error_recovery_level: u8,
}

impl Settings {
    /// The pre-negotiation snapshot a connection starts from. Digests are
    /// off during login; the first committed snapshot supersedes this one
    /// with `settings_id` 1.
    pub fn defaults() -> Arc<Settings> {
        let conn = ConnectionSettingsBuilder::default();
        let mut sess = SessionSettingsBuilder {
            next_settings_id: 0,
            ..SessionSettingsBuilder::default()
        };
        sess.commit(&conn)
    }
}

/// Connection-scoped negotiation state
#[derive(Debug, Clone)]
pub struct ConnectionSettingsBuilder {
    pub header_digest: Digest,
    pub data_digest: Digest,
    pub max_recv_data_segment_length: u32,
    pub peer_max_recv_data_segment_length: u32,
    pub target_name: Option<String>,
}

impl Default for ConnectionSettingsBuilder {
    fn default() -> Self {
        ConnectionSettingsBuilder {
            header_digest: Digest::None,
            data_digest: Digest::None,
            max_recv_data_segment_length: DEFAULT_MAX_RECV_DATA_SEGMENT_LENGTH,
            peer_max_recv_data_segment_length: DEFAULT_MAX_RECV_DATA_SEGMENT_LENGTH,
            target_name: None,
        }
    }
}

/// Session-wide negotiation state.
///
/// Also owns the `settings_id` counter: every committed snapshot built from
/// this builder gets the next id.
#[derive(Debug, Clone)]
pub struct SessionSettingsBuilder {
    next_settings_id: u64,
    pub initiator_name: Option<String>,
    pub initiator_alias: Option<String>,
    pub session_type: SessionType,
    pub max_connections: u32,
    pub initial_r2t: bool,
    pub immediate_data: bool,
    pub max_burst_length: u32,
    pub first_burst_length: u32,
    pub default_time2wait: u16,
    pub default_time2retain: u16,
    pub max_outstanding_r2t: u32,
    pub data_pdu_in_order: bool,
    pub data_sequence_in_order: bool,
    pub error_recovery_level: u8,
}

impl Default for SessionSettingsBuilder {
    fn default() -> Self {
        SessionSettingsBuilder {
            next_settings_id: 1,
            initiator_name: None,
            initiator_alias: None,
            session_type: SessionType::Normal,
            max_connections: 1,
            initial_r2t: false,
            immediate_data: true,
            max_burst_length: DEFAULT_MAX_BURST_LENGTH,
            first_burst_length: DEFAULT_FIRST_BURST_LENGTH,
            default_time2wait: DEFAULT_TIME2WAIT,
            default_time2retain: DEFAULT_TIME2RETAIN,
            max_outstanding_r2t: 1,
            data_pdu_in_order: true,
            data_sequence_in_order: true,
            error_recovery_level: 0,
        }
    }
}

impl SessionSettingsBuilder {
    /// Materialize an immutable snapshot from both builders, consuming the
    /// next settings id.
    pub fn commit(&mut self, conn: &ConnectionSettingsBuilder) -> Arc<Settings> {
        let id = self.next_settings_id;
        self.next_settings_id += 1;
        Arc::new(Settings {
            settings_id: id,
            header_digest: conn.header_digest,
            data_digest: conn.data_digest,
            max_recv_data_segment_length: conn.max_recv_data_segment_length,
            peer_max_recv_data_segment_length: conn.peer_max_recv_data_segment_length,
            target_name: conn.target_name.clone(),
            initiator_name: self.initiator_name.clone(),
            initiator_alias: self.initiator_alias.clone(),
            session_type: self.session_type,
            max_connections: self.max_connections,
            initial_r2t: self.initial_r2t,
            immediate_data: self.immediate_data,
            max_burst_length: self.max_burst_length,
            first_burst_length: self.first_burst_length,
            default_time2wait: self.default_time2wait,
            default_time2retain: self.default_time2retain,
            max_outstanding_r2t: self.max_outstanding_r2t,
            data_pdu_in_order: self.data_pdu_in_order,
            data_sequence_in_order: self.data_sequence_in_order,
            error_recovery_level: self.error_recovery_level,
        })
    }
}

/// Published settings slot shared between negotiation and the data path.
///
/// Replacing the snapshot swaps one `Arc`; readers clone the pointer and
/// keep a consistent view for as long as they hold it.
pub struct SettingsHandle {
    current: RwLock<Arc<Settings>>,
}

impl SettingsHandle {
    pub fn new(initial: Arc<Settings>) -> Self {
        SettingsHandle {
            current: RwLock::new(initial),
        }
    }

    pub fn current(&self) -> Arc<Settings> {
        self.current
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn publish(&self, snapshot: Arc<Settings>) {
        if let Ok(mut slot) = self.current.write() {
            *slot = snapshot;
        }
    }
}

/// Text key=value negotiator.
///
/// `sloppy` relaxes RFC 3720 strictness for permissive initiators: required
/// keys (InitiatorName, and TargetName on Normal sessions) may be omitted
/// and defaulted instead of failing the login.
pub struct SettingsNegotiator {
    sloppy: bool,
}

impl SettingsNegotiator {
    pub fn new(sloppy: bool) -> Self {
        SettingsNegotiator { sloppy }
    }

    pub fn is_sloppy(&self) -> bool {
        self.sloppy
    }

    /// Process one batch of initiator key=value pairs, staging results into
    /// the builders and returning the response pairs in offer order.
    ///
    /// Declarative keys produce no response line; negotiated keys respond
    /// with the result value; unknown keys respond `NotUnderstood`.
    /// Irreconcilable or ill-formed offers fail with
    /// [`IscsiError::Negotiation`].
    pub fn negotiate(
        &self,
        offered: &[(String, String)],
        conn: &mut ConnectionSettingsBuilder,
        sess: &mut SessionSettingsBuilder,
    ) -> ScsiResult<Vec<(String, String)>> {
        let mut response = Vec::new();

        for (key, value) in offered {
            match key.as_str() {
                // --- declarative keys: the initiator states, the target accepts
                "InitiatorName" => {
                    sess.initiator_name = Some(value.clone());
                }
                "InitiatorAlias" => {
                    sess.initiator_alias = Some(value.clone());
                }
                "TargetName" => {
                    conn.target_name = Some(value.clone());
                }
                "SessionType" => {
                    sess.session_type = match value.as_str() {
                        "Normal" => SessionType::Normal,
                        "Discovery" => SessionType::Discovery,
                        other => {
                            return Err(IscsiError::Negotiation(format!(
                                "unsupported SessionType: {other}"
                            )))
                        }
                    };
                }

                // --- security stage: only AuthMethod=None is acceptable
                "AuthMethod" => {
                    if !value.split(',').any(|m| m.trim() == "None") {
                        return Err(IscsiError::Negotiation(format!(
                            "unsupported AuthMethod offer: {value}"
                        )));
                    }
                    response.push((key.clone(), "None".to_string()));
                }

                // --- digest lists: first mutually acceptable of CRC32C, None
                "HeaderDigest" => {
                    let chosen = Digest::from_offer(value).ok_or_else(|| {
                        IscsiError::Negotiation(format!("no acceptable HeaderDigest in {value}"))
                    })?;
                    conn.header_digest = chosen;
                    response.push((key.clone(), chosen.as_text().to_string()));
                }
                "DataDigest" => {
                    let chosen = Digest::from_offer(value).ok_or_else(|| {
                        IscsiError::Negotiation(format!("no acceptable DataDigest in {value}"))
                    })?;
                    conn.data_digest = chosen;
                    response.push((key.clone(), chosen.as_text().to_string()));
                }

                // --- boolean result functions
                "ImmediateData" => {
                    // AND: target prefers Yes, so the offer decides
                    let offer = parse_boolean(key, value)?;
                    sess.immediate_data = sess.immediate_data && offer;
                    response.push((key.clone(), boolean_text(sess.immediate_data)));
                }
                "InitialR2T" => {
                    // OR: target prefers No, so the offer decides
                    let offer = parse_boolean(key, value)?;
                    sess.initial_r2t = sess.initial_r2t || offer;
                    response.push((key.clone(), boolean_text(sess.initial_r2t)));
                }
                "DataPDUInOrder" => {
                    // OR: the target requires in-order data PDUs
                    let offer = parse_boolean(key, value)?;
                    sess.data_pdu_in_order = sess.data_pdu_in_order || offer;
                    response.push((key.clone(), boolean_text(sess.data_pdu_in_order)));
                }
                "DataSequenceInOrder" => {
                    let offer = parse_boolean(key, value)?;
                    sess.data_sequence_in_order = sess.data_sequence_in_order || offer;
                    response.push((key.clone(), boolean_text(sess.data_sequence_in_order)));
                }

                // --- minimum-of numeric keys
                "MaxRecvDataSegmentLength" => {
                    let offer = parse_numeric(key, value)?;
                    // The initiator's declaration caps what we may send
                    conn.peer_max_recv_data_segment_length = offer;
                    conn.max_recv_data_segment_length =
                        conn.max_recv_data_segment_length.min(offer.max(512));
                    response.push((
                        key.clone(),
                        conn.max_recv_data_segment_length.to_string(),
                    ));
                }
                "MaxBurstLength" => {
                    let offer = parse_numeric(key, value)?;
                    sess.max_burst_length = sess.max_burst_length.min(offer);
                    response.push((key.clone(), sess.max_burst_length.to_string()));
                }
                "FirstBurstLength" => {
                    let offer = parse_numeric(key, value)?;
                    sess.first_burst_length = sess.first_burst_length.min(offer);
                    response.push((key.clone(), sess.first_burst_length.to_string()));
                }
                "DefaultTime2Wait" => {
                    let offer = parse_numeric(key, value)?;
                    sess.default_time2wait = sess.default_time2wait.min(offer as u16);
                    response.push((key.clone(), sess.default_time2wait.to_string()));
                }
                "DefaultTime2Retain" => {
                    let offer = parse_numeric(key, value)?;
                    sess.default_time2retain = sess.default_time2retain.min(offer as u16);
                    response.push((key.clone(), sess.default_time2retain.to_string()));
                }
                "MaxOutstandingR2T" => {
                    let offer = parse_numeric(key, value)?;
                    sess.max_outstanding_r2t = sess.max_outstanding_r2t.min(offer.max(1));
                    response.push((key.clone(), sess.max_outstanding_r2t.to_string()));
                }
                "ErrorRecoveryLevel" => {
                    let offer = parse_numeric(key, value)?;
                    sess.error_recovery_level = sess.error_recovery_level.min(offer as u8);
                    response.push((key.clone(), sess.error_recovery_level.to_string()));
                }
                "MaxConnections" => {
                    // Clamped to 1 for interoperability rather than rejected
                    let _ = parse_numeric(key, value)?;
                    sess.max_connections = 1;
                    response.push((key.clone(), "1".to_string()));
                }

                // --- markers are not supported
                "IFMarker" | "OFMarker" => {
                    response.push((key.clone(), "No".to_string()));
                }
                "IFMarkInt" | "OFMarkInt" => {
                    response.push((key.clone(), "Irrelevant".to_string()));
                }

                _ => {
                    log::debug!("negotiation: unknown key {key}={value}");
                    response.push((key.clone(), "NotUnderstood".to_string()));
                }
            }
        }

        Ok(response)
    }

    /// Check that the keys RFC 3720 requires for a login were declared.
    /// In sloppy mode missing keys are tolerated and defaulted.
    pub fn check_required(
        &self,
        conn: &ConnectionSettingsBuilder,
        sess: &SessionSettingsBuilder,
    ) -> Result<(), MissingKey> {
        if self.sloppy {
            return Ok(());
        }
        if sess.initiator_name.is_none() {
            return Err(MissingKey("InitiatorName"));
        }
        if sess.session_type == SessionType::Normal && conn.target_name.is_none() {
            return Err(MissingKey("TargetName"));
        }
        Ok(())
    }
}

/// A required negotiation key that the initiator never declared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingKey(pub &'static str);

fn parse_boolean(key: &str, value: &str) -> ScsiResult<bool> {
    match value {
        "Yes" => Ok(true),
        "No" => Ok(false),
        other => Err(IscsiError::Negotiation(format!(
            "{key}: expected Yes or No, got {other}"
        ))),
    }
}

fn boolean_text(v: bool) -> String {
    if v { "Yes" } else { "No" }.to_string()
}

fn parse_numeric(key: &str, value: &str) -> ScsiResult<u32> {
    value
        .parse::<u32>()
        .map_err(|_| IscsiError::Negotiation(format!("{key}: invalid numeric value {value}")))
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(entries: &[(&str, &str)]) -> Vec<(String, String)> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn value<'a>(response: &'a [(String, String)], key: &str) -> Option<&'a str> {
        response
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_declarative_keys_not_echoed() {
        let neg = SettingsNegotiator::new(false);
        let mut conn = ConnectionSettingsBuilder::default();
        let mut sess = SessionSettingsBuilder::default();

        let response = neg
            .negotiate(
                &pairs(&[
                    ("InitiatorName", "iqn.2010-04.example:init"),
                    ("TargetName", "iqn.2010-04.example:disk"),
                    ("SessionType", "Normal"),
                ]),
                &mut conn,
                &mut sess,
            )
            .unwrap();

        assert!(response.is_empty());
        assert_eq!(sess.initiator_name.as_deref(), Some("iqn.2010-04.example:init"));
        assert_eq!(conn.target_name.as_deref(), Some("iqn.2010-04.example:disk"));
    }

    #[test]
    fn test_digest_pick_first_acceptable() {
        let neg = SettingsNegotiator::new(false);
        let mut conn = ConnectionSettingsBuilder::default();
        let mut sess = SessionSettingsBuilder::default();

        let response = neg
            .negotiate(
                &pairs(&[("HeaderDigest", "CRC32C,None"), ("DataDigest", "None")]),
                &mut conn,
                &mut sess,
            )
            .unwrap();

        assert_eq!(value(&response, "HeaderDigest"), Some("CRC32C"));
        assert_eq!(value(&response, "DataDigest"), Some("None"));
        assert_eq!(conn.header_digest, Digest::Crc32c);
        assert_eq!(conn.data_digest, Digest::None);
    }

    #[test]
    fn test_digest_irreconcilable() {
        let neg = SettingsNegotiator::new(false);
        let mut conn = ConnectionSettingsBuilder::default();
        let mut sess = SessionSettingsBuilder::default();

        let err = neg.negotiate(&pairs(&[("HeaderDigest", "MD5")]), &mut conn, &mut sess);
        assert!(err.is_err());
    }

    #[test]
    fn test_boolean_result_functions() {
        let neg = SettingsNegotiator::new(false);
        let mut conn = ConnectionSettingsBuilder::default();
        let mut sess = SessionSettingsBuilder::default();

        // ImmediateData is AND with target preference Yes
        let response = neg
            .negotiate(&pairs(&[("ImmediateData", "No")]), &mut conn, &mut sess)
            .unwrap();
        assert_eq!(value(&response, "ImmediateData"), Some("No"));
        assert!(!sess.immediate_data);

        // InitialR2T is OR with target preference No
        let response = neg
            .negotiate(&pairs(&[("InitialR2T", "Yes")]), &mut conn, &mut sess)
            .unwrap();
        assert_eq!(value(&response, "InitialR2T"), Some("Yes"));
        assert!(sess.initial_r2t);
    }

    #[test]
    fn test_minimum_of_keys() {
        let neg = SettingsNegotiator::new(false);
        let mut conn = ConnectionSettingsBuilder::default();
        let mut sess = SessionSettingsBuilder::default();

        let response = neg
            .negotiate(
                &pairs(&[
                    ("MaxBurstLength", "4096"),
                    ("FirstBurstLength", "131072"),
                    ("MaxRecvDataSegmentLength", "65536"),
                ]),
                &mut conn,
                &mut sess,
            )
            .unwrap();

        assert_eq!(value(&response, "MaxBurstLength"), Some("4096"));
        assert_eq!(sess.max_burst_length, 4096);
        // our preference was lower than the offer
        assert_eq!(value(&response, "FirstBurstLength"), Some("65536"));
        assert_eq!(value(&response, "MaxRecvDataSegmentLength"), Some("8192"));
        assert_eq!(conn.peer_max_recv_data_segment_length, 65536);
    }

    #[test]
    fn test_max_connections_clamped() {
        let neg = SettingsNegotiator::new(false);
        let mut conn = ConnectionSettingsBuilder::default();
        let mut sess = SessionSettingsBuilder::default();

        let response = neg
            .negotiate(&pairs(&[("MaxConnections", "8")]), &mut conn, &mut sess)
            .unwrap();
        assert_eq!(value(&response, "MaxConnections"), Some("1"));
        assert_eq!(sess.max_connections, 1);
    }

    #[test]
    fn test_unknown_key_not_understood() {
        let neg = SettingsNegotiator::new(false);
        let mut conn = ConnectionSettingsBuilder::default();
        let mut sess = SessionSettingsBuilder::default();

        let response = neg
            .negotiate(&pairs(&[("X-com.example.custom", "1")]), &mut conn, &mut sess)
            .unwrap();
        assert_eq!(value(&response, "X-com.example.custom"), Some("NotUnderstood"));
    }

    #[test]
    fn test_response_preserves_offer_order() {
        let neg = SettingsNegotiator::new(false);
        let mut conn = ConnectionSettingsBuilder::default();
        let mut sess = SessionSettingsBuilder::default();

        let response = neg
            .negotiate(
                &pairs(&[
                    ("MaxBurstLength", "262144"),
                    ("HeaderDigest", "None"),
                    ("InitialR2T", "No"),
                ]),
                &mut conn,
                &mut sess,
            )
            .unwrap();

        let keys: Vec<&str> = response.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["MaxBurstLength", "HeaderDigest", "InitialR2T"]);
    }

    #[test]
    fn test_required_keys_strict_vs_sloppy() {
        let conn = ConnectionSettingsBuilder::default();
        let sess = SessionSettingsBuilder::default();

        let strict = SettingsNegotiator::new(false);
        assert_eq!(
            strict.check_required(&conn, &sess),
            Err(MissingKey("InitiatorName"))
        );

        let sloppy = SettingsNegotiator::new(true);
        assert_eq!(sloppy.check_required(&conn, &sess), Ok(()));
    }

    #[test]
    fn test_settings_id_monotonic() {
        let conn = ConnectionSettingsBuilder::default();
        let mut sess = SessionSettingsBuilder::default();

        let first = sess.commit(&conn);
        let second = sess.commit(&conn);
        assert!(second.settings_id > first.settings_id);
    }

    #[test]
    fn test_snapshot_publication() {
        let mut conn = ConnectionSettingsBuilder::default();
        let mut sess = SessionSettingsBuilder::default();

        let handle = SettingsHandle::new(sess.commit(&conn));
        let before = handle.current();
        assert_eq!(before.header_digest, Digest::None);

        conn.header_digest = Digest::Crc32c;
        handle.publish(sess.commit(&conn));

        // the old snapshot is untouched, the slot sees the new one
        assert_eq!(before.header_digest, Digest::None);
        assert_eq!(handle.current().header_digest, Digest::Crc32c);
        assert!(handle.current().settings_id > before.settings_id);
    }

    #[test]
    fn test_malformed_numeric() {
        let neg = SettingsNegotiator::new(false);
        let mut conn = ConnectionSettingsBuilder::default();
        let mut sess = SessionSettingsBuilder::default();
        assert!(neg
            .negotiate(&pairs(&[("MaxBurstLength", "lots")]), &mut conn, &mut sess)
            .is_err());
    }

    #[test]
    fn test_auth_method_none_only() {
        let neg = SettingsNegotiator::new(false);
        let mut conn = ConnectionSettingsBuilder::default();
        let mut sess = SessionSettingsBuilder::default();

        let response = neg
            .negotiate(&pairs(&[("AuthMethod", "CHAP,None")]), &mut conn, &mut sess)
            .unwrap();
        assert_eq!(value(&response, "AuthMethod"), Some("None"));

        assert!(neg
            .negotiate(&pairs(&[("AuthMethod", "CHAP")]), &mut conn, &mut sess)
            .is_err());
    }
}
