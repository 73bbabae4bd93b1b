//! Login phase
//!
//! Drives the CSG/NSG stage machine of RFC 3720 Section 5.3:
//! SecurityNegotiation (0) → LoginOperationalNegotiation (1) →
//! FullFeaturePhase (3). The T bit in a request signals the initiator is
//! ready to move on; the target echoes it when it agrees. The security stage
//! may be traversed but only with AuthMethod=None; text parameters are fed
//! to the [`SettingsNegotiator`] and the committed snapshot is published
//! when the session enters full feature phase.

use crate::error::{IscsiError, ScsiResult};
use crate::pdu::{login_status, stage, IscsiPdu, LoginRequest};
use crate::session::{Session, SessionRegistry, PORTAL_GROUP_TAG};
use crate::settings::{
    ConnectionSettingsBuilder, SessionType, Settings, SettingsNegotiator,
};
use crate::target::TargetRegistry;
use std::sync::Arc;

/// Highest login version this target implements (Version-Max/Version-Active)
pub const VERSION: u8 = 0x00;

/// What the connection should do after a login PDU was handled
pub enum LoginDecision {
    /// Send the response and remain in security negotiation
    StaySecurity(IscsiPdu),
    /// Send the response and move to / remain in operational negotiation
    StayOperational(IscsiPdu),
    /// Send the response and enter full feature phase with these settings
    EnterFullFeature {
        response: IscsiPdu,
        settings: Arc<Settings>,
    },
    /// Send the response and close the connection
    Fail(IscsiPdu),
}

/// Per-connection login progress
#[derive(Default)]
pub struct LoginPhase {
    /// Text accumulated across C-bit continuation PDUs
    pending_text: Vec<(String, String)>,
    /// TargetPortalGroupTag is declared exactly once per login
    portal_group_tag_sent: bool,
}

impl LoginPhase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle one LOGIN_REQUEST PDU.
    ///
    /// `stat_sn` is the value the response will carry; the connection
    /// increments its counter after sending.
    pub fn handle(
        &mut self,
        pdu: &IscsiPdu,
        req: &LoginRequest,
        session: &Arc<Session>,
        conn_settings: &mut ConnectionSettingsBuilder,
        negotiator: &SettingsNegotiator,
        targets: &TargetRegistry,
        sessions: &SessionRegistry,
        stat_sn: u32,
    ) -> ScsiResult<LoginDecision> {
        let (exp_cmd_sn, max_cmd_sn) = session.cmd_window();

        // Binding to an existing session is not supported; a fresh login
        // must carry TSIH=0.
        if req.tsih != 0 {
            log::warn!("login with TSIH {} rejected: session reinstatement unsupported", req.tsih);
            return Ok(self.fail(
                req,
                pdu.itt,
                stat_sn,
                exp_cmd_sn,
                max_cmd_sn,
                login_status::INITIATOR_ERROR,
                login_status::SESSION_DOES_NOT_EXIST,
            ));
        }

        if req.version_min > VERSION {
            return Ok(self.fail(
                req,
                pdu.itt,
                stat_sn,
                exp_cmd_sn,
                max_cmd_sn,
                login_status::INITIATOR_ERROR,
                login_status::UNSUPPORTED_VERSION,
            ));
        }

        if req.csg != stage::SECURITY_NEGOTIATION
            && req.csg != stage::LOGIN_OPERATIONAL_NEGOTIATION
        {
            return Ok(self.fail(
                req,
                pdu.itt,
                stat_sn,
                exp_cmd_sn,
                max_cmd_sn,
                login_status::INITIATOR_ERROR,
                login_status::INITIATOR_ERROR_GENERIC,
            ));
        }

        // C bit: more text follows in another PDU; stash what we have and
        // answer with an empty response in the same stage.
        if req.cont {
            self.pending_text.extend(req.parameters.iter().cloned());
            let response = IscsiPdu::login_response(
                req.isid,
                0,
                stat_sn,
                exp_cmd_sn,
                max_cmd_sn,
                login_status::SUCCESS,
                login_status::SUCCESS_ACCEPT,
                req.csg,
                0,
                false,
                pdu.itt,
                Vec::new(),
            );
            return Ok(if req.csg == stage::SECURITY_NEGOTIATION {
                LoginDecision::StaySecurity(response)
            } else {
                LoginDecision::StayOperational(response)
            });
        }

        let mut offered = std::mem::take(&mut self.pending_text);
        offered.extend(req.parameters.iter().cloned());

        log::debug!("login CSG={} NSG={} T={} with {} parameter(s)",
            req.csg, req.nsg, req.transit, offered.len());

        let mut response_params =
            match session.with_settings(|sess| negotiator.negotiate(&offered, conn_settings, sess)) {
                Ok(params) => params,
                Err(IscsiError::Negotiation(reason)) => {
                    log::warn!("login negotiation failed: {reason}");
                    return Ok(self.fail(
                        req,
                        pdu.itt,
                        stat_sn,
                        exp_cmd_sn,
                        max_cmd_sn,
                        login_status::INITIATOR_ERROR,
                        login_status::INITIATOR_ERROR_GENERIC,
                    ));
                }
                Err(other) => return Err(other),
            };

        // The target agrees to every transition the initiator requests, so
        // the response echoes T and NSG whenever T is set.
        let transit = req.transit
            && (req.nsg == stage::FULL_FEATURE_PHASE
                || req.nsg == stage::LOGIN_OPERATIONAL_NEGOTIATION);

        if transit && req.nsg == stage::FULL_FEATURE_PHASE {
            return self.complete_login(
                pdu,
                req,
                session,
                conn_settings,
                negotiator,
                targets,
                sessions,
                stat_sn,
                response_params,
            );
        }

        if !self.portal_group_tag_sent && session_type_of(session) == SessionType::Normal {
            // Declared once, on the first response of a Normal login
            response_params.push((
                "TargetPortalGroupTag".to_string(),
                PORTAL_GROUP_TAG.to_string(),
            ));
            self.portal_group_tag_sent = true;
        }

        let response = IscsiPdu::login_response(
            req.isid,
            0,
            stat_sn,
            exp_cmd_sn,
            max_cmd_sn,
            login_status::SUCCESS,
            login_status::SUCCESS_ACCEPT,
            req.csg,
            if transit { req.nsg } else { 0 },
            transit,
            pdu.itt,
            crate::pdu::serialize_text_parameters(&response_params),
        );

        Ok(if transit || req.csg == stage::LOGIN_OPERATIONAL_NEGOTIATION {
            LoginDecision::StayOperational(response)
        } else {
            LoginDecision::StaySecurity(response)
        })
    }

    /// Final transition: bind the target, register the session, commit and
    /// publish the settings snapshot.
    fn complete_login(
        &mut self,
        pdu: &IscsiPdu,
        req: &LoginRequest,
        session: &Arc<Session>,
        conn_settings: &mut ConnectionSettingsBuilder,
        negotiator: &SettingsNegotiator,
        targets: &TargetRegistry,
        sessions: &SessionRegistry,
        stat_sn: u32,
        mut response_params: Vec<(String, String)>,
    ) -> ScsiResult<LoginDecision> {
        let (exp_cmd_sn, max_cmd_sn) = session.cmd_window();

        if let Err(missing) =
            session.with_settings(|sess| negotiator.check_required(conn_settings, sess))
        {
            log::warn!("login failed: required key {} not declared", missing.0);
            return Ok(self.fail(
                req,
                pdu.itt,
                stat_sn,
                exp_cmd_sn,
                max_cmd_sn,
                login_status::INITIATOR_ERROR,
                login_status::MISSING_PARAMETER,
            ));
        }

        let session_type = session.with_settings(|sess| sess.session_type);

        let target = if session_type == SessionType::Normal {
            let Some(name) = conn_settings.target_name.clone() else {
                return Ok(self.fail(
                    req,
                    pdu.itt,
                    stat_sn,
                    exp_cmd_sn,
                    max_cmd_sn,
                    login_status::INITIATOR_ERROR,
                    login_status::MISSING_PARAMETER,
                ));
            };
            match targets.lookup(&name) {
                Some(target) => Some(target),
                None => {
                    log::warn!("login failed: target {name:?} not found");
                    return Ok(self.fail(
                        req,
                        pdu.itt,
                        stat_sn,
                        exp_cmd_sn,
                        max_cmd_sn,
                        login_status::INITIATOR_ERROR,
                        login_status::TARGET_NOT_FOUND,
                    ));
                }
            }
        } else {
            None
        };

        session.with_identity(|id| {
            id.session_type = session_type;
            id.target = target.clone();
            session.with_settings(|sess| {
                id.initiator_name = sess.initiator_name.clone();
                id.initiator_alias = sess.initiator_alias.clone();
            });
        });

        let tsih = match sessions.register(session) {
            Ok(tsih) => tsih,
            Err(e) => {
                log::warn!("login failed: {e}");
                return Ok(self.fail(
                    req,
                    pdu.itt,
                    stat_sn,
                    exp_cmd_sn,
                    max_cmd_sn,
                    login_status::INITIATOR_ERROR,
                    login_status::INITIATOR_ERROR_GENERIC,
                ));
            }
        };

        if !self.portal_group_tag_sent && session_type == SessionType::Normal {
            response_params.push((
                "TargetPortalGroupTag".to_string(),
                PORTAL_GROUP_TAG.to_string(),
            ));
            self.portal_group_tag_sent = true;
        }
        // The alias rides on the final response of a Normal login
        if let Some(alias) = target.as_ref().and_then(|t| t.alias()) {
            response_params.push(("TargetAlias".to_string(), alias.to_string()));
        }

        let settings = session.with_settings(|sess| sess.commit(conn_settings));
        session.publish_settings(Arc::clone(&settings));
        log::info!(
            "login complete: TSIH {tsih}, {:?} session, settings id {}",
            session_type,
            settings.settings_id
        );

        let response = IscsiPdu::login_response(
            req.isid,
            tsih,
            stat_sn,
            exp_cmd_sn,
            max_cmd_sn,
            login_status::SUCCESS,
            login_status::SUCCESS_ACCEPT,
            req.csg,
            stage::FULL_FEATURE_PHASE,
            true,
            pdu.itt,
            crate::pdu::serialize_text_parameters(&response_params),
        );

        Ok(LoginDecision::EnterFullFeature { response, settings })
    }

    fn fail(
        &self,
        req: &LoginRequest,
        itt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        status_class: u8,
        status_detail: u8,
    ) -> LoginDecision {
        LoginDecision::Fail(IscsiPdu::login_response(
            req.isid,
            0,
            stat_sn,
            exp_cmd_sn,
            max_cmd_sn,
            status_class,
            status_detail,
            req.csg,
            req.nsg,
            false,
            itt,
            Vec::new(),
        ))
    }
}

fn session_type_of(session: &Arc<Session>) -> SessionType {
    session.with_settings(|sess| sess.session_type)
}
