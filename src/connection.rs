//! Per-TCP-connection state machine
//!
//! Each accepted socket is driven by one [`Connection`]: read a PDU,
//! dispatch it according to the current phase, write the responses. During
//! login PDUs go to the [`LoginPhase`]; in full feature phase SCSI commands
//! are gated on the session's CmdSN window, solicited write data is routed
//! to the transfer engine by ITT, and wire-format errors are answered with
//! REJECT PDUs without tearing the connection down.

use crate::error::{CodecError, IscsiError, ScsiResult};
use crate::login::{LoginDecision, LoginPhase};
use crate::pdu::{
    self, logout_response, opcode, reject_reason, scsi_status, IscsiPdu, NopOutPdu, Request,
    ScsiCommandPdu, ScsiDataOutPdu, TextRequest, RESERVED_TAG,
};
use crate::scsi::{ScsiHandler, ScsiOutcome, ScsiResponse, SenseData};
use crate::session::{CmdSnDisposition, Session, SessionRegistry};
use crate::settings::{
    ConnectionSettingsBuilder, SessionType, Settings, SettingsNegotiator,
};
use crate::target::TargetRegistry;
use crate::transfer::WriteTransfer;
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Connection phases (RFC 3720 Section 5.3 plus teardown)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    SecurityNegotiation,
    LoginOperational,
    FullFeature,
    LogoutPending,
    Closed,
}

/// Read timeout while a login is still in progress; stalled logins are cut
/// quickly so half-open sockets cannot pile up.
const LOGIN_READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Read timeout once in full feature phase
const FULL_FEATURE_READ_TIMEOUT: Duration = Duration::from_secs(300);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared server state handed to every connection
pub struct ConnectionContext {
    pub targets: Arc<TargetRegistry>,
    pub sessions: Arc<SessionRegistry>,
    pub running: Arc<AtomicBool>,
    pub allow_sloppy_negotiation: bool,
}

/// One TCP connection and its protocol state
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    /// The local address the initiator reached us on; reported by SendTargets
    portal: SocketAddr,
    ctx: Arc<ConnectionContext>,

    phase: Phase,
    cid: u16,
    stat_sn: u32,
    settings: Arc<Settings>,
    conn_settings: ConnectionSettingsBuilder,
    negotiator: SettingsNegotiator,
    login: LoginPhase,
    session: Option<Arc<Session>>,

    /// In-flight WRITE transfers keyed by ITT
    pending_writes: HashMap<u32, WriteTransfer>,
    /// In-window commands waiting for the CmdSN gap to fill, keyed by CmdSN
    queued_commands: BTreeMap<u32, IscsiPdu>,
    /// Sense data from the last CHECK CONDITION, for REQUEST SENSE
    last_sense: Option<Vec<u8>>,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        portal: SocketAddr,
        ctx: Arc<ConnectionContext>,
    ) -> Self {
        let sloppy = ctx.allow_sloppy_negotiation;
        Connection {
            stream,
            peer,
            portal,
            ctx,
            phase: Phase::SecurityNegotiation,
            cid: 0,
            stat_sn: 0,
            settings: Settings::defaults(),
            conn_settings: ConnectionSettingsBuilder::default(),
            negotiator: SettingsNegotiator::new(sloppy),
            login: LoginPhase::new(),
            session: None,
            pending_writes: HashMap::new(),
            queued_commands: BTreeMap::new(),
            last_sense: None,
        }
    }

    /// Drive the connection until it closes. Consumes the connection.
    pub fn run(mut self) {
        if let Err(e) = self.run_inner() {
            log::error!("connection {} terminated: {e}", self.peer);
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(session) = self.session.take() {
            if session.tsih() != 0 {
                self.ctx.sessions.remove(&session);
            }
        }
        log::info!("connection closed from {}", self.peer);
    }

    fn run_inner(&mut self) -> ScsiResult<()> {
        self.stream.set_nonblocking(false)?;
        self.stream.set_read_timeout(Some(LOGIN_READ_TIMEOUT))?;
        self.stream.set_write_timeout(Some(WRITE_TIMEOUT))?;

        let mut first_pdu = true;
        while !matches!(self.phase, Phase::Closed | Phase::LogoutPending)
            && self.ctx.running.load(Ordering::SeqCst)
        {
            // Digests only take effect once login has completed
            let (hd, dd) = match self.phase {
                Phase::FullFeature | Phase::LogoutPending => {
                    (self.settings.header_digest, self.settings.data_digest)
                }
                _ => (crate::digest::Digest::None, crate::digest::Digest::None),
            };

            let limit = self.settings.max_recv_data_segment_length;
            let pdu = match pdu::read_pdu(&mut self.stream, hd, dd, limit) {
                Ok(pdu) => pdu,
                Err(IscsiError::Codec(CodecError::HeaderDigestMismatch { header, .. })) => {
                    log::warn!("header digest mismatch from {}", self.peer);
                    self.send_reject(reject_reason::HEADER_DIGEST_ERROR, header.as_ref())?;
                    continue;
                }
                Err(IscsiError::Codec(CodecError::DataDigestMismatch { header, .. })) => {
                    log::warn!("data digest mismatch from {}", self.peer);
                    self.send_reject(reject_reason::DATA_DIGEST_ERROR, header.as_ref())?;
                    continue;
                }
                Err(IscsiError::Codec(CodecError::OversizedDataSegment {
                    length, header, ..
                })) => {
                    log::warn!(
                        "{}: data segment of {length} bytes exceeds the negotiated {limit}",
                        self.peer
                    );
                    self.send_reject(reject_reason::PROTOCOL_ERROR, header.as_ref())?;
                    continue;
                }
                Err(IscsiError::Io(ref e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    log::debug!("connection closed by initiator {}", self.peer);
                    break;
                }
                Err(IscsiError::Io(ref e))
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    log::debug!("read timeout on {}, closing", self.peer);
                    break;
                }
                Err(e) => return Err(e),
            };

            log::debug!(
                "{}: received {} (opcode 0x{:02x})",
                self.peer,
                pdu.opcode_name(),
                pdu.opcode
            );

            // The very first PDU on a socket must be a login request;
            // anything else closes the socket without an answer.
            if first_pdu {
                first_pdu = false;
                if pdu.opcode != opcode::LOGIN_REQUEST {
                    log::warn!(
                        "{}: first PDU was {} instead of Login Request, dropping connection",
                        self.peer,
                        pdu.opcode_name()
                    );
                    break;
                }
            }

            match self.phase {
                Phase::SecurityNegotiation | Phase::LoginOperational => {
                    self.handle_login_pdu(&pdu)?;
                }
                Phase::FullFeature => {
                    self.handle_full_feature_pdu(&pdu)?;
                }
                // Logout drains before the response is sent; by the time the
                // phase reads LogoutPending the loop condition ends the
                // connection without another read.
                Phase::LogoutPending | Phase::Closed => break,
            }
        }

        // Server shutdown mid-session: ask the initiator to log out before
        // the socket goes away.
        if self.phase == Phase::FullFeature && !self.ctx.running.load(Ordering::SeqCst) {
            let (exp_cmd_sn, max_cmd_sn) = self.cmd_window();
            let stat_sn = self.next_stat_sn();
            let logout_request = IscsiPdu::async_message(
                pdu::async_event::LOGOUT_REQUESTED,
                stat_sn,
                exp_cmd_sn,
                max_cmd_sn,
                self.settings.default_time2wait,
            );
            let _ = self.send(&logout_request);
        }

        Ok(())
    }

    /// StatSN of the next status-bearing response; strictly increasing
    fn next_stat_sn(&mut self) -> u32 {
        let sn = self.stat_sn;
        self.stat_sn = self.stat_sn.wrapping_add(1);
        sn
    }

    fn cmd_window(&self) -> (u32, u32) {
        self.session
            .as_ref()
            .map(|s| s.cmd_window())
            .unwrap_or((0, 0))
    }

    fn send(&mut self, pdu: &IscsiPdu) -> ScsiResult<()> {
        // Responses always use the digests of the published snapshot
        let (hd, dd) = match self.phase {
            Phase::FullFeature | Phase::LogoutPending => {
                (self.settings.header_digest, self.settings.data_digest)
            }
            _ => (crate::digest::Digest::None, crate::digest::Digest::None),
        };
        log::debug!(
            "{}: sending {} (opcode 0x{:02x})",
            self.peer,
            pdu.opcode_name(),
            pdu.opcode
        );
        pdu::write_pdu(&mut self.stream, pdu, hd, dd)
    }

    fn send_all(&mut self, pdus: Vec<IscsiPdu>) -> ScsiResult<()> {
        for pdu in &pdus {
            self.send(pdu)?;
        }
        Ok(())
    }

    fn send_reject(&mut self, reason: u8, bad_header: &[u8]) -> ScsiResult<()> {
        let (exp_cmd_sn, max_cmd_sn) = self.cmd_window();
        let stat_sn = self.next_stat_sn();
        let reject = IscsiPdu::reject(reason, stat_sn, exp_cmd_sn, max_cmd_sn, bad_header);
        self.send(&reject)
    }

    // ------------------------------------------------------------------
    // Login phases
    // ------------------------------------------------------------------

    fn handle_login_pdu(&mut self, pdu: &IscsiPdu) -> ScsiResult<()> {
        if pdu.opcode != opcode::LOGIN_REQUEST {
            // RFC 3720 Section 5.3.1: non-login PDUs during login are fatal
            log::warn!(
                "{}: {} during login phase, dropping connection",
                self.peer,
                pdu.opcode_name()
            );
            self.phase = Phase::Closed;
            return Ok(());
        }

        let req = match pdu.parse_login_request() {
            Ok(req) => req,
            Err(e) => {
                log::warn!("{}: malformed login request: {e}", self.peer);
                self.phase = Phase::Closed;
                return Ok(());
            }
        };

        // First login PDU of the connection creates the session object
        if self.session.is_none() {
            self.cid = req.cid;
            self.session = Some(Arc::new(Session::new(req.isid, req.cmd_sn)));
        }
        let session = Arc::clone(self.session.as_ref().ok_or_else(|| {
            IscsiError::Session("login without session".to_string())
        })?);

        let stat_sn = self.next_stat_sn();
        let decision = self.login.handle(
            pdu,
            &req,
            &session,
            &mut self.conn_settings,
            &self.negotiator,
            &self.ctx.targets,
            &self.ctx.sessions,
            stat_sn,
        )?;

        match decision {
            LoginDecision::StaySecurity(response) => {
                self.send(&response)?;
                self.phase = Phase::SecurityNegotiation;
            }
            LoginDecision::StayOperational(response) => {
                self.send(&response)?;
                self.phase = Phase::LoginOperational;
            }
            LoginDecision::EnterFullFeature { response, settings } => {
                self.send(&response)?;
                self.settings = settings;
                self.phase = Phase::FullFeature;
                self.stream
                    .set_read_timeout(Some(FULL_FEATURE_READ_TIMEOUT))?;
                log::info!(
                    "{}: entered full feature phase (TSIH {}, CID {})",
                    self.peer,
                    session.tsih(),
                    self.cid
                );
            }
            LoginDecision::Fail(response) => {
                self.send(&response)?;
                self.phase = Phase::Closed;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Full feature phase
    // ------------------------------------------------------------------

    fn handle_full_feature_pdu(&mut self, pdu: &IscsiPdu) -> ScsiResult<()> {
        let request = match pdu.parse_request() {
            Ok(req) => req,
            Err(e) => {
                log::warn!("{}: undecodable PDU: {e}", self.peer);
                return self.send_reject(reject_reason::PROTOCOL_ERROR, &pdu.bhs_bytes());
            }
        };

        // Data-Out carries no CmdSN; route it straight to the transfer engine
        if let Request::DataOut(data_out) = request {
            let responses = self.handle_data_out(&data_out)?;
            return self.send_all(responses);
        }

        // An ExpStatSN acknowledging responses never sent is a protocol error
        let esn = pdu.exp_stat_sn();
        if (self.stat_sn.wrapping_sub(esn) as i32) < 0 {
            log::warn!(
                "{}: ExpStatSN {esn} outside window (StatSN {})",
                self.peer,
                self.stat_sn
            );
            return self.send_reject(reject_reason::PROTOCOL_ERROR, &pdu.bhs_bytes());
        }

        if pdu.immediate {
            // Immediate commands execute on arrival and never move the window
            let responses = self.execute_request(pdu)?;
            return self.send_all(responses);
        }

        let session = self.session.as_ref().ok_or_else(|| {
            IscsiError::Session("full feature phase without session".to_string())
        })?;
        match session.classify_cmd_sn(pdu.cmd_sn()) {
            CmdSnDisposition::Expected => {
                let responses = self.execute_and_advance(pdu.clone())?;
                self.send_all(responses)?;
                self.drain_queued()
            }
            CmdSnDisposition::Queue => {
                log::debug!(
                    "{}: queueing CmdSN {} (ExpCmdSN {})",
                    self.peer,
                    pdu.cmd_sn(),
                    session.cmd_window().0
                );
                self.queued_commands.insert(pdu.cmd_sn(), pdu.clone());
                Ok(())
            }
            CmdSnDisposition::Drop => {
                // Outside [ExpCmdSN, MaxCmdSN]: silently dropped
                log::warn!(
                    "{}: dropping PDU with CmdSN {} outside window",
                    self.peer,
                    pdu.cmd_sn()
                );
                Ok(())
            }
        }
    }

    /// Execute a non-immediate command and advance the session window
    fn execute_and_advance(&mut self, pdu: IscsiPdu) -> ScsiResult<Vec<IscsiPdu>> {
        let responses = self.execute_request(&pdu)?;
        if let Some(session) = self.session.as_ref() {
            session.advance_cmd_sn();
        }
        Ok(responses)
    }

    /// Run queued commands that have become the expected CmdSN
    fn drain_queued(&mut self) -> ScsiResult<()> {
        loop {
            let (exp_cmd_sn, _) = self.cmd_window();
            let Some(pdu) = self.queued_commands.remove(&exp_cmd_sn) else {
                return Ok(());
            };
            let responses = self.execute_and_advance(pdu)?;
            self.send_all(responses)?;
            if self.phase != Phase::FullFeature {
                return Ok(());
            }
        }
    }

    /// Dispatch one in-window (or immediate) request PDU
    fn execute_request(&mut self, pdu: &IscsiPdu) -> ScsiResult<Vec<IscsiPdu>> {
        match pdu.parse_request()? {
            Request::ScsiCommand(cmd) => self.handle_scsi_command(pdu, &cmd),
            Request::NopOut(nop) => self.handle_nop_out(&nop),
            Request::Text(text) => self.handle_text_request(&text),
            Request::Logout(logout) => {
                log::info!(
                    "{}: logout requested (reason {})",
                    self.peer,
                    logout.reason
                );
                // Pending R2T waits are released; in-flight state is dropped
                self.pending_writes.clear();
                self.queued_commands.clear();

                let (exp_cmd_sn, max_cmd_sn) = self.cmd_window();
                let stat_sn = self.next_stat_sn();
                let response = IscsiPdu::logout_response(
                    logout.itt,
                    stat_sn,
                    exp_cmd_sn,
                    max_cmd_sn,
                    logout_response::SUCCESS,
                    self.settings.default_time2wait,
                    self.settings.default_time2retain,
                );
                self.phase = Phase::LogoutPending;
                Ok(vec![response])
            }
            Request::TaskManagement(tm) => {
                log::debug!("{}: task management function {}", self.peer, tm.function);
                let (exp_cmd_sn, max_cmd_sn) = self.cmd_window();
                let stat_sn = self.next_stat_sn();
                Ok(vec![IscsiPdu::task_management_response(
                    tm.itt, stat_sn, exp_cmd_sn, max_cmd_sn, 0,
                )])
            }
            Request::Login(_) => {
                // Login after full feature phase is a protocol violation
                self.phase = Phase::Closed;
                Ok(Vec::new())
            }
            Request::DataOut(_) => unreachable!("Data-Out is routed before dispatch"),
            Request::Unsupported(op) => {
                log::warn!("{}: unsupported opcode 0x{op:02x}", self.peer);
                let (exp_cmd_sn, max_cmd_sn) = self.cmd_window();
                let stat_sn = self.next_stat_sn();
                Ok(vec![IscsiPdu::reject(
                    reject_reason::COMMAND_NOT_SUPPORTED,
                    stat_sn,
                    exp_cmd_sn,
                    max_cmd_sn,
                    &pdu.bhs_bytes(),
                )])
            }
        }
    }

    // ------------------------------------------------------------------
    // SCSI commands
    // ------------------------------------------------------------------

    fn handle_scsi_command(
        &mut self,
        pdu: &IscsiPdu,
        cmd: &ScsiCommandPdu,
    ) -> ScsiResult<Vec<IscsiPdu>> {
        let session = self.session.as_ref().ok_or_else(|| {
            IscsiError::Session("SCSI command without session".to_string())
        })?;
        let Some(target) = session.target() else {
            // Discovery sessions carry no target; SCSI commands are invalid
            return self.scsi_check_condition(cmd.itt, SenseData::lun_not_supported());
        };

        log::debug!(
            "{}: CDB 0x{:02x} ITT 0x{:08x} edtl {}",
            self.peer,
            cmd.cdb[0],
            cmd.itt,
            cmd.expected_data_length
        );

        let outcome = ScsiHandler::dispatch(&cmd.cdb, cmd.lun, &target, self.last_sense.as_deref())?;
        match outcome {
            ScsiOutcome::Complete(response) => self.finish_scsi_command(cmd, response),
            ScsiOutcome::StartWrite { lba, blocks } => self.begin_write(pdu, cmd, lba, blocks),
        }
    }

    /// Emit the Data-In burst and/or SCSI response for a completed command
    fn finish_scsi_command(
        &mut self,
        cmd: &ScsiCommandPdu,
        response: ScsiResponse,
    ) -> ScsiResult<Vec<IscsiPdu>> {
        // Remember sense data for a later REQUEST SENSE
        match (&response.sense, response.status) {
            (Some(sense), _) => self.last_sense = Some(sense.to_bytes()),
            (None, scsi_status::GOOD) => self.last_sense = None,
            _ => {}
        }

        let (exp_cmd_sn, max_cmd_sn) = self.cmd_window();

        let mut data = response.data;
        if data.len() > cmd.expected_data_length as usize {
            data.truncate(cmd.expected_data_length as usize);
        }

        if cmd.read && !data.is_empty() && response.status == scsi_status::GOOD {
            // Burst the payload in Data-In PDUs capped by the initiator's
            // declared receive limit, DataSN counting from 0, and collapse
            // the GOOD status into the final PDU.
            let max_seg = self.settings.peer_max_recv_data_segment_length.max(512) as usize;
            let mut responses = Vec::new();
            let mut offset = 0usize;
            let mut data_sn = 0u32;
            while offset < data.len() {
                let chunk_len = (data.len() - offset).min(max_seg);
                let is_final = offset + chunk_len >= data.len();
                let stat_sn = if is_final { self.next_stat_sn() } else { 0 };
                responses.push(IscsiPdu::scsi_data_in(
                    cmd.itt,
                    stat_sn,
                    exp_cmd_sn,
                    max_cmd_sn,
                    data_sn,
                    offset as u32,
                    data[offset..offset + chunk_len].to_vec(),
                    is_final,
                    if is_final { Some(scsi_status::GOOD) } else { None },
                ));
                offset += chunk_len;
                data_sn += 1;
            }
            return Ok(responses);
        }

        let sense_bytes = response.sense.map(|s| s.to_bytes());
        let stat_sn = self.next_stat_sn();
        Ok(vec![IscsiPdu::scsi_response(
            cmd.itt,
            stat_sn,
            exp_cmd_sn,
            max_cmd_sn,
            response.status,
            0, // command completed at target
            0,
            sense_bytes.as_deref(),
        )])
    }

    fn scsi_check_condition(
        &mut self,
        itt: u32,
        sense: SenseData,
    ) -> ScsiResult<Vec<IscsiPdu>> {
        let (exp_cmd_sn, max_cmd_sn) = self.cmd_window();
        self.last_sense = Some(sense.to_bytes());
        let stat_sn = self.next_stat_sn();
        Ok(vec![IscsiPdu::scsi_response(
            itt,
            stat_sn,
            exp_cmd_sn,
            max_cmd_sn,
            scsi_status::CHECK_CONDITION,
            0,
            0,
            Some(&sense.to_bytes()),
        )])
    }

    // ------------------------------------------------------------------
    // Write transfers
    // ------------------------------------------------------------------

    fn begin_write(
        &mut self,
        pdu: &IscsiPdu,
        cmd: &ScsiCommandPdu,
        lba: u64,
        blocks: u32,
    ) -> ScsiResult<Vec<IscsiPdu>> {
        let block_size = self
            .session
            .as_ref()
            .and_then(|s| s.target())
            .map(|t| t.store().block_size())
            .unwrap_or(crate::storage::VIRTUAL_BLOCK_SIZE);

        let mut transfer = WriteTransfer::new(cmd.itt, lba, blocks, block_size);

        // Immediate data rides in the command PDU itself, capped by
        // FirstBurstLength.
        if !pdu.data.is_empty() {
            if !self.settings.immediate_data {
                log::warn!(
                    "{}: immediate data on ITT 0x{:08x} but ImmediateData=No",
                    self.peer,
                    cmd.itt
                );
                return self.scsi_check_condition(cmd.itt, SenseData::invalid_field_in_cdb());
            }
            let cap = self.settings.first_burst_length as usize;
            if pdu.data.len() > cap {
                log::warn!(
                    "{}: immediate data of {} bytes exceeds FirstBurstLength {}",
                    self.peer,
                    pdu.data.len(),
                    cap
                );
                return self.scsi_check_condition(cmd.itt, SenseData::invalid_field_in_cdb());
            }
            transfer.absorb(0, &pdu.data)?;
        }

        if transfer.is_complete() {
            return self.complete_write(cmd.itt, transfer);
        }

        // With InitialR2T=No the initiator may still send an unsolicited
        // Data-Out sequence up to FirstBurstLength; solicitation starts only
        // after it ends (or immediately when the command was marked final).
        let expect_unsolicited = !self.settings.initial_r2t
            && !cmd.final_flag
            && transfer.bytes_received() < self.settings.first_burst_length;

        let mut responses = Vec::new();
        if !expect_unsolicited {
            responses.extend(self.solicit(&mut transfer)?);
        }
        self.pending_writes.insert(cmd.itt, transfer);
        Ok(responses)
    }

    /// Emit R2Ts up to the negotiated outstanding limit
    fn solicit(&mut self, transfer: &mut WriteTransfer) -> ScsiResult<Vec<IscsiPdu>> {
        let (exp_cmd_sn, max_cmd_sn) = self.cmd_window();
        let mut r2ts = Vec::new();
        for _ in 0..self.settings.max_outstanding_r2t.max(1) {
            let Some(plan) = transfer.next_r2t(self.settings.max_burst_length) else {
                break;
            };
            log::debug!(
                "{}: R2T sn {} offset {} len {} (TTT 0x{:08x})",
                self.peer,
                plan.r2t_sn,
                plan.buffer_offset,
                plan.desired_length,
                transfer.ttt()
            );
            r2ts.push(IscsiPdu::r2t(
                0,
                transfer.itt(),
                transfer.ttt(),
                self.stat_sn, // R2T carries the current StatSN unadvanced
                exp_cmd_sn,
                max_cmd_sn,
                plan.r2t_sn,
                plan.buffer_offset,
                plan.desired_length,
            ));
        }
        Ok(r2ts)
    }

    fn handle_data_out(&mut self, data_out: &ScsiDataOutPdu) -> ScsiResult<Vec<IscsiPdu>> {
        let Some(transfer) = self.pending_writes.get_mut(&data_out.itt) else {
            log::warn!(
                "{}: Data-Out for unknown ITT 0x{:08x}",
                self.peer,
                data_out.itt
            );
            return Ok(Vec::new());
        };

        // Solicited bursts must quote the TTT from the R2T
        if data_out.ttt != RESERVED_TAG && data_out.ttt != transfer.ttt() {
            log::warn!(
                "{}: Data-Out with stale TTT 0x{:08x} (expected 0x{:08x})",
                self.peer,
                data_out.ttt,
                transfer.ttt()
            );
            return Ok(Vec::new());
        }

        transfer.absorb(data_out.buffer_offset, &data_out.data)?;
        log::debug!(
            "{}: Data-Out ITT 0x{:08x} offset {} len {} ({}/{} bytes)",
            self.peer,
            data_out.itt,
            data_out.buffer_offset,
            data_out.data.len(),
            transfer.bytes_received(),
            transfer.total_length()
        );

        if transfer.is_complete() {
            let transfer = self
                .pending_writes
                .remove(&data_out.itt)
                .ok_or_else(|| IscsiError::Protocol("transfer vanished".to_string()))?;
            return self.complete_write(data_out.itt, transfer);
        }

        // After the unsolicited sequence ends, or a solicited burst is fully
        // delivered, solicit the next burst.
        if data_out.final_flag {
            let mut transfer = self
                .pending_writes
                .remove(&data_out.itt)
                .ok_or_else(|| IscsiError::Protocol("transfer vanished".to_string()))?;
            let r2ts = self.solicit(&mut transfer)?;
            self.pending_writes.insert(data_out.itt, transfer);
            return Ok(r2ts);
        }

        Ok(Vec::new())
    }

    /// All bytes received: write the payload to the store and respond
    fn complete_write(
        &mut self,
        itt: u32,
        transfer: WriteTransfer,
    ) -> ScsiResult<Vec<IscsiPdu>> {
        let session = self.session.as_ref().ok_or_else(|| {
            IscsiError::Session("write completion without session".to_string())
        })?;
        let target = session
            .target()
            .ok_or_else(|| IscsiError::Session("write completion without target".to_string()))?;

        let offset = transfer.storage_offset();
        let total = transfer.total_length();
        let payload = transfer.into_payload();

        let start = Instant::now();
        let result = if payload.is_empty() {
            Ok(())
        } else {
            target.store().write(&payload, offset)
        };

        match result {
            Ok(()) => {
                target.add_write_point(total as u64, start, Instant::now());
                log::debug!("{}: write complete, ITT 0x{itt:08x}, {total} bytes", self.peer);
                let (exp_cmd_sn, max_cmd_sn) = self.cmd_window();
                self.last_sense = None;
                let stat_sn = self.next_stat_sn();
                Ok(vec![IscsiPdu::scsi_response(
                    itt,
                    stat_sn,
                    exp_cmd_sn,
                    max_cmd_sn,
                    scsi_status::GOOD,
                    0,
                    0,
                    None,
                )])
            }
            Err(e) => {
                log::error!("{}: write failed: {e}", self.peer);
                self.scsi_check_condition(itt, SenseData::write_error())
            }
        }
    }

    // ------------------------------------------------------------------
    // NOP and text
    // ------------------------------------------------------------------

    fn handle_nop_out(&mut self, nop: &NopOutPdu) -> ScsiResult<Vec<IscsiPdu>> {
        if nop.itt == RESERVED_TAG {
            // Answer to a target ping; this target never pings, so ignore
            return Ok(Vec::new());
        }
        // Ping: echo the data segment back in a NOP-In
        let (exp_cmd_sn, max_cmd_sn) = self.cmd_window();
        let stat_sn = self.next_stat_sn();
        Ok(vec![IscsiPdu::nop_in(
            nop.itt,
            RESERVED_TAG,
            stat_sn,
            exp_cmd_sn,
            max_cmd_sn,
            nop.lun,
            nop.data.clone(),
        )])
    }

    fn handle_text_request(&mut self, text: &TextRequest) -> ScsiResult<Vec<IscsiPdu>> {
        let send_targets = text
            .parameters
            .iter()
            .find(|(k, _)| k == "SendTargets")
            .map(|(_, v)| v.as_str());

        let response_params = if let Some(scope) = send_targets {
            self.send_targets_response(scope)
        } else {
            // Plain text negotiation: run the keys through the negotiator
            // and publish a fresh settings snapshot.
            let session = self.session.as_ref().ok_or_else(|| {
                IscsiError::Session("text request without session".to_string())
            })?;
            let session = Arc::clone(session);
            match session.with_settings(|sess| {
                self.negotiator
                    .negotiate(&text.parameters, &mut self.conn_settings, sess)
            }) {
                Ok(params) => {
                    self.settings =
                        session.with_settings(|sess| sess.commit(&self.conn_settings));
                    session.publish_settings(Arc::clone(&self.settings));
                    log::debug!(
                        "{}: text negotiation published settings id {}",
                        self.peer,
                        self.settings.settings_id
                    );
                    params
                }
                Err(IscsiError::Negotiation(reason)) => {
                    log::warn!("{}: text negotiation failed: {reason}", self.peer);
                    let (exp_cmd_sn, max_cmd_sn) = self.cmd_window();
                    let stat_sn = self.next_stat_sn();
                    return Ok(vec![IscsiPdu::reject(
                        reject_reason::PROTOCOL_ERROR,
                        stat_sn,
                        exp_cmd_sn,
                        max_cmd_sn,
                        &[],
                    )]);
                }
                Err(other) => return Err(other),
            }
        };

        let (exp_cmd_sn, max_cmd_sn) = self.cmd_window();
        let stat_sn = self.next_stat_sn();
        Ok(vec![IscsiPdu::text_response(
            text.itt,
            RESERVED_TAG,
            stat_sn,
            exp_cmd_sn,
            max_cmd_sn,
            true,
            pdu::serialize_text_parameters(&response_params),
        )])
    }

    /// Build the SendTargets answer: every exported target on a discovery
    /// session, only the bound target on a normal session.
    fn send_targets_response(&self, scope: &str) -> Vec<(String, String)> {
        let address = format!("{},{}", self.portal, crate::session::PORTAL_GROUP_TAG);

        let session_type = self
            .session
            .as_ref()
            .map(|s| s.session_type())
            .unwrap_or_default();

        let mut params = Vec::new();
        if session_type == SessionType::Discovery && (scope == "All" || scope.is_empty()) {
            for name in self.ctx.targets.names() {
                params.push(("TargetName".to_string(), name));
                params.push(("TargetAddress".to_string(), address.clone()));
            }
        } else if let Some(target) = self.session.as_ref().and_then(|s| s.target()) {
            params.push(("TargetName".to_string(), target.name().to_string()));
            params.push(("TargetAddress".to_string(), address));
        }
        params
    }
}
