//! Minimal iSCSI initiator, used by the integration tests
//!
//! Speaks just enough of the protocol to drive the target end to end: login
//! with negotiable digests, SCSI command round-trips including Data-In
//! reassembly and R2T/Data-Out write flows, discovery, logout, and raw PDU
//! injection for edge-case tests.

use crate::digest::Digest;
use crate::error::{IscsiError, ScsiResult};
use crate::pdu::{
    self, flags, login_status, opcode, scsi_status, stage, IscsiPdu, RESERVED_TAG,
};
use byteorder::{BigEndian, ByteOrder};
use rand::Rng;
use std::io::Write;
use std::net::TcpStream;
use std::time::Duration;

/// Negotiation offers for [`IscsiClient::login`]
#[derive(Debug, Clone)]
pub struct LoginOptions {
    pub header_digest: &'static str,
    pub data_digest: &'static str,
    pub max_recv_data_segment_length: u32,
    pub max_burst_length: u32,
    pub first_burst_length: u32,
    pub immediate_data: bool,
    pub initial_r2t: bool,
}

impl Default for LoginOptions {
    fn default() -> Self {
        LoginOptions {
            header_digest: "None",
            data_digest: "None",
            max_recv_data_segment_length: 8192,
            max_burst_length: 262_144,
            first_burst_length: 65_536,
            immediate_data: true,
            initial_r2t: false,
        }
    }
}

/// Parameters the target answered during login
#[derive(Debug, Clone, Default)]
pub struct NegotiatedParams {
    pub header_digest: Digest,
    pub data_digest: Digest,
    pub max_recv_data_segment_length: u32,
    pub max_burst_length: u32,
    pub first_burst_length: u32,
    pub immediate_data: bool,
    pub initial_r2t: bool,
    pub target_alias: Option<String>,
}

/// Result of one SCSI command round-trip
#[derive(Debug, Clone)]
pub struct ScsiTaskResult {
    pub status: u8,
    pub data: Vec<u8>,
    /// Sense bytes from a CHECK CONDITION response (SenseLength stripped)
    pub sense: Option<Vec<u8>>,
}

impl ScsiTaskResult {
    pub fn is_good(&self) -> bool {
        self.status == scsi_status::GOOD
    }

    /// (sense key, ASC, ASCQ) of fixed-format sense data
    pub fn sense_triple(&self) -> Option<(u8, u8, u8)> {
        let sense = self.sense.as_ref()?;
        if sense.len() < 14 {
            return None;
        }
        Some((sense[2] & 0x0F, sense[12], sense[13]))
    }
}

/// Generate a random ISID with the IEEE-OUI qualifier format
pub fn generate_isid() -> [u8; 6] {
    let mut rng = rand::thread_rng();
    let mut isid = [0u8; 6];
    isid[0] = 0x80; // random type
    rng.fill(&mut isid[1..]);
    isid
}

/// iSCSI initiator connection
pub struct IscsiClient {
    stream: TcpStream,
    isid: [u8; 6],
    tsih: u16,
    cmd_sn: u32,
    exp_stat_sn: u32,
    next_itt: u32,
    negotiated: NegotiatedParams,
    logged_in: bool,
}

impl IscsiClient {
    /// Connect to a target portal
    pub fn connect(addr: &str) -> ScsiResult<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        stream.set_write_timeout(Some(Duration::from_secs(10)))?;

        Ok(IscsiClient {
            stream,
            isid: generate_isid(),
            tsih: 0,
            cmd_sn: 1,
            exp_stat_sn: 0,
            next_itt: 1,
            negotiated: NegotiatedParams::default(),
            logged_in: false,
        })
    }

    pub fn tsih(&self) -> u16 {
        self.tsih
    }

    pub fn negotiated(&self) -> &NegotiatedParams {
        &self.negotiated
    }

    /// CmdSN the next non-immediate command will carry
    pub fn cmd_sn(&self) -> u32 {
        self.cmd_sn
    }

    /// Next StatSN expected from the target
    pub fn exp_stat_sn(&self) -> u32 {
        self.exp_stat_sn
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    fn take_itt(&mut self) -> u32 {
        let itt = self.next_itt;
        self.next_itt = self.next_itt.wrapping_add(1);
        itt
    }

    /// Send a PDU with the digests active on this connection
    pub fn send_pdu(&mut self, pdu_out: &IscsiPdu) -> ScsiResult<()> {
        let (hd, dd) = if self.logged_in {
            (self.negotiated.header_digest, self.negotiated.data_digest)
        } else {
            (Digest::None, Digest::None)
        };
        pdu::write_pdu(&mut self.stream, pdu_out, hd, dd)
    }

    /// Write raw bytes to the socket, bypassing the codec (for tests that
    /// need to corrupt digests or frame bad PDUs)
    pub fn send_raw_bytes(&mut self, bytes: &[u8]) -> ScsiResult<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Receive one PDU with the digests active on this connection
    pub fn recv_pdu(&mut self) -> ScsiResult<IscsiPdu> {
        let (hd, dd) = if self.logged_in {
            (self.negotiated.header_digest, self.negotiated.data_digest)
        } else {
            (Digest::None, Digest::None)
        };
        let pdu_in = pdu::read_pdu(&mut self.stream, hd, dd, pdu::MAX_DATA_SEGMENT_LENGTH)?;
        self.note_stat_sn(&pdu_in);
        Ok(pdu_in)
    }

    /// Track the target's StatSN from status-bearing responses
    fn note_stat_sn(&mut self, pdu_in: &IscsiPdu) {
        let status_bearing = match pdu_in.opcode {
            opcode::LOGIN_RESPONSE
            | opcode::TEXT_RESPONSE
            | opcode::SCSI_RESPONSE
            | opcode::NOP_IN
            | opcode::LOGOUT_RESPONSE
            | opcode::REJECT
            | opcode::TASK_MANAGEMENT_RESPONSE => true,
            opcode::SCSI_DATA_IN => pdu_in.flags & flags::STATUS != 0,
            _ => false,
        };
        if status_bearing {
            let stat_sn = BigEndian::read_u32(&pdu_in.specific[4..8]);
            self.exp_stat_sn = stat_sn.wrapping_add(1);
        }
    }

    // ------------------------------------------------------------------
    // Login
    // ------------------------------------------------------------------

    /// Log in to a target: security stage (AuthMethod=None), then
    /// operational negotiation, then full feature phase.
    pub fn login(
        &mut self,
        initiator_name: &str,
        target_name: &str,
        options: &LoginOptions,
    ) -> ScsiResult<()> {
        // Stage 0 → 1: identity and AuthMethod=None
        let security = vec![
            ("InitiatorName".to_string(), initiator_name.to_string()),
            ("TargetName".to_string(), target_name.to_string()),
            ("SessionType".to_string(), "Normal".to_string()),
            ("AuthMethod".to_string(), "None".to_string()),
        ];
        self.login_exchange(
            stage::SECURITY_NEGOTIATION,
            stage::LOGIN_OPERATIONAL_NEGOTIATION,
            true,
            security,
        )?;

        // Stage 1 → 3: operational keys
        let operational = vec![
            ("HeaderDigest".to_string(), options.header_digest.to_string()),
            ("DataDigest".to_string(), options.data_digest.to_string()),
            (
                "MaxRecvDataSegmentLength".to_string(),
                options.max_recv_data_segment_length.to_string(),
            ),
            ("MaxBurstLength".to_string(), options.max_burst_length.to_string()),
            (
                "FirstBurstLength".to_string(),
                options.first_burst_length.to_string(),
            ),
            ("DefaultTime2Wait".to_string(), "2".to_string()),
            ("DefaultTime2Retain".to_string(), "20".to_string()),
            ("MaxOutstandingR2T".to_string(), "1".to_string()),
            (
                "ImmediateData".to_string(),
                if options.immediate_data { "Yes" } else { "No" }.to_string(),
            ),
            (
                "InitialR2T".to_string(),
                if options.initial_r2t { "Yes" } else { "No" }.to_string(),
            ),
            ("DataPDUInOrder".to_string(), "Yes".to_string()),
            ("DataSequenceInOrder".to_string(), "Yes".to_string()),
            ("ErrorRecoveryLevel".to_string(), "0".to_string()),
            ("MaxConnections".to_string(), "1".to_string()),
        ];
        let response = self.login_exchange(
            stage::LOGIN_OPERATIONAL_NEGOTIATION,
            stage::FULL_FEATURE_PHASE,
            true,
            operational,
        )?;

        self.apply_negotiated(&response);
        self.logged_in = true;
        Ok(())
    }

    /// Discovery login (no target binding)
    pub fn login_discovery(&mut self, initiator_name: &str) -> ScsiResult<()> {
        let security = vec![
            ("InitiatorName".to_string(), initiator_name.to_string()),
            ("SessionType".to_string(), "Discovery".to_string()),
            ("AuthMethod".to_string(), "None".to_string()),
        ];
        self.login_exchange(
            stage::SECURITY_NEGOTIATION,
            stage::LOGIN_OPERATIONAL_NEGOTIATION,
            true,
            security,
        )?;

        let operational = vec![
            ("HeaderDigest".to_string(), "None".to_string()),
            ("DataDigest".to_string(), "None".to_string()),
            ("MaxRecvDataSegmentLength".to_string(), "8192".to_string()),
        ];
        let response = self.login_exchange(
            stage::LOGIN_OPERATIONAL_NEGOTIATION,
            stage::FULL_FEATURE_PHASE,
            true,
            operational,
        )?;
        self.apply_negotiated(&response);
        self.logged_in = true;
        Ok(())
    }

    /// One login request/response exchange. Returns the response parameters.
    fn login_exchange(
        &mut self,
        csg: u8,
        nsg: u8,
        transit: bool,
        parameters: Vec<(String, String)>,
    ) -> ScsiResult<Vec<(String, String)>> {
        let request = self.build_login_request(csg, nsg, transit, &parameters);
        self.send_pdu(&request)?;

        let response = self.recv_pdu()?;
        if response.opcode != opcode::LOGIN_RESPONSE {
            return Err(IscsiError::Protocol(format!(
                "expected Login Response, got {}",
                response.opcode_name()
            )));
        }

        let status_class = response.specific[16];
        let status_detail = response.specific[17];
        if status_class != login_status::SUCCESS {
            return Err(IscsiError::Session(format!(
                "login failed: status class 0x{status_class:02x} detail 0x{status_detail:02x}"
            )));
        }

        // TSIH is assigned on the final (transit to FFP) response
        let lun_bytes = response.lun.to_be_bytes();
        let tsih = BigEndian::read_u16(&lun_bytes[6..8]);
        if tsih != 0 {
            self.tsih = tsih;
        }

        pdu::parse_text_parameters(&response.data).map_err(IscsiError::Codec)
    }

    /// Build a login request PDU without sending it (tests frame bad ones)
    pub fn build_login_request(
        &mut self,
        csg: u8,
        nsg: u8,
        transit: bool,
        parameters: &[(String, String)],
    ) -> IscsiPdu {
        let mut request = IscsiPdu::new();
        request.opcode = opcode::LOGIN_REQUEST;
        request.immediate = true;
        request.flags =
            (if transit { flags::TRANSIT } else { 0 }) | ((csg & 0x03) << 2) | (nsg & 0x03);
        request.specific2 = [0x00, 0x00]; // Version-max / Version-min

        let mut lun_bytes = [0u8; 8];
        lun_bytes[0..6].copy_from_slice(&self.isid);
        lun_bytes[6..8].copy_from_slice(&self.tsih.to_be_bytes());
        request.lun = u64::from_be_bytes(lun_bytes);
        request.itt = self.take_itt();

        // CID 0
        request.specific[4..8].copy_from_slice(&self.cmd_sn.to_be_bytes());
        request.specific[8..12].copy_from_slice(&self.exp_stat_sn.to_be_bytes());
        request.data = pdu::serialize_text_parameters(parameters);
        request.data_length = request.data.len() as u32;
        request
    }

    fn apply_negotiated(&mut self, response: &[(String, String)]) {
        let mut negotiated = NegotiatedParams {
            max_recv_data_segment_length: 8192,
            max_burst_length: 262_144,
            first_burst_length: 65_536,
            immediate_data: true,
            initial_r2t: false,
            ..NegotiatedParams::default()
        };
        for (key, value) in response {
            match key.as_str() {
                "HeaderDigest" => {
                    negotiated.header_digest =
                        Digest::from_offer(value).unwrap_or(Digest::None);
                }
                "DataDigest" => {
                    negotiated.data_digest = Digest::from_offer(value).unwrap_or(Digest::None);
                }
                "MaxRecvDataSegmentLength" => {
                    if let Ok(v) = value.parse() {
                        negotiated.max_recv_data_segment_length = v;
                    }
                }
                "MaxBurstLength" => {
                    if let Ok(v) = value.parse() {
                        negotiated.max_burst_length = v;
                    }
                }
                "FirstBurstLength" => {
                    if let Ok(v) = value.parse() {
                        negotiated.first_burst_length = v;
                    }
                }
                "ImmediateData" => negotiated.immediate_data = value == "Yes",
                "InitialR2T" => negotiated.initial_r2t = value == "Yes",
                "TargetAlias" => negotiated.target_alias = Some(value.clone()),
                _ => {}
            }
        }
        self.negotiated = negotiated;
    }

    // ------------------------------------------------------------------
    // SCSI commands
    // ------------------------------------------------------------------

    /// Build a SCSI command PDU (exposed so tests can frame odd ones)
    pub fn build_scsi_command(
        &mut self,
        cdb: &[u8],
        read: bool,
        write: bool,
        expected_data_length: u32,
        immediate_data: &[u8],
    ) -> IscsiPdu {
        let mut request = IscsiPdu::new();
        request.opcode = opcode::SCSI_COMMAND;
        request.flags = flags::FINAL
            | (if read { flags::READ } else { 0 })
            | (if write { flags::WRITE } else { 0 });
        request.lun = 0;
        request.itt = self.take_itt();

        BigEndian::write_u32(&mut request.specific[0..4], expected_data_length);
        request.specific[4..8].copy_from_slice(&self.cmd_sn.to_be_bytes());
        request.specific[8..12].copy_from_slice(&self.exp_stat_sn.to_be_bytes());

        let len = cdb.len().min(16);
        request.specific[12..12 + len].copy_from_slice(&cdb[..len]);

        request.data = immediate_data.to_vec();
        request.data_length = request.data.len() as u32;

        self.cmd_sn = self.cmd_sn.wrapping_add(1);
        request
    }

    /// Execute a non-data or read command and collect the result, including
    /// Data-In reassembly and phase-collapsed status.
    pub fn execute(&mut self, cdb: &[u8], read: bool) -> ScsiResult<ScsiTaskResult> {
        let edtl = if read { 1 << 20 } else { 0 };
        self.execute_with_edtl(cdb, read, edtl)
    }

    /// As [`execute`](Self::execute) with an explicit ExpectedDataTransferLength
    pub fn execute_with_edtl(
        &mut self,
        cdb: &[u8],
        read: bool,
        expected_data_length: u32,
    ) -> ScsiResult<ScsiTaskResult> {
        let request = self.build_scsi_command(cdb, read, false, expected_data_length, &[]);
        self.send_pdu(&request)?;
        self.collect_response(request.itt)
    }

    /// Execute a WRITE command, driving immediate data and R2T/Data-Out
    pub fn write_blocks(&mut self, cdb: &[u8], payload: &[u8]) -> ScsiResult<ScsiTaskResult> {
        // Immediate data is one data segment, so it is bounded by the
        // target's receive limit as well as FirstBurstLength
        let immediate_cap = if self.negotiated.immediate_data && !self.negotiated.initial_r2t {
            (self.negotiated.first_burst_length as usize)
                .min(self.negotiated.max_recv_data_segment_length as usize)
                .min(payload.len())
        } else {
            0
        };
        let immediate = &payload[..immediate_cap];

        let request =
            self.build_scsi_command(cdb, false, true, payload.len() as u32, immediate);
        let itt = request.itt;
        self.send_pdu(&request)?;

        // Unsolicited data beyond immediate is not generated; the command is
        // marked final, so the target solicits the rest with R2Ts.
        loop {
            let response = self.recv_pdu()?;
            match response.opcode {
                opcode::R2T => {
                    let ttt = BigEndian::read_u32(&response.specific[0..4]);
                    let offset = BigEndian::read_u32(&response.specific[20..24]) as usize;
                    let desired = BigEndian::read_u32(&response.specific[24..28]) as usize;
                    self.send_data_out(itt, ttt, offset, &payload[offset..offset + desired])?;
                }
                opcode::SCSI_RESPONSE => {
                    return Ok(parse_scsi_response(&response));
                }
                other => {
                    return Err(IscsiError::Protocol(format!(
                        "unexpected PDU 0x{other:02x} during write"
                    )));
                }
            }
        }
    }

    /// Send one solicited Data-Out burst, chunked to the target's receive
    /// limit, F bit set on the last chunk.
    pub fn send_data_out(
        &mut self,
        itt: u32,
        ttt: u32,
        burst_offset: usize,
        data: &[u8],
    ) -> ScsiResult<()> {
        let chunk_limit = (self.negotiated.max_recv_data_segment_length as usize).max(512);
        let mut offset = 0usize;
        let mut data_sn = 0u32;
        while offset < data.len() {
            let chunk_len = (data.len() - offset).min(chunk_limit);
            let is_final = offset + chunk_len >= data.len();

            let mut out = IscsiPdu::new();
            out.opcode = opcode::SCSI_DATA_OUT;
            out.flags = if is_final { flags::FINAL } else { 0 };
            out.itt = itt;
            BigEndian::write_u32(&mut out.specific[0..4], ttt);
            out.specific[8..12].copy_from_slice(&self.exp_stat_sn.to_be_bytes());
            BigEndian::write_u32(&mut out.specific[16..20], data_sn);
            BigEndian::write_u32(&mut out.specific[20..24], (burst_offset + offset) as u32);
            out.data = data[offset..offset + chunk_len].to_vec();
            out.data_length = out.data.len() as u32;

            self.send_pdu(&out)?;
            offset += chunk_len;
            data_sn += 1;
        }
        Ok(())
    }

    /// Collect Data-In PDUs and/or the SCSI response for one task
    fn collect_response(&mut self, itt: u32) -> ScsiResult<ScsiTaskResult> {
        let mut data = Vec::new();
        loop {
            let response = self.recv_pdu()?;
            match response.opcode {
                opcode::SCSI_DATA_IN => {
                    if response.itt != itt {
                        return Err(IscsiError::Protocol("Data-In for wrong task".to_string()));
                    }
                    let offset = BigEndian::read_u32(&response.specific[20..24]) as usize;
                    if data.len() < offset + response.data.len() {
                        data.resize(offset + response.data.len(), 0);
                    }
                    data[offset..offset + response.data.len()].copy_from_slice(&response.data);

                    if response.flags & flags::STATUS != 0 {
                        return Ok(ScsiTaskResult {
                            status: response.specific2[1],
                            data,
                            sense: None,
                        });
                    }
                }
                opcode::SCSI_RESPONSE => {
                    let mut result = parse_scsi_response(&response);
                    if result.data.is_empty() && !data.is_empty() {
                        result.data = data;
                    }
                    return Ok(result);
                }
                other => {
                    return Err(IscsiError::Protocol(format!(
                        "unexpected PDU 0x{other:02x} while awaiting response"
                    )));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Convenience commands
    // ------------------------------------------------------------------

    pub fn test_unit_ready(&mut self) -> ScsiResult<ScsiTaskResult> {
        self.execute(&[0x00; 6], false)
    }

    pub fn report_luns(&mut self, alloc_len: u32) -> ScsiResult<ScsiTaskResult> {
        let mut cdb = [0u8; 12];
        cdb[0] = 0xA0;
        BigEndian::write_u32(&mut cdb[6..10], alloc_len);
        self.execute_with_edtl(&cdb, true, alloc_len)
    }

    pub fn read_capacity10(&mut self) -> ScsiResult<ScsiTaskResult> {
        self.execute_with_edtl(&[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0], true, 8)
    }

    pub fn read_capacity16(&mut self) -> ScsiResult<ScsiTaskResult> {
        let mut cdb = [0u8; 16];
        cdb[0] = 0x9E;
        cdb[1] = 0x10;
        BigEndian::write_u32(&mut cdb[10..14], 32);
        self.execute_with_edtl(&cdb, true, 32)
    }

    pub fn inquiry(&mut self, evpd: bool, page: u8, alloc_len: u16) -> ScsiResult<ScsiTaskResult> {
        let mut cdb = [0u8; 6];
        cdb[0] = 0x12;
        cdb[1] = if evpd { 1 } else { 0 };
        cdb[2] = page;
        BigEndian::write_u16(&mut cdb[3..5], alloc_len);
        self.execute_with_edtl(&cdb, true, alloc_len as u32)
    }

    pub fn request_sense(&mut self) -> ScsiResult<ScsiTaskResult> {
        self.execute_with_edtl(&[0x03, 0, 0, 0, 18, 0], true, 18)
    }

    pub fn read10(&mut self, lba: u32, blocks: u16) -> ScsiResult<ScsiTaskResult> {
        let mut cdb = [0u8; 10];
        cdb[0] = 0x28;
        BigEndian::write_u32(&mut cdb[2..6], lba);
        BigEndian::write_u16(&mut cdb[7..9], blocks);
        self.execute_with_edtl(&cdb, true, blocks as u32 * 512)
    }

    pub fn read16(&mut self, lba: u64, blocks: u32) -> ScsiResult<ScsiTaskResult> {
        let mut cdb = [0u8; 16];
        cdb[0] = 0x88;
        BigEndian::write_u64(&mut cdb[2..10], lba);
        BigEndian::write_u32(&mut cdb[10..14], blocks);
        self.execute_with_edtl(&cdb, true, blocks * 512)
    }

    pub fn write10(&mut self, lba: u32, payload: &[u8]) -> ScsiResult<ScsiTaskResult> {
        let blocks = (payload.len() / 512) as u16;
        let mut cdb = [0u8; 10];
        cdb[0] = 0x2A;
        BigEndian::write_u32(&mut cdb[2..6], lba);
        BigEndian::write_u16(&mut cdb[7..9], blocks);
        self.write_blocks(&cdb, payload)
    }

    pub fn write16(&mut self, lba: u64, payload: &[u8]) -> ScsiResult<ScsiTaskResult> {
        let blocks = (payload.len() / 512) as u32;
        let mut cdb = [0u8; 16];
        cdb[0] = 0x8A;
        BigEndian::write_u64(&mut cdb[2..10], lba);
        BigEndian::write_u32(&mut cdb[10..14], blocks);
        self.write_blocks(&cdb, payload)
    }

    pub fn synchronize_cache(&mut self) -> ScsiResult<ScsiTaskResult> {
        self.execute(&[0x35, 0, 0, 0, 0, 0, 0, 0, 0, 0], false)
    }

    /// NOP-Out ping; returns the echoed data segment
    pub fn ping(&mut self, payload: &[u8]) -> ScsiResult<Vec<u8>> {
        let mut request = IscsiPdu::new();
        request.opcode = opcode::NOP_OUT;
        request.immediate = true;
        request.flags = flags::FINAL;
        request.itt = self.take_itt();
        BigEndian::write_u32(&mut request.specific[0..4], RESERVED_TAG);
        request.specific[4..8].copy_from_slice(&self.cmd_sn.to_be_bytes());
        request.specific[8..12].copy_from_slice(&self.exp_stat_sn.to_be_bytes());
        request.data = payload.to_vec();
        request.data_length = request.data.len() as u32;

        self.send_pdu(&request)?;
        let response = self.recv_pdu()?;
        if response.opcode != opcode::NOP_IN {
            return Err(IscsiError::Protocol(format!(
                "expected NOP-In, got {}",
                response.opcode_name()
            )));
        }
        Ok(response.data)
    }

    /// SendTargets discovery; returns (target name, portal address) pairs
    pub fn discover(&mut self) -> ScsiResult<Vec<(String, String)>> {
        let mut request = IscsiPdu::new();
        request.opcode = opcode::TEXT_REQUEST;
        request.flags = flags::FINAL;
        request.itt = self.take_itt();
        BigEndian::write_u32(&mut request.specific[0..4], RESERVED_TAG);
        request.specific[4..8].copy_from_slice(&self.cmd_sn.to_be_bytes());
        request.specific[8..12].copy_from_slice(&self.exp_stat_sn.to_be_bytes());
        request.data = pdu::serialize_text_parameters(&[(
            "SendTargets".to_string(),
            "All".to_string(),
        )]);
        request.data_length = request.data.len() as u32;
        self.cmd_sn = self.cmd_sn.wrapping_add(1);

        self.send_pdu(&request)?;
        let response = self.recv_pdu()?;
        if response.opcode != opcode::TEXT_RESPONSE {
            return Err(IscsiError::Protocol(format!(
                "expected Text Response, got {}",
                response.opcode_name()
            )));
        }

        let params = pdu::parse_text_parameters(&response.data).map_err(IscsiError::Codec)?;
        let mut found = Vec::new();
        let mut current: Option<String> = None;
        for (key, value) in params {
            match key.as_str() {
                "TargetName" => current = Some(value),
                "TargetAddress" => {
                    if let Some(name) = current.take() {
                        let address = value.split(',').next().unwrap_or(&value).to_string();
                        found.push((name, address));
                    }
                }
                _ => {}
            }
        }
        Ok(found)
    }

    /// Log out (reason 0: close the session)
    pub fn logout(&mut self) -> ScsiResult<u8> {
        let mut request = IscsiPdu::new();
        request.opcode = opcode::LOGOUT_REQUEST;
        request.immediate = true;
        request.flags = flags::FINAL; // reason 0: close session
        request.itt = self.take_itt();
        request.specific[4..8].copy_from_slice(&self.cmd_sn.to_be_bytes());
        request.specific[8..12].copy_from_slice(&self.exp_stat_sn.to_be_bytes());

        self.send_pdu(&request)?;
        let response = self.recv_pdu()?;
        if response.opcode != opcode::LOGOUT_RESPONSE {
            return Err(IscsiError::Protocol(format!(
                "expected Logout Response, got {}",
                response.opcode_name()
            )));
        }
        self.logged_in = false;
        Ok(response.specific2[0])
    }
}

/// Pull status, sense and (unlikely) data out of a SCSI Response PDU
fn parse_scsi_response(response: &IscsiPdu) -> ScsiTaskResult {
    let status = response.specific2[1];
    let sense = if status == scsi_status::CHECK_CONDITION && response.data.len() >= 2 {
        let sense_len = BigEndian::read_u16(&response.data[0..2]) as usize;
        Some(response.data[2..(2 + sense_len).min(response.data.len())].to_vec())
    } else {
        None
    };
    ScsiTaskResult {
        status,
        data: if sense.is_some() {
            Vec::new()
        } else {
            response.data.clone()
        },
        sense,
    }
}
