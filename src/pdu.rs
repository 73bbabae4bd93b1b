//! iSCSI PDU (Protocol Data Unit) parsing and serialization
//!
//! This module handles the binary protocol format for iSCSI PDUs
//! based on RFC 3720: https://datatracker.ietf.org/doc/html/rfc3720
//!
//! A PDU on the wire is a 48-byte Basic Header Segment (BHS), an optional
//! 4-byte CRC32C header digest, an optional AHS (always absent here; the
//! TotalAHSLength this target emits and accepts is zero), the data segment
//! padded to a 4-byte boundary, and an optional 4-byte CRC32C data digest
//! covering data plus pad.

// Protocol functions require many parameters per RFC 3720
#![allow(clippy::too_many_arguments)]

use crate::digest::{crc32c, Digest};
use crate::error::{CodecError, ScsiResult};
use byteorder::{BigEndian, ByteOrder};
use std::io::{Read, Write};

/// BHS (Basic Header Segment) size in bytes
pub const BHS_SIZE: usize = 48;

/// Largest DataSegmentLength expressible on the wire (24-bit field)
pub const MAX_DATA_SEGMENT_LENGTH: u32 = 0xFF_FFFF;

/// Reserved Target Transfer Tag / Initiator Task Tag value
pub const RESERVED_TAG: u32 = 0xFFFF_FFFF;

/// iSCSI PDU Opcodes (RFC 3720 Section 10)
pub mod opcode {
    // Initiator opcodes (initiator → target)
    pub const NOP_OUT: u8 = 0x00;
    pub const SCSI_COMMAND: u8 = 0x01;
    pub const TASK_MANAGEMENT_REQUEST: u8 = 0x02;
    pub const LOGIN_REQUEST: u8 = 0x03;
    pub const TEXT_REQUEST: u8 = 0x04;
    pub const SCSI_DATA_OUT: u8 = 0x05;
    pub const LOGOUT_REQUEST: u8 = 0x06;
    pub const SNACK_REQUEST: u8 = 0x10;

    // Target opcodes (target → initiator)
    pub const NOP_IN: u8 = 0x20;
    pub const SCSI_RESPONSE: u8 = 0x21;
    pub const TASK_MANAGEMENT_RESPONSE: u8 = 0x22;
    pub const LOGIN_RESPONSE: u8 = 0x23;
    pub const TEXT_RESPONSE: u8 = 0x24;
    pub const SCSI_DATA_IN: u8 = 0x25;
    pub const LOGOUT_RESPONSE: u8 = 0x26;
    pub const R2T: u8 = 0x31;
    pub const ASYNC_MESSAGE: u8 = 0x32;
    pub const REJECT: u8 = 0x3F;
}

/// iSCSI PDU flags (commonly used across PDU types)
pub mod flags {
    // Common flags
    pub const FINAL: u8 = 0x80;
    pub const CONTINUE: u8 = 0x40;

    // SCSI command flags
    pub const READ: u8 = 0x40;
    pub const WRITE: u8 = 0x20;

    // SCSI Data-In flags
    pub const ACKNOWLEDGE: u8 = 0x40;
    pub const STATUS: u8 = 0x01;

    // Login flags
    pub const TRANSIT: u8 = 0x80;
    pub const CONTINUE_LOGIN: u8 = 0x40;
}

/// Login stage codes carried in the CSG/NSG nibbles (RFC 3720 Section 10.12.3)
pub mod stage {
    pub const SECURITY_NEGOTIATION: u8 = 0;
    pub const LOGIN_OPERATIONAL_NEGOTIATION: u8 = 1;
    pub const FULL_FEATURE_PHASE: u8 = 3;
}

/// Login status classes and details (RFC 3720 Section 10.13.5)
pub mod login_status {
    pub const SUCCESS: u8 = 0x00;
    pub const REDIRECTION: u8 = 0x01;
    pub const INITIATOR_ERROR: u8 = 0x02;
    pub const TARGET_ERROR: u8 = 0x03;

    // Status detail codes (low byte of the 16-bit class/detail pair)
    pub const SUCCESS_ACCEPT: u8 = 0x00;
    pub const INITIATOR_ERROR_GENERIC: u8 = 0x00;
    pub const AUTH_FAILURE: u8 = 0x01;
    pub const AUTHORIZATION_FAILURE: u8 = 0x02;
    pub const TARGET_NOT_FOUND: u8 = 0x03;
    pub const UNSUPPORTED_VERSION: u8 = 0x05;
    pub const TOO_MANY_CONNECTIONS: u8 = 0x06;
    pub const MISSING_PARAMETER: u8 = 0x07;
    pub const SESSION_TYPE_NOT_SUPPORTED: u8 = 0x09;
    pub const SESSION_DOES_NOT_EXIST: u8 = 0x0A;
    pub const INVALID_DURING_LOGIN: u8 = 0x0B;
    pub const TARGET_ERROR_GENERIC: u8 = 0x00;
    pub const SERVICE_UNAVAILABLE: u8 = 0x01;
    pub const OUT_OF_RESOURCES: u8 = 0x02;
}

/// SCSI response status codes (SAM-2)
pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const BUSY: u8 = 0x08;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    pub const TASK_SET_FULL: u8 = 0x28;
}

/// Reject reason codes (RFC 3720 Section 10.17.1)
pub mod reject_reason {
    pub const HEADER_DIGEST_ERROR: u8 = 0x01;
    pub const DATA_DIGEST_ERROR: u8 = 0x02;
    pub const SNACK_REJECT: u8 = 0x03;
    pub const PROTOCOL_ERROR: u8 = 0x04;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x05;
    pub const IMMEDIATE_COMMAND_REJECT: u8 = 0x06;
    pub const INVALID_PDU_FIELD: u8 = 0x09;
}

/// Async message event codes (RFC 3720 Section 10.9.1)
pub mod async_event {
    pub const SCSI_ASYNC_EVENT: u8 = 0;
    pub const LOGOUT_REQUESTED: u8 = 1;
    pub const CONNECTION_DROPPED: u8 = 2;
    pub const SESSION_DROPPED: u8 = 3;
}

/// Logout reason codes
pub mod logout_reason {
    pub const CLOSE_SESSION: u8 = 0;
    pub const CLOSE_CONNECTION: u8 = 1;
    pub const REMOVE_CONNECTION_FOR_RECOVERY: u8 = 2;
}

/// Logout response codes
pub mod logout_response {
    pub const SUCCESS: u8 = 0;
    pub const CID_NOT_FOUND: u8 = 1;
    pub const CONNECTION_RECOVERY_NOT_SUPPORTED: u8 = 2;
    pub const CLEANUP_FAILED: u8 = 3;
}

/// Basic Header Segment (BHS) - 48 bytes
///
/// ```text
/// Byte/     0       |       1       |       2       |       3       |
///     /              |               |               |               |
///    |0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|
///    +---------------+---------------+---------------+---------------+
///   0|.|I| Opcode    |F|  Opcode-specific fields                     |
///    +---------------+---------------+---------------+---------------+
///   4|TotalAHSLength | DataSegmentLength                             |
///    +---------------+---------------+---------------+---------------+
///   8| LUN or Opcode-specific fields                                 |
///    +                                                               +
///  12|                                                               |
///    +---------------+---------------+---------------+---------------+
///  16| Initiator Task Tag                                            |
///    +---------------+---------------+---------------+---------------+
///  20| Opcode-specific fields (28 bytes)                             |
///    +                                                               +
///  ...
///  44|                                                               |
///    +---------------+---------------+---------------+---------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IscsiPdu {
    /// Opcode identifies the PDU type (lower 6 bits of byte 0)
    pub opcode: u8,
    /// Immediate flag (bit 6 of byte 0)
    pub immediate: bool,
    /// Opcode-specific flags (byte 1)
    pub flags: u8,
    /// Opcode-specific bytes 2-3 (Version fields in login PDUs,
    /// Response/Status in SCSI Response, Reason in Reject, ...)
    pub specific2: [u8; 2],
    /// Total AHS (Additional Header Segment) length (4-byte units)
    pub ahs_length: u8,
    /// Data segment length (bytes)
    pub data_length: u32,
    /// Logical Unit Number or opcode-specific (bytes 8-15)
    pub lun: u64,
    /// Initiator Task Tag (bytes 16-19)
    pub itt: u32,
    /// Opcode-specific fields (bytes 20-47, 28 bytes)
    pub specific: [u8; 28],
    /// Data segment (variable length)
    pub data: Vec<u8>,
}

impl Default for IscsiPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// Round a length up to the next 4-byte boundary
pub fn pad4(len: usize) -> usize {
    len.div_ceil(4) * 4
}

impl IscsiPdu {
    /// Create a new empty PDU
    pub fn new() -> Self {
        IscsiPdu {
            opcode: 0,
            immediate: false,
            flags: 0,
            specific2: [0u8; 2],
            ahs_length: 0,
            data_length: 0,
            lun: 0,
            itt: 0,
            specific: [0u8; 28],
            data: Vec::new(),
        }
    }

    /// Parse a PDU from bytes.
    ///
    /// The input buffer must contain the 48-byte BHS, and if the PDU has a
    /// data segment the buffer must contain it (padded) as well. Digests are
    /// handled at the stream layer ([`read_pdu`]), not here.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < BHS_SIZE {
            return Err(CodecError::TooShort {
                got: buf.len(),
                need: BHS_SIZE,
            });
        }

        // Byte 0: Immediate flag (bit 6) and Opcode (bits 0-5)
        let immediate = (buf[0] & 0x40) != 0;
        let opcode = buf[0] & 0x3F;
        let flags = buf[1];
        let specific2 = [buf[2], buf[3]];
        let ahs_length = buf[4];

        // Bytes 5-7: Data Segment Length (3 bytes, big-endian)
        let data_length =
            ((buf[5] as u32) << 16) | ((buf[6] as u32) << 8) | (buf[7] as u32);

        let lun = BigEndian::read_u64(&buf[8..16]);
        let itt = BigEndian::read_u32(&buf[16..20]);

        let mut specific = [0u8; 28];
        specific.copy_from_slice(&buf[20..48]);

        let ahs_bytes = ahs_length as usize * 4;
        let total_len = BHS_SIZE + ahs_bytes + pad4(data_length as usize);
        if buf.len() < total_len {
            return Err(CodecError::TooShort {
                got: buf.len(),
                need: total_len,
            });
        }

        // AHS is skipped; TotalAHSLength is zero for every PDU this core
        // emits or accepts, but a nonzero length must still frame correctly.
        let data_start = BHS_SIZE + ahs_bytes;
        let data = buf[data_start..data_start + data_length as usize].to_vec();

        Ok(IscsiPdu {
            opcode,
            immediate,
            flags,
            specific2,
            ahs_length,
            data_length,
            lun,
            itt,
            specific,
            data,
        })
    }

    /// Serialize the 48-byte BHS
    pub fn bhs_bytes(&self) -> [u8; BHS_SIZE] {
        let mut bhs = [0u8; BHS_SIZE];
        bhs[0] = (if self.immediate { 0x40 } else { 0 }) | (self.opcode & 0x3F);
        bhs[1] = self.flags;
        bhs[2] = self.specific2[0];
        bhs[3] = self.specific2[1];
        bhs[4] = self.ahs_length;

        let data_len = self.data.len() as u32;
        bhs[5] = ((data_len >> 16) & 0xFF) as u8;
        bhs[6] = ((data_len >> 8) & 0xFF) as u8;
        bhs[7] = (data_len & 0xFF) as u8;

        BigEndian::write_u64(&mut bhs[8..16], self.lun);
        BigEndian::write_u32(&mut bhs[16..20], self.itt);
        bhs[20..48].copy_from_slice(&self.specific);
        bhs
    }

    /// Serialize PDU to bytes without digests (BHS + data + pad)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BHS_SIZE + pad4(self.data.len()));
        buf.extend_from_slice(&self.bhs_bytes());
        buf.extend_from_slice(&self.data);
        buf.resize(BHS_SIZE + pad4(self.data.len()), 0);
        buf
    }

    /// Get the opcode name for debugging
    pub fn opcode_name(&self) -> &'static str {
        match self.opcode {
            opcode::NOP_OUT => "NOP-Out",
            opcode::SCSI_COMMAND => "SCSI Command",
            opcode::TASK_MANAGEMENT_REQUEST => "Task Management Request",
            opcode::LOGIN_REQUEST => "Login Request",
            opcode::TEXT_REQUEST => "Text Request",
            opcode::SCSI_DATA_OUT => "SCSI Data-Out",
            opcode::LOGOUT_REQUEST => "Logout Request",
            opcode::SNACK_REQUEST => "SNACK Request",
            opcode::NOP_IN => "NOP-In",
            opcode::SCSI_RESPONSE => "SCSI Response",
            opcode::TASK_MANAGEMENT_RESPONSE => "Task Management Response",
            opcode::LOGIN_RESPONSE => "Login Response",
            opcode::TEXT_RESPONSE => "Text Response",
            opcode::SCSI_DATA_IN => "SCSI Data-In",
            opcode::LOGOUT_RESPONSE => "Logout Response",
            opcode::R2T => "Ready To Transfer",
            opcode::ASYNC_MESSAGE => "Async Message",
            opcode::REJECT => "Reject",
            _ => "Unknown",
        }
    }

    /// CmdSN of a request PDU.
    ///
    /// Every initiator opcode that carries a CmdSN carries it in bytes 24-27.
    pub fn cmd_sn(&self) -> u32 {
        BigEndian::read_u32(&self.specific[4..8])
    }

    /// ExpStatSN of a request PDU (bytes 28-31, uniform across initiator
    /// opcodes including SCSI Data-Out).
    pub fn exp_stat_sn(&self) -> u32 {
        BigEndian::read_u32(&self.specific[8..12])
    }
}

// ============================================================================
// Typed request views
// ============================================================================

/// A request PDU decoded into its typed view, keyed by opcode.
///
/// Parsing returns this sum so dispatch code never downcasts; unknown
/// opcodes surface as `Unsupported` and are answered with a REJECT.
#[derive(Debug, Clone)]
pub enum Request {
    Login(LoginRequest),
    Text(TextRequest),
    ScsiCommand(ScsiCommandPdu),
    DataOut(ScsiDataOutPdu),
    NopOut(NopOutPdu),
    Logout(LogoutRequest),
    TaskManagement(TaskManagementRequest),
    Unsupported(u8),
}

impl IscsiPdu {
    /// Decode this PDU into the typed request view for its opcode
    pub fn parse_request(&self) -> Result<Request, CodecError> {
        Ok(match self.opcode {
            opcode::LOGIN_REQUEST => Request::Login(self.parse_login_request()?),
            opcode::TEXT_REQUEST => Request::Text(self.parse_text_request()?),
            opcode::SCSI_COMMAND => Request::ScsiCommand(self.parse_scsi_command()?),
            opcode::SCSI_DATA_OUT => Request::DataOut(self.parse_scsi_data_out()?),
            opcode::NOP_OUT => Request::NopOut(self.parse_nop_out()?),
            opcode::LOGOUT_REQUEST => Request::Logout(self.parse_logout_request()?),
            opcode::TASK_MANAGEMENT_REQUEST => {
                Request::TaskManagement(self.parse_task_management()?)
            }
            other => Request::Unsupported(other),
        })
    }

    fn expect_opcode(&self, expected: u8) -> Result<(), CodecError> {
        if self.opcode != expected {
            return Err(CodecError::UnexpectedOpcode {
                expected,
                actual: self.opcode,
            });
        }
        Ok(())
    }
}

/// Parsed Login Request
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub isid: [u8; 6],
    pub tsih: u16,
    pub cid: u16,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub transit: bool,
    pub cont: bool,
    pub csg: u8,
    pub nsg: u8,
    pub version_max: u8,
    pub version_min: u8,
    pub parameters: Vec<(String, String)>,
}

/// Parsed SCSI Command
#[derive(Debug, Clone)]
pub struct ScsiCommandPdu {
    pub lun: u64,
    pub itt: u32,
    pub expected_data_length: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub cdb: [u8; 16],
    pub read: bool,
    pub write: bool,
    pub final_flag: bool,
}

/// Parsed SCSI Data-Out
#[derive(Debug, Clone)]
pub struct ScsiDataOutPdu {
    pub lun: u64,
    pub itt: u32,
    pub ttt: u32,
    pub exp_stat_sn: u32,
    pub data_sn: u32,
    pub buffer_offset: u32,
    pub data: Vec<u8>,
    pub final_flag: bool,
}

/// Parsed NOP-Out
#[derive(Debug, Clone)]
pub struct NopOutPdu {
    pub lun: u64,
    pub itt: u32,
    pub ttt: u32,
    pub immediate: bool,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub data: Vec<u8>,
}

/// Parsed Text Request
#[derive(Debug, Clone)]
pub struct TextRequest {
    pub itt: u32,
    pub ttt: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub final_flag: bool,
    pub cont: bool,
    pub parameters: Vec<(String, String)>,
}

/// Parsed Logout Request
#[derive(Debug, Clone)]
pub struct LogoutRequest {
    pub itt: u32,
    pub reason: u8,
    pub cid: u16,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
}

/// Parsed Task Management Function Request
#[derive(Debug, Clone)]
pub struct TaskManagementRequest {
    pub itt: u32,
    pub function: u8,
    pub referenced_task_tag: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
}

impl IscsiPdu {
    /// Parse Login Request fields
    pub fn parse_login_request(&self) -> Result<LoginRequest, CodecError> {
        self.expect_opcode(opcode::LOGIN_REQUEST)?;

        let lun_bytes = self.lun.to_be_bytes();
        let mut isid = [0u8; 6];
        isid.copy_from_slice(&lun_bytes[0..6]);
        let tsih = BigEndian::read_u16(&lun_bytes[6..8]);

        Ok(LoginRequest {
            isid,
            tsih,
            cid: BigEndian::read_u16(&self.specific[0..2]),
            cmd_sn: self.cmd_sn(),
            exp_stat_sn: self.exp_stat_sn(),
            transit: (self.flags & flags::TRANSIT) != 0,
            cont: (self.flags & flags::CONTINUE_LOGIN) != 0,
            csg: (self.flags >> 2) & 0x03,
            nsg: self.flags & 0x03,
            version_max: self.specific2[0],
            version_min: self.specific2[1],
            parameters: parse_text_parameters(&self.data)?,
        })
    }

    /// Parse SCSI Command PDU
    pub fn parse_scsi_command(&self) -> Result<ScsiCommandPdu, CodecError> {
        self.expect_opcode(opcode::SCSI_COMMAND)?;

        let mut cdb = [0u8; 16];
        cdb.copy_from_slice(&self.specific[12..28]);

        Ok(ScsiCommandPdu {
            lun: self.lun,
            itt: self.itt,
            expected_data_length: BigEndian::read_u32(&self.specific[0..4]),
            cmd_sn: self.cmd_sn(),
            exp_stat_sn: self.exp_stat_sn(),
            cdb,
            read: (self.flags & flags::READ) != 0,
            write: (self.flags & flags::WRITE) != 0,
            final_flag: (self.flags & flags::FINAL) != 0,
        })
    }

    /// Parse SCSI Data-Out PDU (write payload from the initiator)
    pub fn parse_scsi_data_out(&self) -> Result<ScsiDataOutPdu, CodecError> {
        self.expect_opcode(opcode::SCSI_DATA_OUT)?;

        Ok(ScsiDataOutPdu {
            lun: self.lun,
            itt: self.itt,
            ttt: BigEndian::read_u32(&self.specific[0..4]),
            exp_stat_sn: self.exp_stat_sn(),
            data_sn: BigEndian::read_u32(&self.specific[16..20]),
            buffer_offset: BigEndian::read_u32(&self.specific[20..24]),
            data: self.data.clone(),
            final_flag: (self.flags & flags::FINAL) != 0,
        })
    }

    /// Parse NOP-Out PDU
    pub fn parse_nop_out(&self) -> Result<NopOutPdu, CodecError> {
        self.expect_opcode(opcode::NOP_OUT)?;

        Ok(NopOutPdu {
            lun: self.lun,
            itt: self.itt,
            ttt: BigEndian::read_u32(&self.specific[0..4]),
            immediate: self.immediate,
            cmd_sn: self.cmd_sn(),
            exp_stat_sn: self.exp_stat_sn(),
            data: self.data.clone(),
        })
    }

    /// Parse Text Request
    pub fn parse_text_request(&self) -> Result<TextRequest, CodecError> {
        self.expect_opcode(opcode::TEXT_REQUEST)?;

        Ok(TextRequest {
            itt: self.itt,
            ttt: BigEndian::read_u32(&self.specific[0..4]),
            cmd_sn: self.cmd_sn(),
            exp_stat_sn: self.exp_stat_sn(),
            final_flag: (self.flags & flags::FINAL) != 0,
            cont: (self.flags & flags::CONTINUE) != 0,
            parameters: parse_text_parameters(&self.data)?,
        })
    }

    /// Parse Logout Request
    pub fn parse_logout_request(&self) -> Result<LogoutRequest, CodecError> {
        self.expect_opcode(opcode::LOGOUT_REQUEST)?;

        Ok(LogoutRequest {
            itt: self.itt,
            reason: self.flags & 0x7F,
            cid: BigEndian::read_u16(&self.specific[0..2]),
            cmd_sn: self.cmd_sn(),
            exp_stat_sn: self.exp_stat_sn(),
        })
    }

    /// Parse Task Management Function Request
    pub fn parse_task_management(&self) -> Result<TaskManagementRequest, CodecError> {
        self.expect_opcode(opcode::TASK_MANAGEMENT_REQUEST)?;

        Ok(TaskManagementRequest {
            itt: self.itt,
            function: self.flags & 0x7F,
            referenced_task_tag: BigEndian::read_u32(&self.specific[0..4]),
            cmd_sn: self.cmd_sn(),
            exp_stat_sn: self.exp_stat_sn(),
        })
    }
}

// ============================================================================
// Response constructors
// ============================================================================

impl IscsiPdu {
    /// Create a Login Response PDU
    pub fn login_response(
        isid: [u8; 6],
        tsih: u16,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        status_class: u8,
        status_detail: u8,
        csg: u8,
        nsg: u8,
        transit: bool,
        itt: u32,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::LOGIN_RESPONSE;
        pdu.flags =
            (if transit { flags::TRANSIT } else { 0 }) | ((csg & 0x03) << 2) | (nsg & 0x03);
        // Version-Max / Version-Active, both 0x00
        pdu.specific2 = [0x00, 0x00];

        let mut lun_bytes = [0u8; 8];
        lun_bytes[0..6].copy_from_slice(&isid);
        lun_bytes[6..8].copy_from_slice(&tsih.to_be_bytes());
        pdu.lun = u64::from_be_bytes(lun_bytes);
        pdu.itt = itt;

        pdu.specific[4..8].copy_from_slice(&stat_sn.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&exp_cmd_sn.to_be_bytes());
        pdu.specific[12..16].copy_from_slice(&max_cmd_sn.to_be_bytes());
        pdu.specific[16] = status_class;
        pdu.specific[17] = status_detail;

        pdu.data = data;
        pdu.data_length = pdu.data.len() as u32;
        pdu
    }

    /// Create a SCSI Response PDU.
    ///
    /// When sense data is present the data segment carries it prefixed with
    /// the 2-byte SenseLength field per RFC 3720 Section 10.4.7.
    pub fn scsi_response(
        itt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        status: u8,
        response: u8,
        residual_count: u32,
        sense_data: Option<&[u8]>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::SCSI_RESPONSE;
        pdu.flags = flags::FINAL;
        pdu.specific2 = [response, status];
        pdu.itt = itt;

        pdu.specific[4..8].copy_from_slice(&stat_sn.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&exp_cmd_sn.to_be_bytes());
        pdu.specific[12..16].copy_from_slice(&max_cmd_sn.to_be_bytes());
        pdu.specific[24..28].copy_from_slice(&residual_count.to_be_bytes());

        if let Some(sense) = sense_data {
            let mut data = Vec::with_capacity(2 + sense.len());
            data.extend_from_slice(&(sense.len() as u16).to_be_bytes());
            data.extend_from_slice(sense);
            pdu.data = data;
            pdu.data_length = pdu.data.len() as u32;
        }
        pdu
    }

    /// Create a SCSI Data-In PDU (read payload to the initiator).
    ///
    /// When `status` is given the S bit is set and the PDU collapses the
    /// final status into the data burst; `stat_sn` is only meaningful then.
    pub fn scsi_data_in(
        itt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        data_sn: u32,
        buffer_offset: u32,
        data: Vec<u8>,
        final_flag: bool,
        status: Option<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::SCSI_DATA_IN;

        let mut flag_bits = 0u8;
        if final_flag {
            flag_bits |= flags::FINAL;
        }
        if let Some(s) = status {
            flag_bits |= flags::STATUS;
            pdu.specific2[1] = s; // Status lives in byte 3 when S is set
        }
        pdu.flags = flag_bits;
        pdu.itt = itt;

        pdu.specific[0..4].copy_from_slice(&RESERVED_TAG.to_be_bytes());
        pdu.specific[4..8].copy_from_slice(&stat_sn.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&exp_cmd_sn.to_be_bytes());
        pdu.specific[12..16].copy_from_slice(&max_cmd_sn.to_be_bytes());
        pdu.specific[16..20].copy_from_slice(&data_sn.to_be_bytes());
        pdu.specific[20..24].copy_from_slice(&buffer_offset.to_be_bytes());

        pdu.data = data;
        pdu.data_length = pdu.data.len() as u32;
        pdu
    }

    /// Create an R2T (Ready To Transfer) PDU
    pub fn r2t(
        lun: u64,
        itt: u32,
        ttt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        r2t_sn: u32,
        buffer_offset: u32,
        desired_length: u32,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::R2T;
        pdu.flags = flags::FINAL;
        pdu.lun = lun;
        pdu.itt = itt;

        pdu.specific[0..4].copy_from_slice(&ttt.to_be_bytes());
        pdu.specific[4..8].copy_from_slice(&stat_sn.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&exp_cmd_sn.to_be_bytes());
        pdu.specific[12..16].copy_from_slice(&max_cmd_sn.to_be_bytes());
        pdu.specific[16..20].copy_from_slice(&r2t_sn.to_be_bytes());
        pdu.specific[20..24].copy_from_slice(&buffer_offset.to_be_bytes());
        pdu.specific[24..28].copy_from_slice(&desired_length.to_be_bytes());
        pdu
    }

    /// Create a NOP-In PDU (usually a response to a NOP-Out ping)
    pub fn nop_in(
        itt: u32,
        ttt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        lun: u64,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::NOP_IN;
        pdu.flags = flags::FINAL;
        pdu.lun = lun;
        pdu.itt = itt;

        pdu.specific[0..4].copy_from_slice(&ttt.to_be_bytes());
        pdu.specific[4..8].copy_from_slice(&stat_sn.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&exp_cmd_sn.to_be_bytes());
        pdu.specific[12..16].copy_from_slice(&max_cmd_sn.to_be_bytes());

        pdu.data = data;
        pdu.data_length = pdu.data.len() as u32;
        pdu
    }

    /// Create a Text Response PDU
    pub fn text_response(
        itt: u32,
        ttt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        final_flag: bool,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::TEXT_RESPONSE;
        pdu.flags = if final_flag { flags::FINAL } else { 0 };
        pdu.itt = itt;

        pdu.specific[0..4].copy_from_slice(&ttt.to_be_bytes());
        pdu.specific[4..8].copy_from_slice(&stat_sn.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&exp_cmd_sn.to_be_bytes());
        pdu.specific[12..16].copy_from_slice(&max_cmd_sn.to_be_bytes());

        pdu.data = data;
        pdu.data_length = pdu.data.len() as u32;
        pdu
    }

    /// Create a Logout Response PDU
    pub fn logout_response(
        itt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        response: u8,
        time2wait: u16,
        time2retain: u16,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::LOGOUT_RESPONSE;
        pdu.flags = flags::FINAL;
        pdu.specific2[0] = response;
        pdu.itt = itt;

        pdu.specific[4..8].copy_from_slice(&stat_sn.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&exp_cmd_sn.to_be_bytes());
        pdu.specific[12..16].copy_from_slice(&max_cmd_sn.to_be_bytes());
        pdu.specific[20..22].copy_from_slice(&time2wait.to_be_bytes());
        pdu.specific[22..24].copy_from_slice(&time2retain.to_be_bytes());
        pdu
    }

    /// Create a Task Management Function Response PDU
    pub fn task_management_response(
        itt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        response: u8,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::TASK_MANAGEMENT_RESPONSE;
        pdu.flags = flags::FINAL;
        pdu.specific2[0] = response;
        pdu.itt = itt;

        pdu.specific[4..8].copy_from_slice(&stat_sn.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&exp_cmd_sn.to_be_bytes());
        pdu.specific[12..16].copy_from_slice(&max_cmd_sn.to_be_bytes());
        pdu
    }

    /// Create an Async Message PDU (e.g. the target asking the initiator to
    /// log out before a shutdown).
    pub fn async_message(
        event: u8,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        parameter3: u16,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::ASYNC_MESSAGE;
        pdu.flags = flags::FINAL;
        pdu.itt = RESERVED_TAG;

        pdu.specific[4..8].copy_from_slice(&stat_sn.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&exp_cmd_sn.to_be_bytes());
        pdu.specific[12..16].copy_from_slice(&max_cmd_sn.to_be_bytes());
        pdu.specific[16] = event;
        pdu.specific[22..24].copy_from_slice(&parameter3.to_be_bytes());
        pdu
    }

    /// Create a Reject PDU.
    ///
    /// The data segment carries the header of the PDU being rejected
    /// (RFC 3720 Section 10.17), so the initiator can match it to a task.
    pub fn reject(
        reason: u8,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        bad_header: &[u8],
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::REJECT;
        pdu.flags = flags::FINAL;
        pdu.specific2[0] = reason;
        pdu.itt = RESERVED_TAG;

        pdu.specific[4..8].copy_from_slice(&stat_sn.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&exp_cmd_sn.to_be_bytes());
        pdu.specific[12..16].copy_from_slice(&max_cmd_sn.to_be_bytes());
        // DataSN/R2TSN is 0 for the only Reject this target emits

        pdu.data = bad_header.to_vec();
        pdu.data_length = pdu.data.len() as u32;
        pdu
    }
}

// ============================================================================
// Stream framing with digests
// ============================================================================

/// Read one PDU from a stream, verifying digests when negotiated.
///
/// Blocks until the 48-byte BHS arrives, then reads the optional header
/// digest, the AHS (framed but discarded), the padded data segment and the
/// optional data digest. The whole PDU is consumed even when it is bad, so
/// the stream stays aligned on the next one; digest mismatches and
/// data segments beyond `max_data_segment_length` surface as the matching
/// [`CodecError`] and the caller answers with a REJECT.
pub fn read_pdu<R: Read>(
    stream: &mut R,
    header_digest: Digest,
    data_digest: Digest,
    max_data_segment_length: u32,
) -> ScsiResult<IscsiPdu> {
    let mut bhs = [0u8; BHS_SIZE];
    stream.read_exact(&mut bhs)?;

    let mut header_mismatch = None;
    if header_digest == Digest::Crc32c {
        let mut received = [0u8; 4];
        stream.read_exact(&mut received)?;
        // CRC32C is a reflected algorithm; the digest travels LSB first
        // (RFC 3720 Appendix B.4)
        let received = u32::from_le_bytes(received);
        let computed = crc32c(&bhs);
        if computed != received {
            // Keep reading so the stream stays framed, then report
            header_mismatch = Some(CodecError::HeaderDigestMismatch {
                computed,
                received,
                header: Box::new(bhs),
            });
        }
    }

    let ahs_length = bhs[4] as usize * 4;
    let data_length = ((bhs[5] as u32) << 16) | ((bhs[6] as u32) << 8) | (bhs[7] as u32);
    let padded_data_len = pad4(data_length as usize);

    let mut rest = vec![0u8; ahs_length + padded_data_len];
    stream.read_exact(&mut rest)?;

    let mut data_mismatch = None;
    if data_digest == Digest::Crc32c && data_length > 0 {
        let mut received = [0u8; 4];
        stream.read_exact(&mut received)?;
        let received = u32::from_le_bytes(received);
        let computed = crc32c(&rest[ahs_length..]);
        if computed != received {
            data_mismatch = Some(CodecError::DataDigestMismatch {
                computed,
                received,
                header: Box::new(bhs),
            });
        }
    }

    // Everything is consumed at this point, so the stream stays aligned on
    // the next PDU regardless of what was wrong with this one.
    if let Some(e) = header_mismatch {
        return Err(e.into());
    }
    if data_length > max_data_segment_length {
        return Err(CodecError::OversizedDataSegment {
            length: data_length,
            limit: max_data_segment_length,
            header: Box::new(bhs),
        }
        .into());
    }
    if let Some(e) = data_mismatch {
        return Err(e.into());
    }

    let mut full = Vec::with_capacity(BHS_SIZE + rest.len());
    full.extend_from_slice(&bhs);
    full.extend_from_slice(&rest);
    Ok(IscsiPdu::from_bytes(&full)?)
}

/// Write one PDU to a stream, appending digests when negotiated.
pub fn write_pdu<W: Write>(
    stream: &mut W,
    pdu: &IscsiPdu,
    header_digest: Digest,
    data_digest: Digest,
) -> ScsiResult<()> {
    let bhs = pdu.bhs_bytes();
    stream.write_all(&bhs)?;

    if header_digest == Digest::Crc32c {
        stream.write_all(&crc32c(&bhs).to_le_bytes())?;
    }

    if !pdu.data.is_empty() {
        let mut padded = pdu.data.clone();
        padded.resize(pad4(pdu.data.len()), 0);
        stream.write_all(&padded)?;
        if data_digest == Digest::Crc32c {
            stream.write_all(&crc32c(&padded).to_le_bytes())?;
        }
    }

    stream.flush()?;
    Ok(())
}

// ============================================================================
// Text parameter utilities
// ============================================================================

/// Parse iSCSI text parameters (NUL-terminated `Key=Value` pairs)
pub fn parse_text_parameters(data: &[u8]) -> Result<Vec<(String, String)>, CodecError> {
    let mut params = Vec::new();

    for chunk in data.split(|&b| b == 0) {
        if chunk.is_empty() {
            continue;
        }
        let s = String::from_utf8_lossy(chunk);
        match s.find('=') {
            Some(0) | None => {
                return Err(CodecError::MalformedText(s.into_owned()));
            }
            Some(eq) => {
                params.push((s[..eq].to_string(), s[eq + 1..].to_string()));
            }
        }
    }

    Ok(params)
}

/// Serialize text parameters to NUL-terminated format
pub fn serialize_text_parameters(params: &[(String, String)]) -> Vec<u8> {
    let mut data = Vec::new();
    for (key, value) in params {
        data.extend_from_slice(key.as_bytes());
        data.push(b'=');
        data.extend_from_slice(value.as_bytes());
        data.push(0);
    }
    data
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IscsiError;
    use std::io::Cursor;

    #[test]
    fn test_pdu_roundtrip_simple() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::NOP_OUT;
        pdu.flags = flags::FINAL;
        pdu.itt = 0x12345678;
        pdu.lun = 0x0001020304050607;

        let bytes = pdu.to_bytes();
        assert_eq!(bytes.len(), BHS_SIZE);

        let parsed = IscsiPdu::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, pdu);
    }

    #[test]
    fn test_pdu_roundtrip_with_data() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::LOGIN_REQUEST;
        pdu.data = b"InitiatorName=iqn.test\0".to_vec();
        pdu.data_length = pdu.data.len() as u32;

        let bytes = pdu.to_bytes();
        assert!(bytes.len() >= BHS_SIZE + pdu.data.len());
        assert_eq!(bytes.len() % 4, 0);

        let parsed = IscsiPdu::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.opcode, opcode::LOGIN_REQUEST);
        assert_eq!(parsed.data, pdu.data);
    }

    #[test]
    fn test_pdu_too_short() {
        let bytes = vec![0u8; 20];
        assert!(IscsiPdu::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_data_padding() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::TEXT_REQUEST;
        pdu.data = vec![1, 2, 3]; // 3 bytes, pads to 4

        let bytes = pdu.to_bytes();
        assert_eq!(bytes.len(), BHS_SIZE + 4);
        assert_eq!(bytes[BHS_SIZE + 3], 0);
    }

    #[test]
    fn test_immediate_flag() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::LOGIN_REQUEST;
        pdu.immediate = true;

        let bytes = pdu.to_bytes();
        assert_eq!(bytes[0] & 0x40, 0x40);
        assert!(IscsiPdu::from_bytes(&bytes).unwrap().immediate);
    }

    #[test]
    fn test_scsi_response_layout() {
        let pdu = IscsiPdu::scsi_response(
            0x1234,
            7,
            8,
            9,
            scsi_status::CHECK_CONDITION,
            0,
            0,
            Some(&[0x70, 0, 0x05, 0, 0, 0, 0, 10, 0, 0, 0, 0, 0x21, 0, 0, 0, 0, 0]),
        );
        let bytes = pdu.to_bytes();
        // Response and Status live in BHS bytes 2 and 3
        assert_eq!(bytes[2], 0x00);
        assert_eq!(bytes[3], scsi_status::CHECK_CONDITION);
        // Data segment leads with the 2-byte SenseLength
        assert_eq!(&bytes[48..50], &[0, 18]);
        assert_eq!(bytes[50], 0x70);
    }

    #[test]
    fn test_data_in_status_collapse() {
        let pdu = IscsiPdu::scsi_data_in(
            1,
            5,
            6,
            7,
            0,
            0,
            vec![0xAB; 8],
            true,
            Some(scsi_status::GOOD),
        );
        let bytes = pdu.to_bytes();
        assert_eq!(bytes[1] & flags::FINAL, flags::FINAL);
        assert_eq!(bytes[1] & flags::STATUS, flags::STATUS);
        assert_eq!(bytes[3], scsi_status::GOOD);
    }

    #[test]
    fn test_reject_layout() {
        let bad = [0xAAu8; BHS_SIZE];
        let pdu = IscsiPdu::reject(reject_reason::PROTOCOL_ERROR, 1, 2, 3, &bad);
        let bytes = pdu.to_bytes();
        assert_eq!(bytes[0] & 0x3F, opcode::REJECT);
        assert_eq!(bytes[2], reject_reason::PROTOCOL_ERROR);
        assert_eq!(BigEndian::read_u32(&bytes[16..20]), RESERVED_TAG);
        assert_eq!(&bytes[48..96], &bad[..]);
    }

    #[test]
    fn test_async_message_layout() {
        let pdu = IscsiPdu::async_message(async_event::LOGOUT_REQUESTED, 9, 10, 11, 2);
        let bytes = pdu.to_bytes();
        assert_eq!(bytes[0] & 0x3F, opcode::ASYNC_MESSAGE);
        assert_eq!(BigEndian::read_u32(&bytes[16..20]), RESERVED_TAG);
        assert_eq!(bytes[36], async_event::LOGOUT_REQUESTED);
        assert_eq!(BigEndian::read_u16(&bytes[42..44]), 2);
    }

    #[test]
    fn test_stream_roundtrip_no_digest() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::SCSI_COMMAND;
        pdu.flags = flags::FINAL | flags::READ;
        pdu.itt = 42;
        pdu.data = vec![1, 2, 3, 4, 5];
        pdu.data_length = 5;

        let mut buf = Vec::new();
        write_pdu(&mut buf, &pdu, Digest::None, Digest::None).unwrap();
        let parsed = read_pdu(&mut Cursor::new(&buf), Digest::None, Digest::None, MAX_DATA_SEGMENT_LENGTH).unwrap();
        assert_eq!(parsed, pdu);
    }

    #[test]
    fn test_stream_roundtrip_all_digest_modes() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::TEXT_REQUEST;
        pdu.flags = flags::FINAL;
        pdu.itt = 7;
        pdu.data = b"SendTargets=All\0".to_vec();
        pdu.data_length = pdu.data.len() as u32;

        for hd in [Digest::None, Digest::Crc32c] {
            for dd in [Digest::None, Digest::Crc32c] {
                let mut buf = Vec::new();
                write_pdu(&mut buf, &pdu, hd, dd).unwrap();
                let parsed = read_pdu(&mut Cursor::new(&buf), hd, dd, MAX_DATA_SEGMENT_LENGTH).unwrap();
                assert_eq!(parsed, pdu, "digest mode ({hd:?}, {dd:?})");
            }
        }
    }

    #[test]
    fn test_header_digest_mismatch() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::NOP_OUT;
        pdu.itt = 1;

        let mut buf = Vec::new();
        write_pdu(&mut buf, &pdu, Digest::Crc32c, Digest::None).unwrap();
        buf[10] ^= 0x01; // flip one bit inside the BHS

        let err = read_pdu(&mut Cursor::new(&buf), Digest::Crc32c, Digest::None, MAX_DATA_SEGMENT_LENGTH).unwrap_err();
        assert!(matches!(
            err,
            IscsiError::Codec(CodecError::HeaderDigestMismatch { .. })
        ));
    }

    #[test]
    fn test_data_digest_mismatch() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::SCSI_DATA_OUT;
        pdu.itt = 1;
        pdu.data = vec![9u8; 16];
        pdu.data_length = 16;

        let mut buf = Vec::new();
        write_pdu(&mut buf, &pdu, Digest::None, Digest::Crc32c).unwrap();
        let n = buf.len();
        buf[n - 6] ^= 0x80; // corrupt the data segment

        let err = read_pdu(&mut Cursor::new(&buf), Digest::None, Digest::Crc32c, MAX_DATA_SEGMENT_LENGTH).unwrap_err();
        assert!(matches!(
            err,
            IscsiError::Codec(CodecError::DataDigestMismatch { .. })
        ));
    }

    #[test]
    fn test_parse_request_sum() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::LOGOUT_REQUEST;
        pdu.flags = flags::FINAL | logout_reason::CLOSE_SESSION;
        match pdu.parse_request().unwrap() {
            Request::Logout(req) => assert_eq!(req.reason, logout_reason::CLOSE_SESSION),
            other => panic!("wrong variant: {other:?}"),
        }

        pdu.opcode = 0x1F;
        assert!(matches!(
            pdu.parse_request().unwrap(),
            Request::Unsupported(0x1F)
        ));
    }

    #[test]
    fn test_login_request_roundtrip_fields() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::LOGIN_REQUEST;
        pdu.immediate = true;
        pdu.flags = flags::TRANSIT | (1 << 2) | 3; // CSG=1, NSG=3, T
        let isid = [0x80, 0x02, 0x3D, 0x00, 0x00, 0x01];
        let mut lun_bytes = [0u8; 8];
        lun_bytes[0..6].copy_from_slice(&isid);
        pdu.lun = u64::from_be_bytes(lun_bytes);
        pdu.itt = 0xAB;
        pdu.specific[4..8].copy_from_slice(&5u32.to_be_bytes());
        pdu.data = b"InitiatorName=iqn.x\0TargetName=iqn.t\0".to_vec();

        let req = pdu.parse_login_request().unwrap();
        assert_eq!(req.isid, isid);
        assert_eq!(req.tsih, 0);
        assert_eq!(req.csg, 1);
        assert_eq!(req.nsg, 3);
        assert!(req.transit);
        assert_eq!(req.cmd_sn, 5);
        assert_eq!(req.parameters.len(), 2);
    }

    #[test]
    fn test_parse_text_parameters() {
        let data = b"Key1=Value1\0Key2=Value2\0";
        let params = parse_text_parameters(data).unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0], ("Key1".to_string(), "Value1".to_string()));
        assert_eq!(params[1], ("Key2".to_string(), "Value2".to_string()));
    }

    #[test]
    fn test_parse_text_parameters_malformed() {
        assert!(parse_text_parameters(b"NoEqualsSign\0").is_err());
        assert!(parse_text_parameters(b"=NoKey\0").is_err());
        // empty value is legal
        assert_eq!(
            parse_text_parameters(b"SendTargets=\0").unwrap()[0],
            ("SendTargets".to_string(), String::new())
        );
    }

    #[test]
    fn test_serialize_text_parameters() {
        let params = vec![
            ("Key1".to_string(), "Value1".to_string()),
            ("Key2".to_string(), "Value2".to_string()),
        ];
        assert_eq!(serialize_text_parameters(&params), b"Key1=Value1\0Key2=Value2\0");
    }
}
