//! SCSI command dispatch
//!
//! Parses the 16-byte CDB carried in a SCSI Command PDU and executes it
//! against the target's [`BlockStore`]. Commands that move write data hand
//! off to the transfer engine instead of completing here. Bounds are checked
//! before the store is ever touched, so boundary violations always surface
//! as CHECK CONDITION with sense data rather than I/O errors.

use crate::error::ScsiResult;
use crate::pdu::scsi_status;
use crate::storage::{BlockStore, BoundsCheck};
use crate::target::Target;
use byteorder::{BigEndian, ByteOrder};
use std::time::Instant;

/// SCSI sense keys (SPC-3)
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x00;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const UNIT_ATTENTION: u8 = 0x06;
}

/// Additional sense code / qualifier pairs (SPC-3)
pub mod asc {
    pub const NO_ADDITIONAL_SENSE: (u8, u8) = (0x00, 0x00);
    pub const WRITE_ERROR: (u8, u8) = (0x0C, 0x00);
    pub const UNRECOVERED_READ_ERROR: (u8, u8) = (0x11, 0x00);
    pub const INVALID_COMMAND_OPERATION_CODE: (u8, u8) = (0x20, 0x00);
    pub const LOGICAL_BLOCK_ADDRESS_OUT_OF_RANGE: (u8, u8) = (0x21, 0x00);
    pub const INVALID_FIELD_IN_CDB: (u8, u8) = (0x24, 0x00);
    pub const LOGICAL_UNIT_NOT_SUPPORTED: (u8, u8) = (0x25, 0x00);
}

/// Fixed-format sense data (response code 0x70)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    pub sense_key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl SenseData {
    pub fn new(sense_key: u8, (asc, ascq): (u8, u8)) -> Self {
        SenseData { sense_key, asc, ascq }
    }

    pub fn invalid_opcode() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_COMMAND_OPERATION_CODE)
    }

    pub fn lba_out_of_range() -> Self {
        SenseData::new(
            sense_key::ILLEGAL_REQUEST,
            asc::LOGICAL_BLOCK_ADDRESS_OUT_OF_RANGE,
        )
    }

    pub fn invalid_field_in_cdb() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB)
    }

    pub fn lun_not_supported() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::LOGICAL_UNIT_NOT_SUPPORTED)
    }

    pub fn read_error() -> Self {
        SenseData::new(sense_key::MEDIUM_ERROR, asc::UNRECOVERED_READ_ERROR)
    }

    pub fn write_error() -> Self {
        SenseData::new(sense_key::MEDIUM_ERROR, asc::WRITE_ERROR)
    }

    pub fn no_sense() -> Self {
        SenseData::new(sense_key::NO_SENSE, asc::NO_ADDITIONAL_SENSE)
    }

    /// 18-byte fixed-format sense block (SPC-3 4.5.3)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut sense = vec![0u8; 18];
        sense[0] = 0x70; // current error, fixed format
        sense[2] = self.sense_key & 0x0F;
        sense[7] = 10; // additional sense length
        sense[12] = self.asc;
        sense[13] = self.ascq;
        sense
    }
}

/// Completed SCSI command result
#[derive(Debug, Clone)]
pub struct ScsiResponse {
    pub status: u8,
    pub data: Vec<u8>,
    pub sense: Option<SenseData>,
}

impl ScsiResponse {
    pub fn good(data: Vec<u8>) -> Self {
        ScsiResponse {
            status: scsi_status::GOOD,
            data,
            sense: None,
        }
    }

    pub fn good_no_data() -> Self {
        Self::good(Vec::new())
    }

    pub fn check_condition(sense: SenseData) -> Self {
        ScsiResponse {
            status: scsi_status::CHECK_CONDITION,
            data: Vec::new(),
            sense: Some(sense),
        }
    }
}

/// Dispatch result: either a finished response or a write transfer the
/// connection must drive through the transfer engine.
#[derive(Debug, Clone)]
pub enum ScsiOutcome {
    Complete(ScsiResponse),
    StartWrite { lba: u64, blocks: u32 },
}

/// CDB opcodes this target implements
pub mod cdb_opcode {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const INQUIRY: u8 = 0x12;
    pub const MODE_SENSE_6: u8 = 0x1A;
    pub const START_STOP_UNIT: u8 = 0x1B;
    pub const READ_CAPACITY_10: u8 = 0x25;
    pub const READ_10: u8 = 0x28;
    pub const WRITE_10: u8 = 0x2A;
    pub const VERIFY_10: u8 = 0x2F;
    pub const SYNCHRONIZE_CACHE_10: u8 = 0x35;
    pub const READ_16: u8 = 0x88;
    pub const WRITE_16: u8 = 0x8A;
    pub const SERVICE_ACTION_IN_16: u8 = 0x9E;
    pub const REPORT_LUNS: u8 = 0xA0;
}

const READ_CAPACITY_16_SERVICE_ACTION: u8 = 0x10;

// Standard INQUIRY identity
const VENDOR_ID: &[u8; 8] = b"TARGETD ";
const PRODUCT_ID: &[u8; 16] = b"VIRTUAL-DISK    ";
const PRODUCT_REVISION: &[u8; 4] = b"0003";

/// SCSI command dispatcher
pub struct ScsiHandler;

impl ScsiHandler {
    /// Execute a CDB against a target's store.
    ///
    /// `last_sense` is the sense data saved from the previous CHECK
    /// CONDITION on this connection, served back by REQUEST SENSE.
    pub fn dispatch(
        cdb: &[u8; 16],
        lun: u64,
        target: &Target,
        last_sense: Option<&[u8]>,
    ) -> ScsiResult<ScsiOutcome> {
        // Only LUN 0 exists. LUN 0 is encoded as all-zero regardless of the
        // RFC 3720 3.4.6.1 addressing method.
        if lun != 0 {
            log::warn!("command 0x{:02x} addressed to invalid LUN 0x{lun:016x}", cdb[0]);
            return Ok(ScsiOutcome::Complete(ScsiResponse::check_condition(
                SenseData::lun_not_supported(),
            )));
        }

        let store = target.store().as_ref();
        let outcome = match cdb[0] {
            cdb_opcode::TEST_UNIT_READY => ScsiOutcome::Complete(ScsiResponse::good_no_data()),

            cdb_opcode::REQUEST_SENSE => {
                let alloc_len = cdb[4] as usize;
                let mut data = match last_sense {
                    Some(sense) => sense.to_vec(),
                    None => SenseData::no_sense().to_bytes(),
                };
                data.truncate(alloc_len);
                ScsiOutcome::Complete(ScsiResponse::good(data))
            }

            cdb_opcode::INQUIRY => ScsiOutcome::Complete(inquiry(cdb, target)),

            cdb_opcode::MODE_SENSE_6 => ScsiOutcome::Complete(mode_sense_6(cdb, store)),

            cdb_opcode::START_STOP_UNIT => {
                // Spinning state of a file-backed medium is a no-op
                ScsiOutcome::Complete(ScsiResponse::good_no_data())
            }

            cdb_opcode::READ_CAPACITY_10 => {
                let last_lba = store.size_in_blocks().saturating_sub(1);
                let mut data = vec![0u8; 8];
                BigEndian::write_u32(&mut data[0..4], last_lba.min(u32::MAX as u64) as u32);
                BigEndian::write_u32(&mut data[4..8], store.block_size());
                ScsiOutcome::Complete(ScsiResponse::good(data))
            }

            cdb_opcode::READ_10 => {
                let lba = BigEndian::read_u32(&cdb[2..6]) as u64;
                let blocks = BigEndian::read_u16(&cdb[7..9]) as u32;
                read_blocks(target, lba, blocks)?
            }

            cdb_opcode::READ_16 => {
                let lba = BigEndian::read_u64(&cdb[2..10]);
                let blocks = BigEndian::read_u32(&cdb[10..14]);
                read_blocks(target, lba, blocks)?
            }

            cdb_opcode::WRITE_10 => {
                let lba = BigEndian::read_u32(&cdb[2..6]) as u64;
                let blocks = BigEndian::read_u16(&cdb[7..9]) as u32;
                start_write(store, lba, blocks)
            }

            cdb_opcode::WRITE_16 => {
                let lba = BigEndian::read_u64(&cdb[2..10]);
                let blocks = BigEndian::read_u32(&cdb[10..14]);
                start_write(store, lba, blocks)
            }

            cdb_opcode::VERIFY_10 => {
                let lba = BigEndian::read_u32(&cdb[2..6]) as u64;
                let blocks = BigEndian::read_u16(&cdb[7..9]) as u32;
                match store.check_bounds(lba, blocks) {
                    BoundsCheck::Ok => ScsiOutcome::Complete(ScsiResponse::good_no_data()),
                    _ => ScsiOutcome::Complete(ScsiResponse::check_condition(
                        SenseData::lba_out_of_range(),
                    )),
                }
            }

            cdb_opcode::SYNCHRONIZE_CACHE_10 => match store.flush() {
                Ok(()) => ScsiOutcome::Complete(ScsiResponse::good_no_data()),
                Err(e) => {
                    log::error!("flush failed: {e}");
                    ScsiOutcome::Complete(ScsiResponse::check_condition(SenseData::write_error()))
                }
            },

            cdb_opcode::SERVICE_ACTION_IN_16 => {
                if cdb[1] & 0x1F != READ_CAPACITY_16_SERVICE_ACTION {
                    ScsiOutcome::Complete(ScsiResponse::check_condition(
                        SenseData::invalid_field_in_cdb(),
                    ))
                } else {
                    let alloc_len = BigEndian::read_u32(&cdb[10..14]) as usize;
                    let mut data = vec![0u8; 32];
                    BigEndian::write_u64(&mut data[0..8], store.size_in_blocks().saturating_sub(1));
                    BigEndian::write_u32(&mut data[8..12], store.block_size());
                    data.truncate(alloc_len);
                    ScsiOutcome::Complete(ScsiResponse::good(data))
                }
            }

            cdb_opcode::REPORT_LUNS => {
                let alloc_len = BigEndian::read_u32(&cdb[6..10]) as usize;
                // 8-byte header (LUN list length = 8) + single LUN 0 entry
                let mut data = vec![0u8; 16];
                BigEndian::write_u32(&mut data[0..4], 8);
                data.truncate(alloc_len);
                ScsiOutcome::Complete(ScsiResponse::good(data))
            }

            other => {
                log::warn!("unsupported CDB opcode 0x{other:02x}");
                ScsiOutcome::Complete(ScsiResponse::check_condition(SenseData::invalid_opcode()))
            }
        };

        Ok(outcome)
    }
}

fn read_blocks(target: &Target, lba: u64, blocks: u32) -> ScsiResult<ScsiOutcome> {
    let store = target.store().as_ref();
    match store.check_bounds(lba, blocks) {
        BoundsCheck::Ok => {}
        _ => {
            return Ok(ScsiOutcome::Complete(ScsiResponse::check_condition(
                SenseData::lba_out_of_range(),
            )))
        }
    }

    let block_size = store.block_size() as u64;
    let mut data = vec![0u8; (blocks as u64 * block_size) as usize];
    let start = Instant::now();
    match store.read(&mut data, lba * block_size) {
        Ok(()) => {
            target.add_read_point(data.len() as u64, start, Instant::now());
            Ok(ScsiOutcome::Complete(ScsiResponse::good(data)))
        }
        Err(e) => {
            log::error!("read of {blocks} block(s) at LBA {lba} failed: {e}");
            Ok(ScsiOutcome::Complete(ScsiResponse::check_condition(
                SenseData::read_error(),
            )))
        }
    }
}

fn start_write(store: &dyn BlockStore, lba: u64, blocks: u32) -> ScsiOutcome {
    match store.check_bounds(lba, blocks) {
        BoundsCheck::Ok => ScsiOutcome::StartWrite { lba, blocks },
        _ => ScsiOutcome::Complete(ScsiResponse::check_condition(SenseData::lba_out_of_range())),
    }
}

// ============================================================================
// INQUIRY
// ============================================================================

fn inquiry(cdb: &[u8; 16], target: &Target) -> ScsiResponse {
    let evpd = cdb[1] & 0x01 != 0;
    let page_code = cdb[2];
    let alloc_len = BigEndian::read_u16(&cdb[3..5]) as usize;

    let mut data = if !evpd {
        if page_code != 0 {
            // page code without EVPD is illegal
            return ScsiResponse::check_condition(SenseData::invalid_field_in_cdb());
        }
        standard_inquiry()
    } else {
        match page_code {
            0x00 => vpd_supported_pages(),
            0x80 => vpd_unit_serial(target),
            0x83 => vpd_device_identification(target),
            _ => return ScsiResponse::check_condition(SenseData::invalid_field_in_cdb()),
        }
    };

    data.truncate(alloc_len);
    ScsiResponse::good(data)
}

fn standard_inquiry() -> Vec<u8> {
    let mut data = vec![0u8; 36];
    data[0] = 0x00; // direct-access block device, connected
    data[1] = 0x00; // not removable
    data[2] = 0x05; // SPC-3
    data[3] = 0x02; // response data format 2
    data[4] = 31; // additional length (n - 4)
    data[8..16].copy_from_slice(VENDOR_ID);
    data[16..32].copy_from_slice(PRODUCT_ID);
    data[32..36].copy_from_slice(PRODUCT_REVISION);
    data
}

fn vpd_supported_pages() -> Vec<u8> {
    vec![0x00, 0x00, 0x00, 0x03, 0x00, 0x80, 0x83]
}

/// Unit serial derived from the target name so it survives restarts
fn serial_number(target: &Target) -> String {
    format!("{:08X}", crate::digest::crc32c(target.name().as_bytes()))
}

fn vpd_unit_serial(target: &Target) -> Vec<u8> {
    let serial = serial_number(target);
    let mut data = vec![0x00, 0x80, 0x00, serial.len() as u8];
    data.extend_from_slice(serial.as_bytes());
    data
}

/// Device identification page: a T10 vendor-ID descriptor plus a SCSI name
/// string designator carrying the target's IQN.
fn vpd_device_identification(target: &Target) -> Vec<u8> {
    let mut descriptors = Vec::new();

    // T10 vendor identification, ASCII
    let mut t10_value = Vec::new();
    t10_value.extend_from_slice(VENDOR_ID);
    t10_value.extend_from_slice(serial_number(target).as_bytes());
    descriptors.push(0x02); // code set: ASCII
    descriptors.push(0x01); // association: LU, designator type: T10 vendor ID
    descriptors.push(0x00);
    descriptors.push(t10_value.len() as u8);
    descriptors.extend_from_slice(&t10_value);

    // SCSI name string: the iSCSI target name, UTF-8, padded to 4 bytes
    let mut name = target.name().as_bytes().to_vec();
    while name.len() % 4 != 0 {
        name.push(0);
    }
    descriptors.push(0x53); // protocol identifier: iSCSI, code set: UTF-8
    descriptors.push(0xA8); // PIV, association: target port, type: SCSI name
    descriptors.push(0x00);
    descriptors.push(name.len() as u8);
    descriptors.extend_from_slice(&name);

    let mut data = vec![0x00, 0x83, 0x00, 0x00];
    BigEndian::write_u16(&mut data[2..4], descriptors.len() as u16);
    data.extend_from_slice(&descriptors);
    data
}

// ============================================================================
// MODE SENSE(6)
// ============================================================================

const PAGE_CACHING: u8 = 0x08;
const PAGE_CONTROL: u8 = 0x0A;
const PAGE_ALL: u8 = 0x3F;

fn mode_sense_6(cdb: &[u8; 16], store: &dyn BlockStore) -> ScsiResponse {
    let dbd = cdb[1] & 0x08 != 0;
    let page_code = cdb[2] & 0x3F;
    let alloc_len = cdb[4] as usize;

    let mut pages = Vec::new();
    match page_code {
        PAGE_CACHING => pages.extend_from_slice(&caching_page()),
        PAGE_CONTROL => pages.extend_from_slice(&control_page()),
        PAGE_ALL => {
            pages.extend_from_slice(&caching_page());
            pages.extend_from_slice(&control_page());
        }
        _ => return ScsiResponse::check_condition(SenseData::invalid_field_in_cdb()),
    }

    // 4-byte parameter header, optional 8-byte block descriptor, then pages
    let block_descriptor_len = if dbd { 0 } else { 8 };
    let mut data = vec![0u8; 4 + block_descriptor_len];
    data[0] = (3 + block_descriptor_len + pages.len()) as u8; // mode data length, excluding itself
    data[3] = block_descriptor_len as u8;
    if !dbd {
        let blocks = store.size_in_blocks().min(0xFF_FFFF as u64) as u32;
        BigEndian::write_u32(&mut data[4..8], blocks);
        data[4] = 0; // density code overlays the top byte
        BigEndian::write_u32(&mut data[8..12], store.block_size());
        data[8] = 0; // reserved byte of the block length field
    }
    data.extend_from_slice(&pages);

    data.truncate(alloc_len);
    ScsiResponse::good(data)
}

/// Caching page: write cache disabled, read cache enabled (pass-through)
fn caching_page() -> [u8; 20] {
    let mut page = [0u8; 20];
    page[0] = PAGE_CACHING;
    page[1] = 18; // page length
    page[2] = 0x00; // WCE=0, RCD=0
    page
}

fn control_page() -> [u8; 12] {
    let mut page = [0u8; 12];
    page[0] = PAGE_CONTROL;
    page[1] = 10;
    page
}

// ============================================================================
// Unit Tests
// ============================================================================
