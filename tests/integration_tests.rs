//! End-to-end tests against a live target
//!
//! Each test spins up a real server on an ephemeral loopback port, exports
//! one or two in-memory targets and drives them with the in-crate initiator
//! client: login, discovery, SCSI I/O including the R2T write flow, digests
//! and logout.

use iscsi_targetd::client::{IscsiClient, LoginOptions};
use iscsi_targetd::digest::{crc32c, Digest};
use iscsi_targetd::pdu::{opcode, reject_reason, scsi_status};
use iscsi_targetd::server::TargetServer;
use iscsi_targetd::storage::MemBlockStore;
use iscsi_targetd::target::{Target, TargetRegistry};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TARGET_IQN: &str = "iqn.2010-04.example:storage.disk1";
const SECOND_IQN: &str = "iqn.2010-04.example:storage.disk2";
const INITIATOR_IQN: &str = "iqn.2010-04.example:initiator";

/// 1 MiB = 2048 virtual blocks
const DISK_BYTES: usize = 1024 * 1024;

struct TestTarget {
    server: Arc<TargetServer>,
    addr: String,
}

impl TestTarget {
    fn start() -> Self {
        Self::start_with(false, false)
    }

    fn start_with(two_targets: bool, sloppy: bool) -> Self {
        let targets = Arc::new(TargetRegistry::new());
        targets
            .add(Target::new(
                TARGET_IQN.to_string(),
                Some("Test Disk".to_string()),
                Arc::new(MemBlockStore::new(DISK_BYTES)),
            ))
            .unwrap();
        if two_targets {
            targets
                .add(Target::new(
                    SECOND_IQN.to_string(),
                    None,
                    Arc::new(MemBlockStore::new(DISK_BYTES)),
                ))
                .unwrap();
        }

        let server = Arc::new(
            TargetServer::builder()
                .bind_addr("127.0.0.1:0")
                .allow_sloppy_negotiation(sloppy)
                .targets(targets)
                .bind()
                .unwrap(),
        );
        let addr = server.local_addr().unwrap().to_string();

        let runner = Arc::clone(&server);
        thread::spawn(move || {
            let _ = runner.run();
        });
        // Wait for the accept loop to come up
        while !server.is_running() {
            thread::sleep(Duration::from_millis(5));
        }

        TestTarget { server, addr }
    }

    fn client(&self) -> IscsiClient {
        IscsiClient::connect(&self.addr).unwrap()
    }
}

impl Drop for TestTarget {
    fn drop(&mut self) {
        self.server.stop();
    }
}

// ---------------------------------------------------------------------------
// Scenario 1: login + REPORT LUNS
// ---------------------------------------------------------------------------

#[test]
fn login_and_report_luns() {
    let target = TestTarget::start();
    let mut client = target.client();

    client
        .login(INITIATOR_IQN, TARGET_IQN, &LoginOptions::default())
        .unwrap();
    assert_ne!(client.tsih(), 0);
    assert_eq!(
        client.negotiated().target_alias.as_deref(),
        Some("Test Disk")
    );

    let result = client.report_luns(16).unwrap();
    assert!(result.is_good());
    assert_eq!(&result.data[0..4], &[0x00, 0x00, 0x00, 0x08]);
    assert_eq!(&result.data[8..16], &[0u8; 8]);
}

// ---------------------------------------------------------------------------
// Scenario 2: READ CAPACITY(10) on a 1 MiB medium
// ---------------------------------------------------------------------------

#[test]
fn read_capacity_10() {
    let target = TestTarget::start();
    let mut client = target.client();
    client
        .login(INITIATOR_IQN, TARGET_IQN, &LoginOptions::default())
        .unwrap();

    let result = client.read_capacity10().unwrap();
    assert!(result.is_good());
    assert_eq!(&result.data[0..4], &0x0000_07FFu32.to_be_bytes()); // 2048 blocks - 1
    assert_eq!(&result.data[4..8], &0x0000_0200u32.to_be_bytes());
}

// ---------------------------------------------------------------------------
// Scenario 3: out-of-bounds READ(10)
// ---------------------------------------------------------------------------

#[test]
fn read_out_of_bounds() {
    let target = TestTarget::start();
    let mut client = target.client();
    client
        .login(INITIATOR_IQN, TARGET_IQN, &LoginOptions::default())
        .unwrap();

    let result = client.read10(2048, 1).unwrap();
    assert_eq!(result.status, scsi_status::CHECK_CONDITION);
    assert_eq!(result.sense_triple(), Some((0x05, 0x21, 0x00)));

    // REQUEST SENSE serves the stored sense data back
    let sense = client.request_sense().unwrap();
    assert!(sense.is_good());
    assert_eq!(sense.data[2] & 0x0F, 0x05);
    assert_eq!(sense.data[12], 0x21);
}

// ---------------------------------------------------------------------------
// Scenario 4: digest mismatch answered with REJECT, connection survives
// ---------------------------------------------------------------------------

#[test]
fn header_digest_mismatch_rejected() {
    let target = TestTarget::start();
    let mut client = target.client();
    client
        .login(
            INITIATOR_IQN,
            TARGET_IQN,
            &LoginOptions {
                header_digest: "CRC32C",
                ..LoginOptions::default()
            },
        )
        .unwrap();
    assert_eq!(client.negotiated().header_digest, Digest::Crc32c);

    // Frame a TEST UNIT READY by hand and corrupt one digest bit
    let mut pdu = iscsi_targetd::pdu::IscsiPdu::new();
    pdu.opcode = opcode::SCSI_COMMAND;
    pdu.flags = iscsi_targetd::pdu::flags::FINAL;
    pdu.itt = 0x7777;
    pdu.specific[4..8].copy_from_slice(&client.cmd_sn().to_be_bytes());
    pdu.specific[8..12].copy_from_slice(&client.exp_stat_sn().to_be_bytes());

    let bhs = pdu.bhs_bytes();
    let mut wire = Vec::new();
    wire.extend_from_slice(&bhs);
    wire.extend_from_slice(&(crc32c(&bhs) ^ 0x0000_0100).to_le_bytes());
    client.send_raw_bytes(&wire).unwrap();

    let reject = client.recv_pdu().unwrap();
    assert_eq!(reject.opcode, opcode::REJECT);
    assert_eq!(reject.specific2[0], reject_reason::HEADER_DIGEST_ERROR);

    // The connection is still usable: the same CmdSN goes through cleanly
    let result = client.test_unit_ready().unwrap();
    assert!(result.is_good());
}

#[test]
fn data_digest_mismatch_rejected() {
    let target = TestTarget::start();
    let mut client = target.client();
    client
        .login(
            INITIATOR_IQN,
            TARGET_IQN,
            &LoginOptions {
                data_digest: "CRC32C",
                ..LoginOptions::default()
            },
        )
        .unwrap();

    // NOP-Out ping with a corrupted data digest
    let mut pdu = iscsi_targetd::pdu::IscsiPdu::new();
    pdu.opcode = opcode::NOP_OUT;
    pdu.immediate = true;
    pdu.flags = iscsi_targetd::pdu::flags::FINAL;
    pdu.itt = 0x8888;
    pdu.specific[0..4].copy_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
    pdu.specific[4..8].copy_from_slice(&client.cmd_sn().to_be_bytes());
    pdu.specific[8..12].copy_from_slice(&client.exp_stat_sn().to_be_bytes());
    pdu.data = b"ping-ping-ping-!".to_vec();
    pdu.data_length = 16;

    let mut wire = pdu.to_bytes();
    let digest = crc32c(&wire[48..]);
    wire.extend_from_slice(&(digest ^ 1).to_le_bytes());
    client.send_raw_bytes(&wire).unwrap();

    let reject = client.recv_pdu().unwrap();
    assert_eq!(reject.opcode, opcode::REJECT);
    assert_eq!(reject.specific2[0], reject_reason::DATA_DIGEST_ERROR);

    let echoed = client.ping(b"still alive").unwrap();
    assert_eq!(echoed, b"still alive");
}

// ---------------------------------------------------------------------------
// Scenario 5: WRITE(10) with InitialR2T=Yes and MaxBurstLength=4096
// ---------------------------------------------------------------------------

#[test]
fn write_with_initial_r2t() {
    let target = TestTarget::start();
    let mut client = target.client();
    client
        .login(
            INITIATOR_IQN,
            TARGET_IQN,
            &LoginOptions {
                initial_r2t: true,
                max_burst_length: 4096,
                ..LoginOptions::default()
            },
        )
        .unwrap();
    assert!(client.negotiated().initial_r2t);

    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();

    // WRITE(10) lba=0 len=8, no immediate data
    let mut cdb = [0u8; 10];
    cdb[0] = 0x2A;
    cdb[8] = 8;
    let request = client.build_scsi_command(&cdb, false, true, 4096, &[]);
    let itt = request.itt;
    client.send_pdu(&request).unwrap();

    let r2t = client.recv_pdu().unwrap();
    assert_eq!(r2t.opcode, opcode::R2T);
    let ttt = u32::from_be_bytes(r2t.specific[0..4].try_into().unwrap());
    let buffer_offset = u32::from_be_bytes(r2t.specific[20..24].try_into().unwrap());
    let desired = u32::from_be_bytes(r2t.specific[24..28].try_into().unwrap());
    assert_ne!(ttt, 0xFFFF_FFFF);
    assert_eq!(buffer_offset, 0);
    assert_eq!(desired, 4096);

    client.send_data_out(itt, ttt, 0, &payload).unwrap();
    let response = client.recv_pdu().unwrap();
    assert_eq!(response.opcode, opcode::SCSI_RESPONSE);
    assert_eq!(response.specific2[1], scsi_status::GOOD);

    // The same range reads back identical bytes
    let readback = client.read10(0, 8).unwrap();
    assert!(readback.is_good());
    assert_eq!(readback.data, payload);
}

// ---------------------------------------------------------------------------
// Scenario 6: logout closes the session
// ---------------------------------------------------------------------------

#[test]
fn logout_closes_session() {
    let target = TestTarget::start();
    let mut client = target.client();
    client
        .login(INITIATOR_IQN, TARGET_IQN, &LoginOptions::default())
        .unwrap();
    assert_eq!(target.server.session_count(), 1);

    let response = client.logout().unwrap();
    assert_eq!(response, 0);

    // The target closes the socket and forgets the session
    for _ in 0..100 {
        if target.server.session_count() == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(target.server.session_count(), 0);
    assert!(client.recv_pdu().is_err());
}

// ---------------------------------------------------------------------------
// Further coverage
// ---------------------------------------------------------------------------

#[test]
fn write_read_roundtrip_immediate_data() {
    let target = TestTarget::start();
    let mut client = target.client();
    client
        .login(INITIATOR_IQN, TARGET_IQN, &LoginOptions::default())
        .unwrap();

    let payload: Vec<u8> = (0..1024u32).map(|i| (i * 7 % 256) as u8).collect();
    let result = client.write10(10, &payload).unwrap();
    assert!(result.is_good());

    let readback = client.read10(10, 2).unwrap();
    assert!(readback.is_good());
    assert_eq!(readback.data, payload);
}

#[test]
fn large_read_is_chunked_and_reassembled() {
    let target = TestTarget::start();
    let mut client = target.client();
    client
        .login(INITIATOR_IQN, TARGET_IQN, &LoginOptions::default())
        .unwrap();

    // 40 blocks = 20480 bytes, more than two 8192-byte Data-In bursts
    let payload: Vec<u8> = (0..20480u32).map(|i| (i % 253) as u8).collect();
    assert!(client.write10(100, &payload).unwrap().is_good());

    let readback = client.read10(100, 40).unwrap();
    assert!(readback.is_good());
    assert_eq!(readback.data.len(), payload.len());
    assert_eq!(readback.data, payload);
}

#[test]
fn write_larger_than_first_burst_uses_r2t() {
    let target = TestTarget::start();
    let mut client = target.client();
    client
        .login(
            INITIATOR_IQN,
            TARGET_IQN,
            &LoginOptions {
                first_burst_length: 4096,
                max_burst_length: 8192,
                ..LoginOptions::default()
            },
        )
        .unwrap();

    // 32 KiB: 4 KiB immediate, the rest solicited in 8 KiB bursts
    let payload: Vec<u8> = (0..32768u32).map(|i| (i % 241) as u8).collect();
    let result = client.write16(200, &payload).unwrap();
    assert!(result.is_good());

    let readback = client.read16(200, 64).unwrap();
    assert_eq!(readback.data, payload);
}

#[test]
fn full_roundtrip_with_both_digests() {
    let target = TestTarget::start();
    let mut client = target.client();
    client
        .login(
            INITIATOR_IQN,
            TARGET_IQN,
            &LoginOptions {
                header_digest: "CRC32C",
                data_digest: "CRC32C",
                ..LoginOptions::default()
            },
        )
        .unwrap();
    assert_eq!(client.negotiated().header_digest, Digest::Crc32c);
    assert_eq!(client.negotiated().data_digest, Digest::Crc32c);

    let payload = vec![0xC3u8; 2048];
    assert!(client.write10(0, &payload).unwrap().is_good());
    let readback = client.read10(0, 4).unwrap();
    assert_eq!(readback.data, payload);

    assert_eq!(client.logout().unwrap(), 0);
}

#[test]
fn discovery_lists_all_targets() {
    let target = TestTarget::start_with(true, false);
    let mut client = target.client();
    client.login_discovery(INITIATOR_IQN).unwrap();

    let mut found = client.discover().unwrap();
    found.sort();
    let names: Vec<&str> = found.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec![TARGET_IQN, SECOND_IQN]);
    for (_, address) in &found {
        assert!(address.starts_with("127.0.0.1:"));
    }
}

#[test]
fn nop_ping_echoes_payload() {
    let target = TestTarget::start();
    let mut client = target.client();
    client
        .login(INITIATOR_IQN, TARGET_IQN, &LoginOptions::default())
        .unwrap();

    let echoed = client.ping(b"are you there?").unwrap();
    assert_eq!(echoed, b"are you there?");
}

#[test]
fn stat_sn_strictly_increases() {
    let target = TestTarget::start();
    let mut client = target.client();
    client
        .login(INITIATOR_IQN, TARGET_IQN, &LoginOptions::default())
        .unwrap();

    let mut previous = None;
    for _ in 0..3 {
        let request = client.build_scsi_command(&[0u8; 6], false, false, 0, &[]);
        client.send_pdu(&request).unwrap();
        let response = client.recv_pdu().unwrap();
        assert_eq!(response.opcode, opcode::SCSI_RESPONSE);
        let stat_sn = u32::from_be_bytes(response.specific[4..8].try_into().unwrap());
        if let Some(prev) = previous {
            assert_eq!(stat_sn, prev + 1, "StatSN must increase by exactly 1");
        }
        previous = Some(stat_sn);
    }
}

#[test]
fn out_of_window_command_is_dropped() {
    let target = TestTarget::start();
    let mut client = target.client();
    client
        .login(INITIATOR_IQN, TARGET_IQN, &LoginOptions::default())
        .unwrap();

    // CmdSN far beyond MaxCmdSN: silently dropped, nothing comes back
    let mut stale = client.build_scsi_command(&[0u8; 6], false, false, 0, &[]);
    let far = client.cmd_sn().wrapping_add(1000);
    stale.specific[4..8].copy_from_slice(&far.to_be_bytes());
    client.send_pdu(&stale).unwrap();

    // A proper command at the expected CmdSN still completes; its response
    // is the next PDU on the wire, proving the stale one was dropped.
    // (build_scsi_command consumed one CmdSN for the stale PDU, so rewind.)
    let request = client.build_scsi_command(&[0u8; 6], false, false, 0, &[]);
    let mut fixed = request.clone();
    fixed.specific[4..8].copy_from_slice(&client.cmd_sn().wrapping_sub(2).to_be_bytes());
    client.send_pdu(&fixed).unwrap();

    let response = client.recv_pdu().unwrap();
    assert_eq!(response.opcode, opcode::SCSI_RESPONSE);
    assert_eq!(response.itt, fixed.itt);
}

#[test]
fn queued_command_executes_after_gap_fills() {
    let target = TestTarget::start();
    let mut client = target.client();
    client
        .login(INITIATOR_IQN, TARGET_IQN, &LoginOptions::default())
        .unwrap();

    let exp = client.cmd_sn();

    // Send CmdSN exp+1 first: it must be held, not answered
    let mut later = client.build_scsi_command(&[0u8; 6], false, false, 0, &[]);
    later.specific[4..8].copy_from_slice(&exp.wrapping_add(1).to_be_bytes());
    later.itt = 0x2222;
    client.send_pdu(&later).unwrap();

    // Now fill the gap with CmdSN exp
    let mut first = client.build_scsi_command(&[0u8; 6], false, false, 0, &[]);
    first.specific[4..8].copy_from_slice(&exp.to_be_bytes());
    first.itt = 0x1111;
    client.send_pdu(&first).unwrap();

    // Both answers arrive, in CmdSN order
    let a = client.recv_pdu().unwrap();
    let b = client.recv_pdu().unwrap();
    assert_eq!(a.itt, 0x1111);
    assert_eq!(b.itt, 0x2222);
}

#[test]
fn first_pdu_must_be_login() {
    let target = TestTarget::start();
    let mut client = target.client();

    // A SCSI command on a virgin socket: the target hangs up silently
    let mut pdu = iscsi_targetd::pdu::IscsiPdu::new();
    pdu.opcode = opcode::SCSI_COMMAND;
    pdu.flags = iscsi_targetd::pdu::flags::FINAL;
    client.send_pdu(&pdu).unwrap();

    assert!(client.recv_pdu().is_err());
}

#[test]
fn synchronize_cache_is_good() {
    let target = TestTarget::start();
    let mut client = target.client();
    client
        .login(INITIATOR_IQN, TARGET_IQN, &LoginOptions::default())
        .unwrap();
    assert!(client.synchronize_cache().unwrap().is_good());
}

#[test]
fn inquiry_pages_over_the_wire() {
    let target = TestTarget::start();
    let mut client = target.client();
    client
        .login(INITIATOR_IQN, TARGET_IQN, &LoginOptions::default())
        .unwrap();

    let std = client.inquiry(false, 0, 96).unwrap();
    assert!(std.is_good());
    assert_eq!(std.data[0], 0x00);
    assert_eq!(&std.data[8..16], b"TARGETD ");

    let ident = client.inquiry(true, 0x83, 255).unwrap();
    assert!(ident.is_good());
    let iqn = TARGET_IQN.as_bytes();
    assert!(ident.data.windows(iqn.len()).any(|w| w == iqn));
}
