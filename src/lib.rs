//! A pure Rust user-space iSCSI target (RFC 3720)
//!
//! This library implements the iSCSI protocol engine of a block-storage
//! target: PDU framing with CRC32C digests, login-phase text negotiation,
//! per-session command windows, SCSI command dispatch and the R2T/Data-Out
//! write flow. Storage is pluggable through the [`BlockStore`] trait; the
//! shipped binary exports raw image files described by an XML configuration.
//!
//! # Example
//!
//! ```no_run
//! use iscsi_targetd::storage::FileBlockStore;
//! use iscsi_targetd::target::{Target, TargetRegistry};
//! use iscsi_targetd::server::TargetServer;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let targets = Arc::new(TargetRegistry::new());
//! targets.add(Target::new(
//!     "iqn.2010-04.example:storage.disk1".to_string(),
//!     Some("Disk 1".to_string()),
//!     Arc::new(FileBlockStore::open("disk1.img")?),
//! ))?;
//!
//! let server = TargetServer::builder()
//!     .bind_addr("0.0.0.0:3260")
//!     .targets(targets)
//!     .bind()?;
//! server.run()?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod digest;
pub mod error;
pub mod login;
pub mod pdu;
pub mod scsi;
pub mod server;
pub mod session;
pub mod settings;
pub mod storage;
pub mod target;
pub mod transfer;

pub use client::IscsiClient;
pub use config::TargetConfiguration;
pub use error::{CodecError, IscsiError, ScsiResult};
pub use server::TargetServer;
pub use storage::BlockStore;

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
