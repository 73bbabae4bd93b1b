//! Target configuration
//!
//! Read once at startup from an XML file:
//!
//! ```xml
//! <configuration>
//!   <GlobalConfig>
//!     <Port>3260</Port>
//!     <AllowSloppyNegotiation>false</AllowSloppyNegotiation>
//!   </GlobalConfig>
//!   <TargetList>
//!     <Target>
//!       <TargetName>iqn.2010-04.example:storage.disk1</TargetName>
//!       <TargetAlias>Disk 1</TargetAlias>
//!       <StorageFile>
//!         <FilePath>disk1.img</FilePath>
//!       </StorageFile>
//!     </Target>
//!   </TargetList>
//! </configuration>
//! ```

use crate::error::{IscsiError, ScsiResult};
use crate::server::ISCSI_PORT;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default configuration file name, resolved in the working directory
pub const CONFIGURATION_FILE_NAME: &str = "iscsi-target.xml";

/// Fallback backing file when a Target omits StorageFile/FilePath
const DEFAULT_STORAGE_FILE: &str = "storage.dat";

/// One exported target as described by the configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    pub name: String,
    pub alias: Option<String>,
    pub storage_file_path: PathBuf,
}

/// The parsed, validated configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConfiguration {
    pub port: u16,
    pub allow_sloppy_negotiation: bool,
    pub targets: Vec<TargetInfo>,
}

// Raw deserialization shapes, matching the XML element names

#[derive(Debug, Deserialize)]
struct XmlConfiguration {
    #[serde(rename = "GlobalConfig")]
    global: Option<XmlGlobalConfig>,
    #[serde(rename = "TargetList")]
    target_list: Option<XmlTargetList>,
}

#[derive(Debug, Deserialize)]
struct XmlGlobalConfig {
    #[serde(rename = "Port")]
    port: Option<u16>,
    #[serde(rename = "AllowSloppyNegotiation")]
    allow_sloppy_negotiation: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct XmlTargetList {
    #[serde(rename = "Target", default)]
    targets: Vec<XmlTarget>,
}

#[derive(Debug, Deserialize)]
struct XmlTarget {
    #[serde(rename = "TargetName")]
    name: String,
    #[serde(rename = "TargetAlias")]
    alias: Option<String>,
    #[serde(rename = "StorageFile")]
    storage_file: Option<XmlStorageFile>,
}

#[derive(Debug, Deserialize)]
struct XmlStorageFile {
    #[serde(rename = "FilePath")]
    file_path: Option<String>,
}

impl TargetConfiguration {
    /// Load and validate the configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> ScsiResult<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            IscsiError::Config(format!(
                "cannot read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::parse(&text)
    }

    /// Parse and validate configuration XML
    pub fn parse(xml: &str) -> ScsiResult<Self> {
        let raw: XmlConfiguration = quick_xml::de::from_str(xml)
            .map_err(|e| IscsiError::Config(format!("malformed configuration: {e}")))?;

        let global = raw.global.unwrap_or(XmlGlobalConfig {
            port: None,
            allow_sloppy_negotiation: None,
        });

        let targets: Vec<TargetInfo> = raw
            .target_list
            .map(|list| list.targets)
            .unwrap_or_default()
            .into_iter()
            .map(TargetInfo::try_from)
            .collect::<ScsiResult<_>>()?;

        if targets.is_empty() {
            return Err(IscsiError::Config(
                "configuration exports no targets".to_string(),
            ));
        }

        Ok(TargetConfiguration {
            port: global.port.unwrap_or(ISCSI_PORT),
            allow_sloppy_negotiation: global.allow_sloppy_negotiation.unwrap_or(false),
            targets,
        })
    }
}

impl TryFrom<XmlTarget> for TargetInfo {
    type Error = IscsiError;

    fn try_from(raw: XmlTarget) -> ScsiResult<Self> {
        let name = raw.name.trim().to_string();
        if !(name.starts_with("iqn.") || name.starts_with("eui.") || name.starts_with("naa.")) {
            return Err(IscsiError::Config(format!(
                "target name {name:?} is not in IQN, EUI or NAA form"
            )));
        }
        let storage_file_path = raw
            .storage_file
            .and_then(|f| f.file_path)
            .unwrap_or_else(|| DEFAULT_STORAGE_FILE.to_string());
        Ok(TargetInfo {
            name,
            alias: raw.alias.map(|a| a.trim().to_string()).filter(|a| !a.is_empty()),
            storage_file_path: PathBuf::from(storage_file_path),
        })
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        <configuration>
          <GlobalConfig>
            <Port>13260</Port>
            <AllowSloppyNegotiation>true</AllowSloppyNegotiation>
          </GlobalConfig>
          <TargetList>
            <Target>
              <TargetName>iqn.2010-04.example:storage.disk1</TargetName>
              <TargetAlias>Disk 1</TargetAlias>
              <StorageFile>
                <FilePath>disk1.img</FilePath>
              </StorageFile>
            </Target>
            <Target>
              <TargetName>iqn.2010-04.example:storage.disk2</TargetName>
              <StorageFile>
                <FilePath>/var/lib/iscsi/disk2.img</FilePath>
              </StorageFile>
            </Target>
          </TargetList>
        </configuration>
    "#;

    #[test]
    fn test_parse_full_configuration() {
        let config = TargetConfiguration::parse(FULL).unwrap();
        assert_eq!(config.port, 13260);
        assert!(config.allow_sloppy_negotiation);
        assert_eq!(config.targets.len(), 2);

        assert_eq!(config.targets[0].name, "iqn.2010-04.example:storage.disk1");
        assert_eq!(config.targets[0].alias.as_deref(), Some("Disk 1"));
        assert_eq!(config.targets[0].storage_file_path, PathBuf::from("disk1.img"));

        assert_eq!(config.targets[1].alias, None);
        assert_eq!(
            config.targets[1].storage_file_path,
            PathBuf::from("/var/lib/iscsi/disk2.img")
        );
    }

    #[test]
    fn test_defaults() {
        let xml = r#"
            <configuration>
              <TargetList>
                <Target>
                  <TargetName>iqn.2010-04.example:disk</TargetName>
                </Target>
              </TargetList>
            </configuration>
        "#;
        let config = TargetConfiguration::parse(xml).unwrap();
        assert_eq!(config.port, 3260);
        assert!(!config.allow_sloppy_negotiation);
        assert_eq!(
            config.targets[0].storage_file_path,
            PathBuf::from("storage.dat")
        );
    }

    #[test]
    fn test_invalid_target_name() {
        let xml = r#"
            <configuration>
              <TargetList>
                <Target>
                  <TargetName>just-a-disk</TargetName>
                </Target>
              </TargetList>
            </configuration>
        "#;
        assert!(TargetConfiguration::parse(xml).is_err());
    }

    #[test]
    fn test_empty_target_list_rejected() {
        let xml = "<configuration><TargetList></TargetList></configuration>";
        assert!(TargetConfiguration::parse(xml).is_err());
        assert!(TargetConfiguration::parse("<configuration/>").is_err());
    }

    #[test]
    fn test_malformed_xml() {
        assert!(TargetConfiguration::parse("<configuration><Target").is_err());
        assert!(TargetConfiguration::parse("not xml at all").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = TargetConfiguration::load("/nonexistent/iscsi-target.xml").unwrap_err();
        assert!(matches!(err, IscsiError::Config(_)));
    }
}
