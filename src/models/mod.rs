//! Core data models for the threat intelligence platform

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Types of Indicators of Compromise.
///
/// The declaration order is stable; each variant carries a small integer
/// tag used by the columnar index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IocType {
    Ipv4,
    Ipv6,
    Domain,
    Url,
    Md5,
    Sha1,
    Sha256,
    Email,
}

impl IocType {
    /// All supported IOC types, in stable order.
    pub const ALL: [IocType; 8] = [
        IocType::Ipv4,
        IocType::Ipv6,
        IocType::Domain,
        IocType::Url,
        IocType::Md5,
        IocType::Sha1,
        IocType::Sha256,
        IocType::Email,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IocType::Ipv4 => "ipv4",
            IocType::Ipv6 => "ipv6",
            IocType::Domain => "domain",
            IocType::Url => "url",
            IocType::Md5 => "md5",
            IocType::Sha1 => "sha1",
            IocType::Sha256 => "sha256",
            IocType::Email => "email",
        }
    }

    /// Integer tag stored in the IOC index.
    pub fn tag(&self) -> u8 {
        match self {
            IocType::Ipv4 => 1,
            IocType::Ipv6 => 2,
            IocType::Domain => 3,
            IocType::Url => 4,
            IocType::Md5 => 5,
            IocType::Sha1 => 6,
            IocType::Sha256 => 7,
            IocType::Email => 8,
        }
    }

    pub fn from_tag(tag: u8) -> Option<IocType> {
        match tag {
            1 => Some(IocType::Ipv4),
            2 => Some(IocType::Ipv6),
            3 => Some(IocType::Domain),
            4 => Some(IocType::Url),
            5 => Some(IocType::Md5),
            6 => Some(IocType::Sha1),
            7 => Some(IocType::Sha256),
            8 => Some(IocType::Email),
            _ => None,
        }
    }
}

impl std::fmt::Display for IocType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing status of a crawled file.
///
/// A file moves through at most `pending -> {infected | misc | failed}`;
/// `clean` is a transient verdict for unchanged re-visits and is never
/// written to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Clean,
    Infected,
    Misc,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Clean => "clean",
            ScanStatus::Infected => "infected",
            ScanStatus::Misc => "misc",
            ScanStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<ScanStatus> {
        match s {
            "pending" => Some(ScanStatus::Pending),
            "clean" => Some(ScanStatus::Clean),
            "infected" => Some(ScanStatus::Infected),
            "misc" => Some(ScanStatus::Misc),
            "failed" => Some(ScanStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single extracted indicator, as stored in the IOC index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IocRecord {
    pub value: String,
    #[serde(rename = "type")]
    pub ioc_type: IocType,
    pub source_file_id: String,
    pub malware_family: String,
    pub confidence: u8,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub hit_count: u32,
    pub tags: Vec<String>,
}

/// Registry entry for a crawled file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: String,
    pub file_path: String,
    pub file_size: u64,
    pub last_modified: DateTime<Utc>,
    pub scan_status: ScanStatus,
    pub ioc_count: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub blob_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    pub processed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The multi-map produced by one extractor pass: values per type,
/// deduplicated, in first-seen order.
pub type IocMap = BTreeMap<IocType, Vec<String>>;

// ==================== API Request/Response Models ====================

/// Bulk IOC check request.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CheckRequest {
    #[validate(length(min = 1, max = 1000))]
    pub iocs: Vec<String>,
}

/// Bulk IOC check response.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResponse {
    pub results: Vec<IocResult>,
    pub total: usize,
    pub found: usize,
    pub not_found: usize,
    pub query_time: String,
}

/// One positional result of a bulk check.
#[derive(Debug, Clone, Serialize)]
pub struct IocResult {
    pub ioc: String,
    pub found: bool,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub ioc_type: Option<IocType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub malware_family: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<String>,
}

impl IocResult {
    pub fn not_found(ioc: String) -> Self {
        Self {
            ioc,
            found: false,
            ioc_type: None,
            source_file_id: None,
            malware_family: None,
            confidence: None,
            first_seen: None,
        }
    }

    pub fn found(ioc: String, record: &IocRecord) -> Self {
        Self {
            ioc,
            found: true,
            ioc_type: Some(record.ioc_type),
            source_file_id: Some(record.source_file_id.clone()),
            malware_family: Some(record.malware_family.clone()),
            confidence: Some(record.confidence),
            first_seen: Some(record.first_seen.to_rfc3339()),
        }
    }
}

/// Health / readiness response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub components: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioc_type_tags_round_trip() {
        for ty in IocType::ALL {
            assert_eq!(IocType::from_tag(ty.tag()), Some(ty));
        }
        assert_eq!(IocType::from_tag(0), None);
        assert_eq!(IocType::from_tag(9), None);
    }

    #[test]
    fn ioc_type_serializes_lowercase() {
        let json = serde_json::to_string(&IocType::Sha256).unwrap();
        assert_eq!(json, "\"sha256\"");
        let back: IocType = serde_json::from_str("\"ipv4\"").unwrap();
        assert_eq!(back, IocType::Ipv4);
    }

    #[test]
    fn scan_status_parse_matches_display() {
        for status in [
            ScanStatus::Pending,
            ScanStatus::Clean,
            ScanStatus::Infected,
            ScanStatus::Misc,
            ScanStatus::Failed,
        ] {
            assert_eq!(ScanStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ScanStatus::parse("quarantined"), None);
    }

    #[test]
    fn check_request_bounds() {
        let empty = CheckRequest { iocs: vec![] };
        assert!(empty.validate().is_err());

        let ok = CheckRequest {
            iocs: vec!["8.8.8.8".to_string()],
        };
        assert!(ok.validate().is_ok());

        let oversize = CheckRequest {
            iocs: vec!["x".to_string(); 1001],
        };
        assert!(oversize.validate().is_err());
    }

    #[test]
    fn ioc_result_omits_enrichment_when_absent() {
        let json = serde_json::to_value(IocResult::not_found("nope.invalid".into())).unwrap();
        assert_eq!(json["found"], false);
        assert!(json.get("type").is_none());
        assert!(json.get("source_file_id").is_none());
    }
}
