//! IOC extraction from raw file content
//!
//! Pattern-scans a byte buffer and yields a deduplicated, validated map of
//! indicators per type. Pure: no I/O, no state beyond the compiled patterns.

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{IocMap, IocRecord, IocType};

// Dotted quad with per-octet range check; candidates are parse-verified below.
static IPV4: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\b")
        .expect("ipv4 pattern")
});

// Full eight-group IPv6 form.
static IPV6_FULL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:[0-9a-fA-F]{1,4}:){7}[0-9a-fA-F]{1,4}\b").expect("ipv6 full pattern")
});

// Compressed IPv6 forms, including zero-compression and the embedded
// IPv4-suffix form.
static IPV6_COMPRESSED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(?:[0-9a-fA-F]{1,4}:){1,7}:|(?:[0-9a-fA-F]{1,4}:){1,6}:[0-9a-fA-F]{1,4}|(?:[0-9a-fA-F]{1,4}:){1,5}(?::[0-9a-fA-F]{1,4}){1,2}|(?:[0-9a-fA-F]{1,4}:){1,4}(?::[0-9a-fA-F]{1,4}){1,3}|(?:[0-9a-fA-F]{1,4}:){1,3}(?::[0-9a-fA-F]{1,4}){1,4}|(?:[0-9a-fA-F]{1,4}:){1,2}(?::[0-9a-fA-F]{1,4}){1,5}|[0-9a-fA-F]{1,4}:(?::[0-9a-fA-F]{1,4}){1,6}|:(?::[0-9a-fA-F]{1,4}){1,7}|::(?:[fF]{4}:)?(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\b",
    )
    .expect("ipv6 compressed pattern")
});

static MD5: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[a-fA-F0-9]{32}\b").expect("md5 pattern"));

static SHA1: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[a-fA-F0-9]{40}\b").expect("sha1 pattern"));

static SHA256: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[a-fA-F0-9]{64}\b").expect("sha256 pattern"));

// FQDNs ending in a common gTLD or any two-letter ccTLD.
static DOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+(?:com|net|org|edu|gov|mil|int|info|biz|name|pro|aero|coop|museum|[a-z]{2})\b")
        .expect("domain pattern")
});

static URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bhttps?://[^\s<>"'`{}\[\]|\\^]+"#).expect("url pattern")
});

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b").expect("email pattern")
});

/// IPv4 prefixes dropped by the private-address filter.
const PRIVATE_IPV4_PREFIXES: &[&str] = &[
    "10.", "172.16.", "172.17.", "172.18.", "172.19.", "172.20.", "172.21.", "172.22.", "172.23.",
    "172.24.", "172.25.", "172.26.", "172.27.", "172.28.", "172.29.", "172.30.", "172.31.",
    "192.168.", "127.", "0.",
];

/// Domains dropped by the boilerplate filter.
const BOILERPLATE_DOMAINS: &[&str] = &[
    "example.com",
    "example.org",
    "example.net",
    "localhost.local",
    "test.com",
    "domain.com",
];

/// Call-site filtering options. Both default off to preserve recall.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractOptions {
    pub exclude_private_ips: bool,
    pub exclude_boilerplate_domains: bool,
}

/// Extract all IOCs from raw content.
///
/// Returns a map keyed by type; within each type, values are deduplicated
/// in first-seen order. Types with no matches are absent from the map.
pub fn scan(content: &[u8]) -> IocMap {
    let text = String::from_utf8_lossy(content);
    let mut results = IocMap::new();

    insert_nonempty(&mut results, IocType::Ipv4, extract_ipv4(&text));
    insert_nonempty(&mut results, IocType::Ipv6, extract_ipv6(&text));
    insert_nonempty(&mut results, IocType::Md5, extract_hashes(&MD5, &text));
    insert_nonempty(&mut results, IocType::Sha1, extract_hashes(&SHA1, &text));
    insert_nonempty(&mut results, IocType::Sha256, extract_hashes(&SHA256, &text));
    insert_nonempty(&mut results, IocType::Domain, extract_domains(&text));
    insert_nonempty(&mut results, IocType::Url, extract_urls(&text));
    insert_nonempty(&mut results, IocType::Email, extract_emails(&text));

    results
}

/// Extract with optional post-filters applied.
pub fn scan_with_options(content: &[u8], opts: ExtractOptions) -> IocMap {
    let mut results = scan(content);

    if opts.exclude_private_ips {
        if let Some(ips) = results.get_mut(&IocType::Ipv4) {
            ips.retain(|ip| !PRIVATE_IPV4_PREFIXES.iter().any(|p| ip.starts_with(p)));
            if ips.is_empty() {
                results.remove(&IocType::Ipv4);
            }
        }
    }

    if opts.exclude_boilerplate_domains {
        if let Some(domains) = results.get_mut(&IocType::Domain) {
            domains.retain(|d| !BOILERPLATE_DOMAINS.contains(&d.as_str()));
            if domains.is_empty() {
                results.remove(&IocType::Domain);
            }
        }
    }

    results
}

/// Total IOCs across all types of a scan result.
pub fn count(results: &IocMap) -> usize {
    results.values().map(Vec::len).sum()
}

/// Flatten a scan result into index records, stamping ingestion defaults.
pub fn flatten(results: &IocMap, source_file_id: &str, now: DateTime<Utc>) -> Vec<IocRecord> {
    let mut records = Vec::with_capacity(count(results));
    for (&ioc_type, values) in results {
        for value in values {
            records.push(IocRecord {
                value: value.clone(),
                ioc_type,
                source_file_id: source_file_id.to_string(),
                malware_family: "Unknown".to_string(),
                confidence: 50,
                first_seen: now,
                last_seen: now,
                hit_count: 0,
                tags: Vec::new(),
            });
        }
    }
    records
}

// ==================== Per-type extraction ====================

fn extract_ipv4(text: &str) -> Vec<String> {
    let candidates = IPV4
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .filter(|ip| ip.parse::<Ipv4Addr>().is_ok());
    deduplicate(candidates)
}

fn extract_ipv6(text: &str) -> Vec<String> {
    let full = IPV6_FULL.find_iter(text).map(|m| m.as_str().to_string());
    let compressed = IPV6_COMPRESSED
        .find_iter(text)
        .map(|m| m.as_str().to_string());

    let valid = full.chain(compressed).filter(|candidate| {
        // Must parse as IPv6 and not be an IPv4 address in disguise.
        match candidate.parse::<Ipv6Addr>() {
            Ok(addr) => addr.to_ipv4_mapped().is_none(),
            Err(_) => false,
        }
    });
    deduplicate(valid)
}

fn extract_hashes(pattern: &Regex, text: &str) -> Vec<String> {
    let candidates = pattern
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|h| !is_constant_hash(h));
    deduplicate(candidates)
}

fn extract_domains(text: &str) -> Vec<String> {
    deduplicate(DOMAIN.find_iter(text).map(|m| m.as_str().to_lowercase()))
}

fn extract_urls(text: &str) -> Vec<String> {
    let trimmed = URL
        .find_iter(text)
        .map(|m| trim_trailing_punct_once(m.as_str()).to_string());
    deduplicate(trimmed)
}

fn extract_emails(text: &str) -> Vec<String> {
    deduplicate(EMAIL.find_iter(text).map(|m| m.as_str().to_lowercase()))
}

// ==================== Helpers ====================

fn insert_nonempty(results: &mut IocMap, ioc_type: IocType, values: Vec<String>) {
    if !values.is_empty() {
        results.insert(ioc_type, values);
    }
}

/// Remove duplicates, preserving first-seen order.
fn deduplicate(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for item in items {
        if seen.insert(item.clone()) {
            result.push(item);
        }
    }
    result
}

/// All-zero and all-f digit runs are log-file noise, not real digests.
fn is_constant_hash(hash: &str) -> bool {
    hash.bytes().all(|b| b == b'0') || hash.bytes().all(|b| b == b'f')
}

/// Strip at most one trailing punctuation character from a matched URL.
fn trim_trailing_punct_once(url: &str) -> &str {
    match url.as_bytes().last() {
        Some(b'.' | b',' | b';' | b':' | b'!' | b'?' | b')') => &url[..url.len() - 1],
        _ => url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_ipv4_and_domain() {
        let results = scan(b"Connected to 8.8.8.8 via bad-domain.com");
        assert_eq!(results[&IocType::Ipv4], vec!["8.8.8.8"]);
        assert_eq!(results[&IocType::Domain], vec!["bad-domain.com"]);
        assert_eq!(count(&results), 2);
    }

    #[test]
    fn rejects_out_of_range_octets() {
        let results = scan(b"not an address: 300.1.2.3");
        assert!(!results.contains_key(&IocType::Ipv4));
    }

    #[test]
    fn sha256_does_not_bleed_into_shorter_hash_types() {
        let results =
            scan(b"hash e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855 seen");
        assert_eq!(
            results[&IocType::Sha256],
            vec!["e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"]
        );
        assert!(!results.contains_key(&IocType::Md5));
        assert!(!results.contains_key(&IocType::Sha1));
    }

    #[test]
    fn hashes_are_lowercased() {
        let results = scan(b"DEADBEEFDEADBEEFDEADBEEFDEADBEEF");
        assert_eq!(results[&IocType::Md5], vec!["deadbeefdeadbeefdeadbeefdeadbeef"]);
    }

    #[test]
    fn constant_hashes_are_filtered() {
        let zeros = "0".repeat(64);
        let effs = "f".repeat(64);
        let content = format!("{} {} {}", zeros, effs, "F".repeat(32));
        let results = scan(content.as_bytes());
        assert!(!results.contains_key(&IocType::Md5));
        assert!(!results.contains_key(&IocType::Sha1));
        assert!(!results.contains_key(&IocType::Sha256));
    }

    #[test]
    fn ipv4_mapped_form_is_not_reported_as_ipv6() {
        let results = scan(b"mapped ::ffff:8.8.8.8 here");
        assert_eq!(results[&IocType::Ipv4], vec!["8.8.8.8"]);
        assert!(!results.contains_key(&IocType::Ipv6));
    }

    #[test]
    fn full_and_compressed_ipv6_forms() {
        let results = scan(b"2001:0db8:85a3:0000:0000:8a2e:0370:7334 and 2001:db8::1");
        let v6 = &results[&IocType::Ipv6];
        assert!(v6.contains(&"2001:0db8:85a3:0000:0000:8a2e:0370:7334".to_string()));
        assert!(v6.contains(&"2001:db8::1".to_string()));
    }

    #[test]
    fn url_trailing_punct_trimmed_exactly_once() {
        let results = scan(b"see http://x.com). for details");
        assert_eq!(results[&IocType::Url], vec!["http://x.com)"]);
    }

    #[test]
    fn emails_and_domains_are_lowercased() {
        let results = scan(b"Contact Admin@Evil-Corp.COM now");
        assert_eq!(results[&IocType::Email], vec!["admin@evil-corp.com"]);
        assert!(results[&IocType::Domain].contains(&"evil-corp.com".to_string()));
    }

    #[test]
    fn duplicates_collapse_in_first_seen_order() {
        let results = scan(b"1.2.3.4 then 5.6.7.8 then 1.2.3.4 again");
        assert_eq!(results[&IocType::Ipv4], vec!["1.2.3.4", "5.6.7.8"]);
    }

    #[test]
    fn private_ip_filter_is_opt_in() {
        let content = b"10.0.0.1 and 192.168.1.5 and 8.8.4.4 and 172.20.1.1";
        let unfiltered = scan(content);
        assert_eq!(unfiltered[&IocType::Ipv4].len(), 4);

        let filtered = scan_with_options(
            content,
            ExtractOptions {
                exclude_private_ips: true,
                ..Default::default()
            },
        );
        assert_eq!(filtered[&IocType::Ipv4], vec!["8.8.4.4"]);
    }

    #[test]
    fn boilerplate_domain_filter_is_opt_in() {
        let content = b"example.com and evil.com";
        let filtered = scan_with_options(
            content,
            ExtractOptions {
                exclude_boilerplate_domains: true,
                ..Default::default()
            },
        );
        assert_eq!(filtered[&IocType::Domain], vec!["evil.com"]);
    }

    #[test]
    fn tolerates_arbitrary_binary_input() {
        let mut content = vec![0xff, 0xfe, 0x00, 0x9c];
        content.extend_from_slice(b"8.8.8.8");
        content.extend_from_slice(&[0x80, 0x81]);
        let results = scan(&content);
        assert_eq!(results[&IocType::Ipv4], vec!["8.8.8.8"]);
    }

    #[test]
    fn scan_is_pure() {
        let content = b"8.8.8.8 bad.com http://a.io/x admin@b.org";
        assert_eq!(scan(content), scan(content));
    }

    #[test]
    fn flatten_stamps_defaults() {
        let now = Utc::now();
        let results = scan(b"8.8.8.8");
        let records = flatten(&results, "abc123", now);
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.ioc_type, IocType::Ipv4);
        assert_eq!(r.source_file_id, "abc123");
        assert_eq!(r.malware_family, "Unknown");
        assert_eq!(r.confidence, 50);
        assert_eq!(r.hit_count, 0);
        assert_eq!(r.first_seen, now);
        assert_eq!(r.last_seen, now);
        assert!(r.tags.is_empty());
    }
}
