//! Bulk lookup planning
//!
//! Pure helpers behind `/check`: pick the candidates that survive the
//! membership pre-filter, collapse index rows per value, and assemble
//! positional results.

use std::collections::HashMap;

use crate::models::{IocRecord, IocResult};

/// Values whose membership verdict is `true`, deduplicated, in input order.
/// These are the only values worth asking the index about.
pub fn candidates(iocs: &[String], verdicts: &[bool]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    iocs.iter()
        .zip(verdicts)
        .filter(|(_, &maybe)| maybe)
        .filter(|(ioc, _)| seen.insert(ioc.as_str().to_string()))
        .map(|(ioc, _)| ioc.clone())
        .collect()
}

/// Collapse index rows to one record per value. The index tolerates multiple
/// rows per natural key; the one with the greatest `last_seen` wins.
pub fn best_by_value(rows: Vec<IocRecord>) -> HashMap<String, IocRecord> {
    let mut best: HashMap<String, IocRecord> = HashMap::new();
    for row in rows {
        match best.get(&row.value) {
            Some(existing) if existing.last_seen >= row.last_seen => {}
            _ => {
                best.insert(row.value.clone(), row);
            }
        }
    }
    best
}

/// Build the positional result list. Output order matches input order;
/// returns the results and the found count.
pub fn assemble(
    iocs: &[String],
    best: &HashMap<String, IocRecord>,
) -> (Vec<IocResult>, usize) {
    let mut found = 0;
    let results = iocs
        .iter()
        .map(|ioc| match best.get(ioc) {
            Some(record) => {
                found += 1;
                IocResult::found(ioc.clone(), record)
            }
            None => IocResult::not_found(ioc.clone()),
        })
        .collect();
    (results, found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IocType;
    use chrono::{Duration, Utc};

    fn record(value: &str, last_seen_offset_secs: i64) -> IocRecord {
        IocRecord {
            value: value.to_string(),
            ioc_type: IocType::Ipv4,
            source_file_id: format!("src-{last_seen_offset_secs}"),
            malware_family: "Unknown".to_string(),
            confidence: 50,
            first_seen: Utc::now(),
            last_seen: Utc::now() + Duration::seconds(last_seen_offset_secs),
            hit_count: 0,
            tags: vec![],
        }
    }

    #[test]
    fn candidates_keep_input_order_and_dedup() {
        let iocs = vec![
            "x".to_string(),
            "8.8.8.8".to_string(),
            "x".to_string(),
            "y".to_string(),
        ];
        let verdicts = vec![true, true, true, false];
        assert_eq!(candidates(&iocs, &verdicts), vec!["x", "8.8.8.8"]);
    }

    #[test]
    fn degraded_mode_passes_everything_through() {
        let iocs = vec!["a".to_string(), "b".to_string()];
        let verdicts = vec![true; iocs.len()];
        assert_eq!(candidates(&iocs, &verdicts).len(), 2);
    }

    #[test]
    fn best_by_value_keeps_greatest_last_seen() {
        let rows = vec![record("8.8.8.8", 10), record("8.8.8.8", 50), record("8.8.8.8", 20)];
        let best = best_by_value(rows);
        assert_eq!(best["8.8.8.8"].source_file_id, "src-50");
    }

    #[test]
    fn assemble_preserves_positional_order() {
        let iocs = vec!["x".to_string(), "8.8.8.8".to_string(), "x".to_string()];
        let best = best_by_value(vec![record("8.8.8.8", 0)]);
        let (results, found) = assemble(&iocs, &best);

        assert_eq!(results.len(), 3);
        assert_eq!(found, 1);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.ioc, iocs[i]);
        }
        assert!(!results[0].found);
        assert!(results[1].found);
        assert!(!results[2].found);
        assert_eq!(results[1].ioc_type, Some(IocType::Ipv4));
    }

    #[test]
    fn assemble_with_no_rows_finds_nothing() {
        let iocs = vec!["a".to_string(), "b".to_string()];
        let (results, found) = assemble(&iocs, &HashMap::new());
        assert_eq!(found, 0);
        assert!(results.iter().all(|r| !r.found));
    }
}
