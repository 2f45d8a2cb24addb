use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::insight::InsightCategory;

/// Aggregated behavioral data an insight is generated from.
///
/// `pattern_counts` uses a BTreeMap so the fingerprint sees the patterns in
/// a stable order regardless of how the caller assembled them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BehavioralSnapshot {
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub pattern_counts: BTreeMap<String, u64>,
}

/// Coarse digest of the data behind an insight.
///
/// The message count is floored to the nearest 10 so a single extra message
/// does not invalidate an active cooldown, while a meaningfully larger data
/// set produces a different fingerprint and unlocks regeneration early.
pub fn fingerprint(category: InsightCategory, data: &BehavioralSnapshot) -> String {
    let mut hasher = Sha256::new();
    hasher.update(category.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update((data.message_count / 10 * 10).to_le_bytes());
    for (pattern, count) in &data.pattern_counts {
        hasher.update(b"|");
        hasher.update(pattern.as_bytes());
        hasher.update(b"=");
        hasher.update(count.to_le_bytes());
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(message_count: u64, patterns: &[(&str, u64)]) -> BehavioralSnapshot {
        BehavioralSnapshot {
            message_count,
            pattern_counts: patterns
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let data = snapshot(42, &[("late_night", 3), ("long_messages", 7)]);
        assert_eq!(
            fingerprint(InsightCategory::Communication, &data),
            fingerprint(InsightCategory::Communication, &data)
        );
    }

    #[test]
    fn test_one_extra_message_does_not_change_fingerprint() {
        let before = snapshot(42, &[("late_night", 3)]);
        let after = snapshot(43, &[("late_night", 3)]);
        assert_eq!(
            fingerprint(InsightCategory::Behavioral, &before),
            fingerprint(InsightCategory::Behavioral, &after)
        );
    }

    #[test]
    fn test_crossing_a_bucket_changes_fingerprint() {
        let before = snapshot(49, &[("late_night", 3)]);
        let after = snapshot(50, &[("late_night", 3)]);
        assert_ne!(
            fingerprint(InsightCategory::Behavioral, &before),
            fingerprint(InsightCategory::Behavioral, &after)
        );
    }

    #[test]
    fn test_pattern_change_changes_fingerprint() {
        let before = snapshot(40, &[("late_night", 3)]);
        let after = snapshot(40, &[("late_night", 4)]);
        assert_ne!(
            fingerprint(InsightCategory::Emotional, &before),
            fingerprint(InsightCategory::Emotional, &after)
        );
    }

    #[test]
    fn test_category_is_part_of_fingerprint() {
        let data = snapshot(40, &[("late_night", 3)]);
        assert_ne!(
            fingerprint(InsightCategory::Communication, &data),
            fingerprint(InsightCategory::Personality, &data)
        );
    }

    #[test]
    fn test_fingerprint_is_short_hex() {
        let data = snapshot(40, &[]);
        let fp = fingerprint(InsightCategory::Growth, &data);
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
