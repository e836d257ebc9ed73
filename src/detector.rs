// ABOUTME: Change detector - decides whether an extracted record is emitted or suppressed
// ABOUTME: Compares against the last accepted snapshot by watched fields or by full record

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::cache::SnapshotCache;
use crate::record::Record;

/// Set of field names whose changes are worth emitting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedFields(BTreeSet<String>);

impl WatchedFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(fields.into_iter().map(Into::into).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Decide whether `curr` must be emitted given the previously accepted `prev`.
///
/// - no predecessor: emit (first sighting)
/// - empty watch-list: emit (no selective filtering configured)
/// - otherwise emit as soon as one watched field differs; suppress only when all
///   watched fields are equal
///
/// A watched field that neither record carries counts as changed, so a typo in the
/// watch-list degrades to "always emit" instead of silently suppressing rows.
pub fn should_emit(prev: Option<&Record>, curr: &Record, watched: &WatchedFields) -> bool {
    let Some(prev) = prev else {
        return true;
    };
    if watched.is_empty() {
        return true;
    }

    watched.iter().any(|field| match (prev.field(field), curr.field(field)) {
        (Some(before), Some(after)) => !before.same_value(after),
        _ => true,
    })
}

/// How a pipeline decides "same data".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeCriteria {
    /// Compare the listed fields only; an empty list emits every row.
    Fields(WatchedFields),
    /// Structural equality over every field.
    FullRecord,
}

/// Change detector bound to one pipeline's comparison policy.
#[derive(Debug)]
pub struct ChangeDetector {
    criteria: ChangeCriteria,
    /// Whether the entity's own reported time is part of "same data"
    compare_event_time: bool,
    warned_unknown_fields: AtomicBool,
}

impl ChangeDetector {
    pub fn new(criteria: ChangeCriteria, compare_event_time: bool) -> Self {
        Self {
            criteria,
            compare_event_time,
            warned_unknown_fields: AtomicBool::new(false),
        }
    }

    pub fn watching(fields: WatchedFields, compare_event_time: bool) -> Self {
        Self::new(ChangeCriteria::Fields(fields), compare_event_time)
    }

    pub fn criteria(&self) -> &ChangeCriteria {
        &self.criteria
    }

    pub fn should_emit(&self, prev: Option<&Record>, curr: &Record) -> bool {
        let Some(prev_record) = prev else {
            return true;
        };

        match &self.criteria {
            ChangeCriteria::FullRecord => !prev_record.same_as(curr, self.compare_event_time),
            ChangeCriteria::Fields(watched) => {
                if watched.is_empty() {
                    return true;
                }
                self.warn_unknown_fields(prev_record, curr, watched);
                if self.compare_event_time && prev_record.event_time != curr.event_time {
                    return true;
                }
                should_emit(prev, curr, watched)
            }
        }
    }

    /// Consult the snapshot cache for `curr`.
    ///
    /// Does not write the cache; call [`ChangeDetector::accept`] once the record
    /// has actually been loaded.
    pub async fn evaluate(&self, snapshots: &SnapshotCache, curr: &Record) -> Result<bool> {
        let prev = snapshots.get(&curr.entity_id).await?;
        Ok(self.should_emit(prev.as_ref(), curr))
    }

    /// Record `curr` as the last accepted state of its entity.
    pub async fn accept(&self, snapshots: &SnapshotCache, curr: &Record) -> Result<()> {
        snapshots.put(curr).await
    }

    fn warn_unknown_fields(&self, prev: &Record, curr: &Record, watched: &WatchedFields) {
        if self.warned_unknown_fields.load(Ordering::Relaxed) {
            return;
        }
        let unknown: Vec<&str> = watched
            .iter()
            .filter(|field| prev.field(field).is_none() && curr.field(field).is_none())
            .collect();
        if !unknown.is_empty() && !self.warned_unknown_fields.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                "Watched fields {:?} are not present on records; every row will be emitted",
                unknown
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::record::FieldValue;
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use std::sync::Arc;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn robot(secs: i64, x: &str, battery: i64) -> Record {
        Record::new("robot-1", ts(secs))
            .with_field("x", FieldValue::Decimal(Decimal::from_str(x).unwrap()))
            .with_field("battery", battery)
            .with_field("status", "IDLE")
    }

    #[test]
    fn test_first_sighting_always_emits() {
        let watched = WatchedFields::new(["x"]);
        assert!(should_emit(None, &robot(1, "1.0", 50), &watched));
    }

    #[test]
    fn test_empty_watch_list_always_emits() {
        let prev = robot(1, "1.0", 50);
        assert!(should_emit(Some(&prev), &prev.clone(), &WatchedFields::default()));
    }

    #[test]
    fn test_watched_field_change_emits() {
        let watched = WatchedFields::new(["x", "battery"]);
        let prev = robot(1, "1.0", 50);
        assert!(should_emit(Some(&prev), &robot(2, "1.0", 49), &watched));
        assert!(should_emit(Some(&prev), &robot(2, "1.01", 50), &watched));
    }

    #[test]
    fn test_unwatched_field_change_is_suppressed() {
        let watched = WatchedFields::new(["x"]);
        let prev = robot(1, "1.0", 50);
        let curr = robot(2, "1.00", 10).with_field("status", "BUSY");
        assert!(!should_emit(Some(&prev), &curr, &watched));
    }

    #[test]
    fn test_unknown_watched_field_degrades_to_emit() {
        let watched = WatchedFields::new(["batery"]);
        let prev = robot(1, "1.0", 50);
        assert!(should_emit(Some(&prev), &prev.clone(), &watched));
    }

    #[test]
    fn test_detector_compare_event_time() {
        let prev = robot(1, "1.0", 50);
        let curr = robot(2, "1.0", 50);

        let ignoring_time = ChangeDetector::watching(WatchedFields::new(["x"]), false);
        assert!(!ignoring_time.should_emit(Some(&prev), &curr));

        let with_time = ChangeDetector::watching(WatchedFields::new(["x"]), true);
        assert!(with_time.should_emit(Some(&prev), &curr));
    }

    #[test]
    fn test_full_record_criteria_matches_structural_equality() {
        let detector = ChangeDetector::new(ChangeCriteria::FullRecord, true);
        let cases = [
            (robot(1, "1.0", 50), robot(1, "1.0", 50)),
            (robot(1, "1.0", 50), robot(1, "1.00", 50)),
            (robot(1, "1.0", 50), robot(2, "1.0", 50)),
            (robot(1, "1.0", 50), robot(1, "1.0", 51)),
            (robot(1, "1.0", 50), robot(1, "1.0", 50).with_field("extra", true)),
        ];

        for (prev, curr) in cases {
            assert_eq!(
                detector.should_emit(Some(&prev), &curr),
                !prev.same_as(&curr, true),
                "prev={:?} curr={:?}",
                prev,
                curr
            );
        }
    }

    #[tokio::test]
    async fn test_second_evaluation_after_accept_is_suppressed() {
        let cache = Arc::new(MemoryCache::new());
        let snapshots = SnapshotCache::new(cache, "wsync", "robot", "robot-status");
        let detector = ChangeDetector::watching(WatchedFields::new(["x", "battery"]), false);
        let curr = robot(5, "3.25", 70);

        assert!(detector.evaluate(&snapshots, &curr).await.unwrap());
        detector.accept(&snapshots, &curr).await.unwrap();
        assert!(!detector.evaluate(&snapshots, &curr).await.unwrap());
    }

    #[tokio::test]
    async fn test_suppressed_records_do_not_overwrite_snapshot() {
        let cache = Arc::new(MemoryCache::new());
        let snapshots = SnapshotCache::new(cache, "wsync", "robot", "robot-status");
        let detector = ChangeDetector::watching(WatchedFields::new(["x"]), false);

        let accepted = robot(1, "1.0", 50);
        detector.accept(&snapshots, &accepted).await.unwrap();

        // A run of no-op polls must not move the stored state
        for secs in 2..5 {
            let noop = robot(secs, "1.0", 50 - secs);
            assert!(!detector.evaluate(&snapshots, &noop).await.unwrap());
        }
        assert_eq!(snapshots.get("robot-1").await.unwrap(), Some(accepted));
    }
}
