//! Snapshot naming (spec §6) and the `org.freenas:*` user properties
//! carried on every snapshot this engine creates.

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub const PROP_UUID: &str = "org.freenas:uuid";
pub const PROP_REPLICATE: &str = "org.freenas:replicate";
pub const PROP_LIFETIME: &str = "org.freenas:lifetime";
pub const PROP_CALENDAR_TASK: &str = "org.freenas:calendar_task";

const TIMESTAMP_FORMAT: &str = "%Y%m%d.%H%M";

/// User properties stamped onto a snapshot created by this engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotProperties {
    pub uuid: String,
    pub replicable: bool,
    pub lifetime_secs: u64,
    pub calendar_task: Option<String>,
}

impl SnapshotProperties {
    pub fn new(replicable: bool, lifetime_secs: u64, calendar_task: Option<String>) -> Self {
        SnapshotProperties {
            uuid: Uuid::new_v4().to_string(),
            replicable,
            lifetime_secs,
            calendar_task,
        }
    }

    /// Renders as the `name=value` pairs `zfs set`/`zfs create_snapshot`
    /// expect, in a stable order.
    pub fn as_zfs_properties(&self) -> Vec<(String, String)> {
        let mut props = vec![
            (PROP_UUID.to_string(), self.uuid.clone()),
            (
                PROP_REPLICATE.to_string(),
                if self.replicable { "yes" } else { "no" }.to_string(),
            ),
            (PROP_LIFETIME.to_string(), self.lifetime_secs.to_string()),
        ];
        if let Some(task) = &self.calendar_task {
            props.push((PROP_CALENDAR_TASK.to_string(), task.clone()));
        }
        props
    }
}

/// Formats the base (collision-free) snapshot name: `<prefix>-YYYYMMDD.HHMM`.
pub fn format_snapshot_name(prefix: &str, at: DateTime<Utc>) -> String {
    format!("{prefix}-{}", at.format(TIMESTAMP_FORMAT))
}

/// Picks a snapshot name that doesn't collide with an existing one,
/// trying the bare timestamp first and then `-1` through `-99`.
///
/// `exists` is a caller-supplied predicate (backed by a `zfs list` query
/// in production, an in-memory set in tests) so this function stays pure
/// with respect to I/O scheduling.
pub fn next_available_name(
    prefix: &str,
    at: DateTime<Utc>,
    exists: impl Fn(&str) -> bool,
) -> Option<String> {
    let base = format_snapshot_name(prefix, at);
    if !exists(&base) {
        return Some(base);
    }

    for i in 1..=99 {
        let candidate = format!("{base}-{i}");
        if !exists(&candidate) {
            return Some(candidate);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn formats_without_seconds() {
        let name = format_snapshot_name("auto", at(2026, 7, 28, 4, 6));
        assert_eq!(name, "auto-20260728.0406");
    }

    #[test]
    fn no_collision_returns_base_name() {
        let name = next_available_name("auto", at(2026, 7, 28, 4, 6), |_| false);
        assert_eq!(name, Some("auto-20260728.0406".to_string()));
    }

    #[test]
    fn collision_appends_suffix() {
        let taken = ["auto-20260728.0406", "auto-20260728.0406-1"];
        let name = next_available_name("auto", at(2026, 7, 28, 4, 6), |n| taken.contains(&n));
        assert_eq!(name, Some("auto-20260728.0406-2".to_string()));
    }

    #[test]
    fn exhausted_suffixes_returns_none() {
        let base = "auto-20260728.0406".to_string();
        let mut taken = vec![base.clone()];
        for i in 1..=99 {
            taken.push(format!("{base}-{i}"));
        }
        let name = next_available_name("auto", at(2026, 7, 28, 4, 6), |n| taken.contains(&n.to_string()));
        assert_eq!(name, None);
    }

    #[test]
    fn properties_render_in_stable_order() {
        let props = SnapshotProperties {
            uuid: "abc".into(),
            replicable: true,
            lifetime_secs: 3600,
            calendar_task: Some("nightly".into()),
        };
        let rendered = props.as_zfs_properties();
        assert_eq!(
            rendered,
            vec![
                (PROP_UUID.to_string(), "abc".to_string()),
                (PROP_REPLICATE.to_string(), "yes".to_string()),
                (PROP_LIFETIME.to_string(), "3600".to_string()),
                (PROP_CALENDAR_TASK.to_string(), "nightly".to_string()),
            ]
        );
    }
}
