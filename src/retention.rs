//! Retention policy evaluation: time-bucket classification of backups and
//! selection of the backups a policy would delete.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{Datelike, Timelike};

use crate::storage::{Backup, StorageLocation};

/// Retention class of a backup, ordered finest to coarsest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeBucket {
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl TimeBucket {
    /// Classification pass order: coarsest first.
    pub const COARSEST_FIRST: [TimeBucket; 6] = [
        TimeBucket::Yearly,
        TimeBucket::Monthly,
        TimeBucket::Weekly,
        TimeBucket::Daily,
        TimeBucket::Hourly,
        TimeBucket::Minutely,
    ];

    /// The label carried in backup filenames.
    pub fn label(&self) -> &'static str {
        match self {
            TimeBucket::Minutely => "minutely",
            TimeBucket::Hourly => "hourly",
            TimeBucket::Daily => "daily",
            TimeBucket::Weekly => "weekly",
            TimeBucket::Monthly => "monthly",
            TimeBucket::Yearly => "yearly",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "minutely" => Some(TimeBucket::Minutely),
            "hourly" => Some(TimeBucket::Hourly),
            "daily" => Some(TimeBucket::Daily),
            "weekly" => Some(TimeBucket::Weekly),
            "monthly" => Some(TimeBucket::Monthly),
            "yearly" => Some(TimeBucket::Yearly),
            _ => None,
        }
    }
}

impl fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The active retention policy, derived once per run from configuration.
#[derive(Debug, Clone)]
pub enum RetentionPolicy {
    /// No pruning at all.
    KeepAll,
    /// Keep the newest `n` backups per storage location.
    CountBased(usize),
    /// Keep the newest `n` backups per time bucket; buckets without an entry
    /// keep nothing.
    TimeBased(BTreeMap<TimeBucket, usize>),
}

/// Calendar period a backup falls into for a given bucket. Only compared
/// against keys of the same bucket within one classification pass.
fn period_key(backup: &Backup, bucket: TimeBucket) -> (i32, u32, u32, u32, u32) {
    let ts = &backup.timestamp;
    match bucket {
        TimeBucket::Yearly => (ts.year(), 0, 0, 0, 0),
        TimeBucket::Monthly => (ts.year(), ts.month(), 0, 0, 0),
        TimeBucket::Weekly => (ts.iso_week().year(), ts.iso_week().week(), 0, 0, 0),
        TimeBucket::Daily => (ts.year(), ts.month(), ts.day(), 0, 0),
        TimeBucket::Hourly => (ts.year(), ts.month(), ts.day(), ts.hour(), 0),
        TimeBucket::Minutely => (ts.year(), ts.month(), ts.day(), ts.hour(), ts.minute()),
    }
}

/// Assign every backup in an ascending-by-timestamp list to exactly one
/// bucket using the coarsest-unique rule: pass from yearly down to minutely,
/// classifying the most recent still-unassigned backup of each calendar
/// period; anything left after the minutely pass is minutely. The resulting
/// classes partition the input and each class keeps ascending order.
pub fn backups_by_time_unit(backups: &[Backup]) -> BTreeMap<TimeBucket, Vec<Backup>> {
    let mut assigned: Vec<Option<TimeBucket>> = vec![None; backups.len()];

    for bucket in TimeBucket::COARSEST_FIRST {
        let mut latest_per_period: BTreeMap<(i32, u32, u32, u32, u32), usize> = BTreeMap::new();
        for (index, backup) in backups.iter().enumerate() {
            if assigned[index].is_some() {
                continue;
            }
            let key = period_key(backup, bucket);
            match latest_per_period.get(&key) {
                Some(&current) if backups[current].timestamp >= backup.timestamp => {}
                _ => {
                    latest_per_period.insert(key, index);
                }
            }
        }
        for index in latest_per_period.into_values() {
            assigned[index] = Some(bucket);
        }
    }

    let mut classes: BTreeMap<TimeBucket, Vec<Backup>> = BTreeMap::new();
    for (index, backup) in backups.iter().enumerate() {
        let bucket = assigned[index].unwrap_or(TimeBucket::Minutely);
        classes.entry(bucket).or_default().push(backup.clone());
    }
    classes
}

/// Choose the backups a retention policy would delete from one location.
pub fn select_victims(location: &StorageLocation, policy: &RetentionPolicy) -> Vec<Backup> {
    match policy {
        RetentionPolicy::KeepAll => Vec::new(),
        RetentionPolicy::CountBased(max_keep) => {
            let mut newest_first: Vec<Backup> = location.backups.to_vec();
            newest_first.reverse();
            newest_first.into_iter().skip(*max_keep).collect()
        }
        RetentionPolicy::TimeBased(counts) => {
            let mut victims = Vec::new();
            for (bucket, mut backups) in backups_by_time_unit(&location.backups) {
                let max_keep = counts.get(&bucket).copied().unwrap_or(0);
                backups.reverse();
                victims.extend(backups.into_iter().skip(max_keep));
            }
            victims
        }
    }
}
