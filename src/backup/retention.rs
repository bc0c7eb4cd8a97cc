//! Age-tiered retention for one (component, data type) series.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::DataBackup;
use crate::config::BackupConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionTier {
    /// Younger than an hour
    Realtime,
    /// Younger than a day
    Hourly,
    /// Younger than the retention window
    Daily,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub realtime_limit: usize,
    pub hourly_limit: usize,
    pub retention_days: u32,
}

impl RetentionPolicy {
    pub fn from_config(config: &BackupConfig) -> Self {
        Self {
            realtime_limit: config.realtime_limit,
            hourly_limit: config.hourly_limit,
            retention_days: config.retention_days,
        }
    }

    pub fn tier(&self, taken: DateTime<Utc>, now: DateTime<Utc>) -> RetentionTier {
        let age = now - taken;
        if age < Duration::hours(1) {
            RetentionTier::Realtime
        } else if age < Duration::hours(24) {
            RetentionTier::Hourly
        } else if age < Duration::days(i64::from(self.retention_days)) {
            RetentionTier::Daily
        } else {
            RetentionTier::Expired
        }
    }

    /// Ids to evict from one series, oldest first.
    ///
    /// Realtime backups are capped by count. Hourly and daily backups are
    /// thinned to the newest one per clock hour and per UTC day, capped at
    /// `hourly_limit` hours and `retention_days` days. The newest restorable
    /// backup is always kept, as is every ancestor of a kept incremental or
    /// differential backup.
    pub fn evictions(&self, series: &[DataBackup], now: DateTime<Utc>) -> Vec<String> {
        let mut ordered: Vec<&DataBackup> = series.iter().collect();
        ordered.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let mut realtime = 0usize;
        let mut hours: HashSet<i64> = HashSet::new();
        let mut days: HashSet<NaiveDate> = HashSet::new();
        let mut keep: HashSet<&str> = HashSet::new();
        for backup in &ordered {
            let kept = match self.tier(backup.timestamp, now) {
                RetentionTier::Realtime => {
                    realtime += 1;
                    realtime <= self.realtime_limit
                }
                RetentionTier::Hourly => {
                    let hour = backup.timestamp.timestamp().div_euclid(3600);
                    hours.len() < self.hourly_limit && hours.insert(hour)
                }
                RetentionTier::Daily => {
                    let day = backup.timestamp.date_naive();
                    days.len() < self.retention_days as usize && days.insert(day)
                }
                RetentionTier::Expired => false,
            };
            if kept {
                keep.insert(backup.id.as_str());
            }
        }

        if let Some(newest) = ordered.iter().find(|b| b.restorable) {
            keep.insert(newest.id.as_str());
        }

        let by_id: HashMap<&str, &DataBackup> =
            series.iter().map(|b| (b.id.as_str(), b)).collect();
        let mut frontier: Vec<&str> = keep.iter().copied().collect();
        while let Some(id) = frontier.pop() {
            let parent = by_id.get(id).and_then(|b| b.parent_id.as_deref());
            if let Some(parent) = parent {
                if by_id.contains_key(parent) && keep.insert(parent) {
                    frontier.push(parent);
                }
            }
        }

        ordered
            .iter()
            .rev()
            .filter(|b| !keep.contains(b.id.as_str()))
            .map(|b| b.id.clone())
            .collect()
    }
}
