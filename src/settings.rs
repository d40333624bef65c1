use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::store::kv::{KvStore, SETTINGS_KEY};

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub auto_delete_completed: bool,
    /// `"immediate"` or e.g. `"7 days"`, `"2 weeks"`, `"1 month"`.
    pub deletion_timing: String,
    pub check_for_updates: bool,
    /// Hours between batch update checks.
    pub update_check_interval: u32,
    pub sync_with_bookmarks: bool,
    pub bookmark_tag_prefix: String,
    pub bookmark_private: bool,
    pub bookmark_auto_create: bool,
    pub sync_thresholds: Vec<u8>,
    pub rate_limit_delay_ms: u64,
    pub politeness_delay_ms: u64,
    pub flush_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_delete_completed: false,
            deletion_timing: "7 days".to_owned(),
            check_for_updates: true,
            update_check_interval: 24,
            sync_with_bookmarks: false,
            bookmark_tag_prefix: "Reading Progress:".to_owned(),
            bookmark_private: true,
            bookmark_auto_create: false,
            sync_thresholds: default_sync_thresholds(),
            rate_limit_delay_ms: 2_000,
            politeness_delay_ms: 5_000,
            flush_interval_ms: 5_000,
        }
    }
}

pub fn default_sync_thresholds() -> Vec<u8> {
    vec![5, 25, 50, 75, 100]
}

impl Settings {
    /// Loads stored settings, falling back to defaults when none are stored or
    /// the stored blob cannot be parsed.
    pub async fn load(kv: &dyn KvStore) -> anyhow::Result<Self> {
        let Some(raw) = kv.get(SETTINGS_KEY).await.context("read settings")? else {
            return Ok(Self::default());
        };
        match serde_json::from_str::<Self>(&raw) {
            Ok(settings) => Ok(settings.normalized()),
            Err(err) => {
                tracing::warn!(?err, "stored settings are malformed; using defaults");
                Ok(Self::default())
            }
        }
    }

    pub async fn save(&self, kv: &dyn KvStore) -> anyhow::Result<()> {
        let raw = serde_json::to_string_pretty(self).context("serialize settings")?;
        kv.set(SETTINGS_KEY, raw).await.context("write settings")
    }

    /// Sorts and de-duplicates the thresholds, clamping them into `[1, 100]`.
    pub fn normalized(mut self) -> Self {
        let mut thresholds: Vec<u8> = self
            .sync_thresholds
            .iter()
            .map(|t| (*t).clamp(1, 100))
            .collect();
        thresholds.sort_unstable();
        thresholds.dedup();
        if thresholds.is_empty() {
            thresholds = default_sync_thresholds();
        }
        self.sync_thresholds = thresholds;
        self
    }

    pub fn deletion_delay(&self) -> Duration {
        parse_deletion_delay(&self.deletion_timing)
    }

    pub fn update_check_period(&self) -> Duration {
        Duration::from_secs(u64::from(self.update_check_interval.max(1)) * 60 * 60)
    }

    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_millis(self.rate_limit_delay_ms)
    }

    pub fn politeness_delay(&self) -> Duration {
        Duration::from_millis(self.politeness_delay_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

/// Unparseable timings mean "no delay", the same as `"immediate"`.
pub fn parse_deletion_delay(timing: &str) -> Duration {
    let timing = timing.trim().to_ascii_lowercase();
    if timing == "immediate" {
        return Duration::ZERO;
    }

    let digits_end = timing
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(timing.len());
    let Ok(value) = timing[..digits_end].parse::<u64>() else {
        return Duration::ZERO;
    };
    let unit_ms = match timing[digits_end..].trim() {
        "day" | "days" => DAY_MS,
        "week" | "weeks" => 7 * DAY_MS,
        "month" | "months" => 30 * DAY_MS,
        _ => return Duration::ZERO,
    };
    Duration::from_millis(value.saturating_mul(unit_ms))
}
