use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Epoch milliseconds, the timestamp unit used throughout the store.
pub type Millis = i64;

pub fn now_millis() -> Millis {
    chrono::Utc::now().timestamp_millis()
}

/// Author-declared eventual chapter count.
///
/// Serialized as the integer itself, or as the `"?"` sentinel when the work is
/// ongoing with no announced end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TotalChapters {
    Known(u32),
    Unknown,
}

impl TotalChapters {
    pub fn known(self) -> Option<u32> {
        match self {
            Self::Known(n) => Some(n),
            Self::Unknown => None,
        }
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw == "?" {
            return Ok(Self::Unknown);
        }
        let n: u32 = raw
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid chapter total: {raw:?} (expected a number or '?')"))?;
        Ok(Self::Known(n))
    }
}

impl fmt::Display for TotalChapters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(n) => write!(f, "{n}"),
            Self::Unknown => f.write_str("?"),
        }
    }
}

impl Serialize for TotalChapters {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Known(n) => serializer.serialize_u32(*n),
            Self::Unknown => serializer.serialize_str("?"),
        }
    }
}

impl<'de> Deserialize<'de> for TotalChapters {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u32),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Self::Known(n)),
            Raw::Text(text) => Self::parse(&text).map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterState {
    pub chapter_id: String,
    pub percent_read: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_visible_paragraph_index: Option<u32>,
}

impl ChapterState {
    pub fn is_read(&self) -> bool {
        self.percent_read == 100
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterMetadata {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_date: Option<String>,
}

/// One tracked work and its per-chapter progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub chapters: BTreeMap<u32, ChapterState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_chapters: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chapters: Option<TotalChapters>,
    #[serde(default)]
    pub is_work_in_progress: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<Millis>,
    #[serde(default)]
    pub last_updated: Millis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Millis>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub chapter_metadata: BTreeMap<String, ChapterMetadata>,
}

impl WorkRecord {
    pub fn new(id: impl Into<String>, title: Option<&str>) -> Self {
        let id = id.into();
        let title = match title {
            Some(title) if !title.trim().is_empty() => title.to_owned(),
            _ => default_title(&id),
        };
        Self {
            id,
            title,
            chapters: BTreeMap::new(),
            available_chapters: None,
            total_chapters: None,
            is_work_in_progress: false,
            last_checked: None,
            last_updated: now_millis(),
            completed_at: None,
            chapter_metadata: BTreeMap::new(),
        }
    }

    /// Replaces the title when `title` is non-empty and differs. Returns true on change.
    pub fn apply_title(&mut self, title: Option<&str>) -> bool {
        match title.map(str::trim) {
            Some(title) if !title.is_empty() && title != self.title => {
                self.title = title.to_owned();
                true
            }
            _ => false,
        }
    }

    /// Keeps `is_work_in_progress` in step with the declared total.
    pub fn set_total_chapters(&mut self, total: TotalChapters) {
        self.total_chapters = Some(total);
        self.is_work_in_progress = matches!(total, TotalChapters::Unknown);
    }

    pub fn read_chapter_count(&self) -> u32 {
        self.chapters.values().filter(|ch| ch.is_read()).count() as u32
    }

    pub fn tracked_chapter_count(&self) -> u32 {
        self.chapters.len() as u32
    }

    /// `availableChapters`, falling back to the number of tracked chapters.
    pub fn effective_available_chapters(&self) -> u32 {
        self.available_chapters
            .unwrap_or_else(|| self.tracked_chapter_count())
    }

    /// Whether the record may live in the completed cache.
    pub fn is_eligible_for_completion(&self) -> bool {
        if self.chapters.is_empty() || !self.chapters.values().all(ChapterState::is_read) {
            return false;
        }
        if self.is_work_in_progress {
            return false;
        }
        let Some(TotalChapters::Known(total)) = self.total_chapters else {
            return false;
        };
        if total == 0 {
            return false;
        }
        match self.available_chapters {
            Some(available) if available > 0 => self.tracked_chapter_count() >= available,
            _ => false,
        }
    }
}

pub fn default_title(id: &str) -> String {
    format!("Work {id}")
}

pub fn placeholder_chapter_id(chapter_number: u32) -> String {
    format!("unknown-{chapter_number}")
}

/// Rounds to the nearest integer and clamps into `[0, 100]`.
pub fn clamp_percent(percent: f64) -> u8 {
    if percent.is_nan() {
        return 0;
    }
    percent.round().clamp(0.0, 100.0) as u8
}

/// Chapter position reported alongside a progress update, e.g. `9/?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChapterInfo {
    pub current: Option<u32>,
    pub total: Option<TotalChapters>,
}
