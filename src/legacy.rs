//! Decoding and encoding of the single-stream record format written by older
//! releases, plus the pipe-delimited completed-works format.
//!
//! Legacy lines look like:
//!
//! ```text
//! {"wid":"123","title":"Test","chapters":{"1":{"cid":"c1","p":100}},"isWIP":true}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{
    ChapterState, Millis, TotalChapters, WorkRecord, clamp_percent, default_title,
    placeholder_chapter_id,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyChapter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    #[serde(default)]
    pub p: f64,
    #[serde(
        default,
        rename = "lastParagraph",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_paragraph: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub wid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub chapters: BTreeMap<String, LegacyChapter>,
    /// `"?"` when the page had no chapter stats; read as absent.
    #[serde(
        default,
        deserialize_with = "lenient_count",
        skip_serializing_if = "Option::is_none"
    )]
    pub available_chapters: Option<u32>,
    /// A number, `"?"`, or `null` for an ongoing work. `None` only when absent.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub total_chapters: Option<Value>,
    #[serde(default, rename = "isWIP", skip_serializing_if = "Option::is_none")]
    pub is_wip: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<Millis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<Millis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Millis>,
}

fn string_or_number<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "work id must be a string or number, got {other}"
        ))),
    }
}

/// Keeps an explicit `null` distinct from a missing field.
fn present<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

fn lenient_count<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<u32>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    let count = match &value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    Ok(count.and_then(|n| u32::try_from(n).ok()))
}

impl LegacyRecord {
    pub fn into_record(self) -> anyhow::Result<WorkRecord> {
        if self.wid.trim().is_empty() {
            anyhow::bail!("legacy record has an empty work id");
        }

        let mut chapters = BTreeMap::new();
        for (number, chapter) in self.chapters {
            let Some(number) = number.trim().parse::<u32>().ok().filter(|n| *n > 0) else {
                tracing::warn!(work_id = %self.wid, chapter = %number, "skipping legacy chapter with invalid number");
                continue;
            };
            chapters.insert(
                number,
                ChapterState {
                    chapter_id: chapter
                        .cid
                        .filter(|cid| !cid.is_empty())
                        .unwrap_or_else(|| placeholder_chapter_id(number)),
                    percent_read: clamp_percent(chapter.p),
                    last_visible_paragraph_index: chapter
                        .last_paragraph
                        .filter(|idx| idx.is_finite() && *idx >= 0.0)
                        .map(|idx| idx as u32),
                },
            );
        }

        let total_chapters = match self.total_chapters {
            None => None,
            Some(Value::Null) => Some(TotalChapters::Unknown),
            Some(Value::Number(n)) => match n.as_u64() {
                Some(0) | None => Some(TotalChapters::Unknown),
                Some(n) => Some(TotalChapters::Known(u32::try_from(n)?)),
            },
            Some(Value::String(s)) => Some(TotalChapters::parse(&s)?),
            Some(other) => anyhow::bail!("unsupported legacy chapter total: {other}"),
        };
        let is_work_in_progress = self
            .is_wip
            .unwrap_or(matches!(total_chapters, Some(TotalChapters::Unknown)));
        let tracked = chapters.len() as u32;

        Ok(WorkRecord {
            title: self
                .title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| default_title(&self.wid)),
            id: self.wid,
            chapters,
            available_chapters: Some(self.available_chapters.unwrap_or(tracked)),
            total_chapters,
            is_work_in_progress,
            last_checked: self.last_checked,
            last_updated: self.last_updated.unwrap_or_default(),
            completed_at: self.completed_at,
            chapter_metadata: BTreeMap::new(),
        })
    }

    pub fn from_record(record: &WorkRecord) -> Self {
        Self {
            wid: record.id.clone(),
            title: Some(record.title.clone()),
            chapters: record
                .chapters
                .iter()
                .map(|(number, chapter)| {
                    (
                        number.to_string(),
                        LegacyChapter {
                            cid: Some(chapter.chapter_id.clone()),
                            p: f64::from(chapter.percent_read),
                            last_paragraph: chapter.last_visible_paragraph_index.map(f64::from),
                        },
                    )
                })
                .collect(),
            available_chapters: record.available_chapters,
            total_chapters: record.total_chapters.map(|total| match total {
                TotalChapters::Known(n) => Value::from(n),
                TotalChapters::Unknown => Value::from("?"),
            }),
            is_wip: Some(record.is_work_in_progress),
            last_updated: Some(record.last_updated),
            last_checked: record.last_checked,
            completed_at: record.completed_at,
        }
    }
}

/// Decodes the `wid|title|chapterCount|completedAt` entries joined by `;`.
///
/// Entries without a work id are dropped; entries with an unparseable count or
/// date are skipped and logged.
pub fn decode_pipe_completed(raw: &str) -> Vec<WorkRecord> {
    let mut works = Vec::new();
    for entry in raw.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let mut fields = entry.split('|');
        let wid = fields.next().unwrap_or_default().trim();
        if wid.is_empty() {
            continue;
        }
        let title = fields.next().unwrap_or_default();
        let count = fields.next().unwrap_or_default().trim().parse::<u32>();
        let completed_at = fields.next().unwrap_or_default().trim().parse::<Millis>();
        let (Ok(count), Ok(completed_at)) = (count, completed_at) else {
            tracing::warn!(work_id = wid, "skipping malformed legacy completed entry");
            continue;
        };

        let mut work = WorkRecord::new(wid, Some(title));
        for number in 1..=count {
            work.chapters.insert(
                number,
                ChapterState {
                    chapter_id: placeholder_chapter_id(number),
                    percent_read: 100,
                    last_visible_paragraph_index: None,
                },
            );
        }
        work.available_chapters = Some(count);
        work.set_total_chapters(TotalChapters::Known(count));
        work.completed_at = Some(completed_at);
        work.last_updated = completed_at;
        works.push(work);
    }
    works
}
