use std::collections::BTreeMap;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::legacy::{self, LegacyRecord};
use crate::model::{ChapterState, Millis, TotalChapters, WorkRecord, placeholder_chapter_id};

/// Discriminator written into every full-fidelity record.
pub const RECORD_FORMAT_VERSION: u32 = 2;
pub const COMPLETED_FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord<'a> {
    format_version: u32,
    #[serde(flatten)]
    record: &'a WorkRecord,
}

impl<'a> StoredRecord<'a> {
    pub fn new(record: &'a WorkRecord) -> Self {
        Self {
            format_version: RECORD_FORMAT_VERSION,
            record,
        }
    }
}

pub fn encode_record(record: &WorkRecord) -> anyhow::Result<String> {
    serde_json::to_string(&StoredRecord::new(record))
        .with_context(|| format!("serialize work {}", record.id))
}

/// Decodes one record, selecting the decoder by `formatVersion`.
/// Records without the field are the legacy single-stream shape.
pub fn decode_record(value: Value) -> anyhow::Result<WorkRecord> {
    let version = match value.get("formatVersion") {
        None => None,
        Some(v) => Some(
            v.as_u64()
                .ok_or_else(|| anyhow::anyhow!("formatVersion must be an integer, got {v}"))?,
        ),
    };
    match version {
        None => {
            let legacy: LegacyRecord =
                serde_json::from_value(value).context("parse legacy record")?;
            legacy.into_record()
        }
        Some(v) if v == u64::from(RECORD_FORMAT_VERSION) => {
            let mut record: WorkRecord =
                serde_json::from_value(value).context("parse record")?;
            if record.id.trim().is_empty() {
                anyhow::bail!("record has an empty work id");
            }
            if record.chapters.remove(&0).is_some() {
                tracing::warn!(work_id = %record.id, "dropping chapter 0");
            }
            Ok(record)
        }
        Some(other) => anyhow::bail!("unsupported record formatVersion: {other}"),
    }
}

pub fn decode_record_line(line: &str) -> anyhow::Result<WorkRecord> {
    let value: Value = serde_json::from_str(line).context("parse json line")?;
    decode_record(value)
}

pub fn encode_active<'a>(records: impl IntoIterator<Item = &'a WorkRecord>) -> anyhow::Result<String> {
    let lines = records
        .into_iter()
        .map(encode_record)
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(lines.join("\n"))
}

/// Decodes newline-delimited records, skipping (and logging) lines that fail.
pub fn decode_ndjson(blob: &str) -> Vec<WorkRecord> {
    blob.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .filter_map(|(index, line)| match decode_record_line(line) {
            Ok(record) => Some(record),
            Err(err) => {
                tracing::warn!(line = index + 1, ?err, "skipping malformed record");
                None
            }
        })
        .collect()
}

#[derive(Debug, Serialize, Deserialize)]
struct CompressedCompleted {
    version: u32,
    works: Vec<Value>,
}

/// Completed works keep only what cannot be derived: percent is always 100.
#[derive(Debug, Serialize, Deserialize)]
struct CompressedWork {
    w: String,
    #[serde(default)]
    t: String,
    c: u32,
    #[serde(default)]
    ch: BTreeMap<u32, String>,
    ca: Millis,
    /// Older writers omit this for works that were never updated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lu: Option<Millis>,
}

impl CompressedWork {
    fn from_record(record: &WorkRecord) -> Self {
        Self {
            w: record.id.clone(),
            t: record.title.clone(),
            c: record.tracked_chapter_count(),
            ch: record
                .chapters
                .iter()
                .map(|(number, chapter)| (*number, chapter.chapter_id.clone()))
                .collect(),
            ca: record.completed_at.unwrap_or(record.last_updated),
            lu: Some(record.last_updated),
        }
    }

    fn into_record(self) -> anyhow::Result<WorkRecord> {
        if self.w.trim().is_empty() {
            anyhow::bail!("compressed work has an empty id");
        }
        let mut ids = self.ch;
        ids.remove(&0);
        if ids.is_empty() {
            ids = (1..=self.c).map(|n| (n, String::new())).collect();
        }

        let mut work = WorkRecord::new(self.w, Some(self.t.as_str()));
        for (number, chapter_id) in ids {
            let chapter_id = if chapter_id.is_empty() {
                placeholder_chapter_id(number)
            } else {
                chapter_id
            };
            work.chapters.insert(
                number,
                ChapterState {
                    chapter_id,
                    percent_read: 100,
                    last_visible_paragraph_index: None,
                },
            );
        }
        let count = self.c.max(work.tracked_chapter_count());
        work.available_chapters = Some(count);
        work.set_total_chapters(TotalChapters::Known(count));
        work.completed_at = Some(self.ca);
        work.last_updated = self.lu.unwrap_or(self.ca);
        Ok(work)
    }
}

pub fn compress_completed<'a>(
    records: impl IntoIterator<Item = &'a WorkRecord>,
) -> anyhow::Result<String> {
    let works = records
        .into_iter()
        .map(|record| serde_json::to_value(CompressedWork::from_record(record)))
        .collect::<Result<Vec<_>, _>>()
        .context("serialize compressed work")?;
    serde_json::to_string(&CompressedCompleted {
        version: COMPLETED_FORMAT_VERSION,
        works,
    })
    .context("serialize completed works")
}

/// Accepts the versioned JSON structure or the legacy pipe-delimited string.
pub fn decompress_completed(blob: &str) -> Vec<WorkRecord> {
    let blob = blob.trim();
    if blob.is_empty() {
        return Vec::new();
    }

    let parsed = match serde_json::from_str::<Value>(blob) {
        Ok(value @ Value::Object(_)) => value,
        _ => return legacy::decode_pipe_completed(blob),
    };
    let compressed: CompressedCompleted = match serde_json::from_value(parsed) {
        Ok(compressed) => compressed,
        Err(err) => {
            tracing::warn!(?err, "completed works blob has an unexpected shape");
            return Vec::new();
        }
    };
    if compressed.version != COMPLETED_FORMAT_VERSION {
        tracing::warn!(
            version = compressed.version,
            "unsupported completed works version"
        );
        return Vec::new();
    }

    compressed
        .works
        .into_iter()
        .filter_map(|value| {
            match serde_json::from_value::<CompressedWork>(value)
                .context("parse compressed work")
                .and_then(CompressedWork::into_record)
            {
                Ok(record) => Some(record),
                Err(err) => {
                    tracing::warn!(?err, "skipping malformed completed work");
                    None
                }
            }
        })
        .collect()
}
