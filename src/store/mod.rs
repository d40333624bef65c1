//! The progress store: two keyed caches (active and completed works) with
//! independent dirty flags, flushed to a [`KvStore`] on demand or on a timer.
//!
//! Every operation resolves a work through [`Caches::locate`] /
//! [`Caches::take`] and puts it back through [`Caches::place`], so a record
//! lives in exactly one cache and `completed_at` is set only in the completed
//! one.

pub mod codec;
pub mod kv;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};

use crate::legacy::LegacyRecord;
use crate::model::{
    ChapterInfo, ChapterState, Millis, WorkRecord, clamp_percent, now_millis,
    placeholder_chapter_id,
};
use crate::settings::Settings;
use crate::sync::{BookmarkSync, SyncError};
use kv::{ACTIVE_KEY, COMPLETED_KEY, KvStore};

const SNAPSHOT_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Active,
    Completed,
}

/// A scroll-driven progress report for one chapter.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub work_id: String,
    pub chapter_number: u32,
    pub chapter_id: String,
    pub percent: f64,
    pub title: Option<String>,
    pub last_paragraph: Option<u32>,
    pub chapter_info: Option<ChapterInfo>,
}

impl ProgressUpdate {
    pub fn new(
        work_id: impl Into<String>,
        chapter_number: u32,
        chapter_id: impl Into<String>,
        percent: f64,
    ) -> Self {
        Self {
            work_id: work_id.into(),
            chapter_number,
            chapter_id: chapter_id.into(),
            percent,
            title: None,
            last_paragraph: None,
            chapter_info: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub active_count: usize,
    pub completed_count: usize,
    pub total_count: usize,
    pub storage_bytes_active: usize,
    pub storage_bytes_completed: usize,
    pub completed_uncompressed_bytes: usize,
    pub compression_ratio: String,
    pub bytes_saved: i64,
}

#[derive(Debug, Default)]
struct Caches {
    active: BTreeMap<String, WorkRecord>,
    completed: BTreeMap<String, WorkRecord>,
    active_dirty: bool,
    completed_dirty: bool,
}

impl Caches {
    fn locate(&self, id: &str) -> Option<(Bucket, &WorkRecord)> {
        if let Some(work) = self.active.get(id) {
            return Some((Bucket::Active, work));
        }
        self.completed.get(id).map(|work| (Bucket::Completed, work))
    }

    fn locate_mut(&mut self, id: &str) -> Option<(Bucket, &mut WorkRecord)> {
        if let Some(work) = self.active.get_mut(id) {
            return Some((Bucket::Active, work));
        }
        self.completed
            .get_mut(id)
            .map(|work| (Bucket::Completed, work))
    }

    fn mark_dirty(&mut self, bucket: Bucket) {
        match bucket {
            Bucket::Active => self.active_dirty = true,
            Bucket::Completed => self.completed_dirty = true,
        }
    }

    /// Removes the work from whichever cache holds it.
    fn take(&mut self, id: &str) -> Option<(Bucket, WorkRecord)> {
        let (bucket, work) = if let Some(work) = self.active.remove(id) {
            (Bucket::Active, work)
        } else {
            (Bucket::Completed, self.completed.remove(id)?)
        };
        self.mark_dirty(bucket);
        Some((bucket, work))
    }

    fn place(&mut self, mut work: WorkRecord, bucket: Bucket) {
        self.take(&work.id);
        match bucket {
            Bucket::Active => {
                work.completed_at = None;
                self.active.insert(work.id.clone(), work);
            }
            Bucket::Completed => {
                if work.completed_at.is_none() {
                    work.completed_at = Some(now_millis());
                }
                self.completed.insert(work.id.clone(), work);
            }
        }
        self.mark_dirty(bucket);
    }

    /// Places the work according to completion eligibility.
    fn settle(&mut self, work: WorkRecord) -> Bucket {
        let bucket = if work.is_eligible_for_completion() {
            Bucket::Completed
        } else {
            Bucket::Active
        };
        self.place(work, bucket);
        bucket
    }

    fn all(&self) -> impl Iterator<Item = &WorkRecord> {
        self.active.values().chain(self.completed.values())
    }
}

pub struct ProgressStore {
    kv: Arc<dyn KvStore>,
    caches: Mutex<Caches>,
    // Serializes flushes so an older snapshot never overwrites a newer one.
    flush_lock: Mutex<()>,
    bookmark_sync: Option<Arc<BookmarkSync>>,
    background: Mutex<JoinSet<()>>,
}

impl ProgressStore {
    /// Reads both partitions. The store is ready once this returns.
    pub async fn load(kv: Arc<dyn KvStore>) -> anyhow::Result<Self> {
        let mut caches = Caches::default();

        if let Some(blob) = kv.get(ACTIVE_KEY).await.context("read active works")? {
            for work in codec::decode_ndjson(&blob) {
                caches.active.insert(work.id.clone(), work);
            }
        }
        if let Some(blob) = kv.get(COMPLETED_KEY).await.context("read completed works")? {
            for work in codec::decompress_completed(&blob) {
                if caches.active.contains_key(&work.id) {
                    tracing::warn!(work_id = %work.id, "work stored in both partitions; keeping the active copy");
                    caches.completed_dirty = true;
                    continue;
                }
                caches.completed.insert(work.id.clone(), work);
            }
        }
        for work in caches.active.values_mut() {
            if work.completed_at.take().is_some() {
                caches.active_dirty = true;
            }
        }

        tracing::info!(
            active = caches.active.len(),
            completed = caches.completed.len(),
            "progress store ready"
        );
        Ok(Self {
            kv,
            caches: Mutex::new(caches),
            flush_lock: Mutex::new(()),
            bookmark_sync: None,
            background: Mutex::new(JoinSet::new()),
        })
    }

    /// Progress updates will hand their result to `sync` without waiting on it.
    pub fn with_bookmark_sync(mut self, sync: Arc<BookmarkSync>) -> Self {
        self.bookmark_sync = Some(sync);
        self
    }

    pub async fn get_work(&self, id: &str) -> Option<WorkRecord> {
        self.caches
            .lock()
            .await
            .locate(id)
            .map(|(_, work)| work.clone())
    }

    pub async fn locate(&self, id: &str) -> Option<(Bucket, WorkRecord)> {
        self.caches
            .lock()
            .await
            .locate(id)
            .map(|(bucket, work)| (bucket, work.clone()))
    }

    pub async fn update_progress(&self, update: ProgressUpdate) -> anyhow::Result<Bucket> {
        if update.chapter_number == 0 {
            anyhow::bail!("chapter numbers start at 1");
        }
        let percent = clamp_percent(update.percent);

        let (bucket, snapshot) = {
            let mut caches = self.caches.lock().await;
            let mut work = match caches.take(&update.work_id) {
                Some((_, work)) => work,
                None => WorkRecord::new(update.work_id.clone(), update.title.as_deref()),
            };
            work.completed_at = None;
            work.apply_title(update.title.as_deref());

            if let Some(info) = update.chapter_info {
                if let Some(current) = info.current.filter(|n| *n > 0) {
                    work.available_chapters = Some(current);
                }
                if let Some(total) = info.total {
                    work.set_total_chapters(total);
                }
            }

            work.chapters.insert(
                update.chapter_number,
                ChapterState {
                    chapter_id: update.chapter_id.clone(),
                    percent_read: percent,
                    last_visible_paragraph_index: update.last_paragraph,
                },
            );
            work.last_updated = now_millis();

            let snapshot = work.clone();
            (caches.settle(work), snapshot)
        };

        if bucket == Bucket::Completed {
            tracing::info!(work_id = %snapshot.id, "work completed");
        }
        self.spawn_bookmark_sync(snapshot, update.chapter_number, percent)
            .await;
        Ok(bucket)
    }

    async fn spawn_bookmark_sync(&self, work: WorkRecord, chapter_number: u32, percent: u8) {
        let Some(sync) = self.bookmark_sync.as_ref().filter(|sync| sync.is_enabled()) else {
            return;
        };
        let sync = Arc::clone(sync);
        let mut background = self.background.lock().await;
        while background.try_join_next().is_some() {}
        background.spawn(async move {
            let outcome = sync
                .sync_if_due(&work, Some(chapter_number), Some(percent))
                .await;
            match outcome.error {
                None | Some(SyncError::NotAtSyncInterval) | Some(SyncError::Disabled) => {}
                Some(err) => {
                    tracing::warn!(work_id = %work.id, chapter = chapter_number, %err, "background bookmark sync failed");
                }
            }
        });
    }

    /// Waits for bookmark syncs started by [`Self::update_progress`].
    pub async fn wait_for_background_syncs(&self) {
        let mut background = self.background.lock().await;
        while let Some(result) = background.join_next().await {
            if let Err(err) = result {
                tracing::warn!(?err, "background bookmark sync task failed");
            }
        }
    }

    /// Direct edit path. Creates the chapter with a placeholder id when it is
    /// not tracked yet. Returns false if the work does not exist.
    pub async fn update_chapter_progress(&self, id: &str, chapter_number: u32, percent: f64) -> bool {
        if chapter_number == 0 {
            return false;
        }
        let percent = clamp_percent(percent);
        let mut caches = self.caches.lock().await;
        let Some((_, mut work)) = caches.take(id) else {
            return false;
        };

        work.chapters
            .entry(chapter_number)
            .and_modify(|chapter| chapter.percent_read = percent)
            .or_insert_with(|| ChapterState {
                chapter_id: placeholder_chapter_id(chapter_number),
                percent_read: percent,
                last_visible_paragraph_index: None,
            });
        work.completed_at = None;
        work.last_updated = now_millis();
        caches.settle(work);
        true
    }

    /// Sets every tracked chapter to `percent`. Marking read also fills in
    /// untracked chapters up to `available_chapters`.
    pub async fn set_all_chapters(&self, id: &str, percent: f64) -> bool {
        let percent = clamp_percent(percent);
        let mut caches = self.caches.lock().await;
        let Some((_, mut work)) = caches.take(id) else {
            return false;
        };

        for chapter in work.chapters.values_mut() {
            chapter.percent_read = percent;
        }
        if percent == 100 {
            for number in 1..=work.available_chapters.unwrap_or(0) {
                work.chapters.entry(number).or_insert_with(|| ChapterState {
                    chapter_id: placeholder_chapter_id(number),
                    percent_read: 100,
                    last_visible_paragraph_index: None,
                });
            }
        }
        work.completed_at = None;
        work.last_updated = now_millis();
        caches.settle(work);
        true
    }

    pub async fn mark_completed(&self, id: &str) -> bool {
        let mut caches = self.caches.lock().await;
        let Some((_, mut work)) = caches.take(id) else {
            return false;
        };

        for chapter in work.chapters.values_mut() {
            chapter.percent_read = 100;
            chapter.last_visible_paragraph_index = None;
        }
        let now = now_millis();
        work.completed_at = Some(now);
        work.last_updated = now;
        caches.place(work, Bucket::Completed);
        true
    }

    pub async fn delete_work(&self, id: &str) -> bool {
        let removed = self.caches.lock().await.take(id).is_some();
        if removed {
            if let Some(sync) = &self.bookmark_sync {
                if let Err(err) = sync.clear_synced_chapters(id).await {
                    tracing::warn!(work_id = id, ?err, "failed to clear sync state");
                }
            }
        }
        removed
    }

    pub async fn is_work_completed(&self, id: &str) -> bool {
        match self.caches.lock().await.locate(id) {
            Some((Bucket::Completed, _)) => true,
            Some((Bucket::Active, work)) => work.is_eligible_for_completion(),
            None => false,
        }
    }

    /// Applies `amend` to a stored work in place, for paths that never change
    /// read percentages. A completed work whose available chapter count grows
    /// beyond what is tracked moves back to the active cache.
    pub async fn amend_work<T>(
        &self,
        id: &str,
        amend: impl FnOnce(&mut WorkRecord) -> T,
    ) -> Option<T> {
        let mut caches = self.caches.lock().await;
        let (bucket, work) = caches.locate_mut(id)?;
        let available_before = work.effective_available_chapters();
        let eligible_before = work.is_eligible_for_completion();
        let in_progress_before = work.is_work_in_progress;
        let result = amend(work);
        // A manually completed work stays put unless the amendment itself
        // takes it further from completion.
        let grew = work.effective_available_chapters() > available_before
            && work.tracked_chapter_count() < work.effective_available_chapters();
        let reopened = bucket == Bucket::Completed
            && (grew
                || (eligible_before && !work.is_eligible_for_completion())
                || (!in_progress_before && work.is_work_in_progress));
        caches.mark_dirty(bucket);

        if reopened {
            if let Some((_, work)) = caches.take(id) {
                tracing::info!(work_id = id, "reopened a completed work");
                caches.place(work, Bucket::Active);
            }
        }
        Some(result)
    }

    /// All works, most recently updated first.
    pub async fn get_all_works(&self) -> Vec<WorkRecord> {
        let mut works: Vec<WorkRecord> = self.caches.lock().await.all().cloned().collect();
        works.sort_by(|a, b| {
            b.last_updated
                .cmp(&a.last_updated)
                .then_with(|| a.id.cmp(&b.id))
        });
        works
    }

    pub async fn get_stats(&self) -> anyhow::Result<StoreStats> {
        let caches = self.caches.lock().await;

        let mut storage_bytes_active = 0;
        for work in caches.active.values() {
            storage_bytes_active += codec::encode_record(work)?.len();
        }
        let mut completed_uncompressed_bytes = 0;
        for work in caches.completed.values() {
            completed_uncompressed_bytes += codec::encode_record(work)?.len();
        }
        let storage_bytes_completed = if caches.completed.is_empty() {
            0
        } else {
            codec::compress_completed(caches.completed.values())?.len()
        };

        let compression_ratio = if completed_uncompressed_bytes > 0 {
            let ratio = 1.0 - storage_bytes_completed as f64 / completed_uncompressed_bytes as f64;
            format!("{:.1}%", ratio * 100.0)
        } else {
            "0%".to_owned()
        };

        Ok(StoreStats {
            active_count: caches.active.len(),
            completed_count: caches.completed.len(),
            total_count: caches.active.len() + caches.completed.len(),
            storage_bytes_active,
            storage_bytes_completed,
            completed_uncompressed_bytes,
            compression_ratio,
            bytes_saved: completed_uncompressed_bytes as i64 - storage_bytes_completed as i64,
        })
    }

    /// Persists whichever partitions are dirty. A mutation landing while the
    /// write is in flight leaves its partition dirty for the next flush.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let _flushing = self.flush_lock.lock().await;

        let (active, completed) = {
            let mut caches = self.caches.lock().await;
            let active = if caches.active_dirty {
                let blob = codec::encode_active(caches.active.values())?;
                caches.active_dirty = false;
                Some(blob)
            } else {
                None
            };
            let completed = if caches.completed_dirty {
                let blob = codec::compress_completed(caches.completed.values())?;
                caches.completed_dirty = false;
                Some(blob)
            } else {
                None
            };
            (active, completed)
        };
        if active.is_none() && completed.is_none() {
            return Ok(());
        }

        let mut result = Ok(());
        if let Some(blob) = active {
            if let Err(err) = self.kv.set(ACTIVE_KEY, blob).await {
                self.caches.lock().await.active_dirty = true;
                result = Err(err.context("write active works"));
            }
        }
        if let Some(blob) = completed {
            if let Err(err) = self.kv.set(COMPLETED_KEY, blob).await {
                self.caches.lock().await.completed_dirty = true;
                if result.is_ok() {
                    result = Err(err.context("write completed works"));
                }
            }
        }
        if result.is_ok() {
            tracing::debug!("flushed progress store");
        }
        result
    }

    /// Flushes every `interval` until the returned task is aborted.
    pub fn spawn_auto_flush(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = store.flush().await {
                    tracing::error!(?err, "auto flush failed");
                }
            }
        })
    }

    /// Deletes completed works older than the configured retention delay.
    pub async fn cleanup_completed(&self, settings: &Settings) -> anyhow::Result<usize> {
        if !settings.auto_delete_completed {
            return Ok(0);
        }
        let delay = i64::try_from(settings.deletion_delay().as_millis()).unwrap_or(i64::MAX);
        let now = now_millis();

        let expired: Vec<String> = {
            let mut caches = self.caches.lock().await;
            let expired: Vec<String> = caches
                .completed
                .values()
                .filter(|work| {
                    work.completed_at
                        .is_some_and(|at| now.saturating_sub(at) > delay)
                })
                .map(|work| work.id.clone())
                .collect();
            for id in &expired {
                caches.take(id);
            }
            expired
        };

        if !expired.is_empty() {
            tracing::info!(cleaned = expired.len(), "deleted expired completed works");
            self.flush().await?;
        }
        Ok(expired.len())
    }

    pub async fn export_snapshot(&self) -> anyhow::Result<String> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Snapshot<'a> {
            version: u32,
            export_date: String,
            stats: StoreStats,
            active: Vec<codec::StoredRecord<'a>>,
            completed: Vec<codec::StoredRecord<'a>>,
        }

        let stats = self.get_stats().await?;
        let caches = self.caches.lock().await;
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            export_date: chrono::Utc::now().to_rfc3339(),
            stats,
            active: caches.active.values().map(codec::StoredRecord::new).collect(),
            completed: caches
                .completed
                .values()
                .map(codec::StoredRecord::new)
                .collect(),
        };
        serde_json::to_string_pretty(&snapshot).context("serialize snapshot")
    }

    /// Every work as one legacy single-stream line.
    pub async fn export_legacy_ndjson(&self) -> anyhow::Result<String> {
        let caches = self.caches.lock().await;
        let lines = caches
            .all()
            .map(|work| serde_json::to_string(&LegacyRecord::from_record(work)))
            .collect::<Result<Vec<_>, _>>()
            .context("serialize legacy record")?;
        Ok(lines.join("\n"))
    }

    /// Merges a snapshot (or legacy NDJSON) by id, then flushes. Records that
    /// fail to decode are skipped. Returns the number of records imported.
    pub async fn import_snapshot(&self, data: &str) -> anyhow::Result<usize> {
        #[derive(Deserialize)]
        struct Snapshot {
            version: u32,
            #[serde(default)]
            active: Vec<Value>,
            #[serde(default)]
            completed: Vec<Value>,
        }

        let snapshot = serde_json::from_str::<Snapshot>(data)
            .ok()
            .filter(|snapshot| snapshot.version == SNAPSHOT_VERSION);

        let imported = {
            let mut caches = self.caches.lock().await;
            match snapshot {
                Some(snapshot) => {
                    let mut imported = 0;
                    for (values, bucket) in [
                        (snapshot.active, Bucket::Active),
                        (snapshot.completed, Bucket::Completed),
                    ] {
                        for value in values {
                            match codec::decode_record(value) {
                                Ok(mut work) => {
                                    if bucket == Bucket::Completed && work.completed_at.is_none() {
                                        work.completed_at = Some(work.last_updated);
                                    }
                                    caches.place(work, bucket);
                                    imported += 1;
                                }
                                Err(err) => tracing::warn!(?err, "skipping malformed snapshot record"),
                            }
                        }
                    }
                    imported
                }
                None => import_legacy_lines(&mut caches, data),
            }
        };

        if imported > 0 {
            self.flush().await.context("flush imported works")?;
        }
        tracing::info!(imported, "import finished");
        Ok(imported)
    }
}

fn import_legacy_lines(caches: &mut Caches, data: &str) -> usize {
    let mut imported = 0;
    for mut work in codec::decode_ndjson(data) {
        if work.is_eligible_for_completion() {
            let fallback: Millis = if work.last_updated > 0 {
                work.last_updated
            } else {
                now_millis()
            };
            work.completed_at.get_or_insert(fallback);
            caches.place(work, Bucket::Completed);
        } else {
            caches.place(work, Bucket::Active);
        }
        imported += 1;
    }
    imported
}
