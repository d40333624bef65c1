use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::model::{Millis, TotalChapters, WorkRecord, now_millis};
use crate::settings::Settings;
use crate::store::kv::{KvStore, SYNC_STATE_KEY};

const SYNC_STATE_RETENTION_MS: Millis = 7 * 24 * 60 * 60 * 1000;

/// Arguments of one outbound bookmark update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookmarkUpdate {
    pub work_id: String,
    pub read_chapters: u32,
    pub total_chapters: TotalChapters,
    pub percent_complete: u32,
    pub chapter_number: Option<u32>,
    pub chapter_progress: Option<u8>,
}

impl BookmarkUpdate {
    pub fn from_work(work: &WorkRecord, chapter_number: Option<u32>, chapter_progress: Option<u8>) -> Self {
        let read_chapters = work.read_chapter_count();
        let total_chapters = match work.total_chapters {
            Some(TotalChapters::Known(n)) if n > 0 => TotalChapters::Known(n),
            _ => match work.effective_available_chapters() {
                0 => TotalChapters::Unknown,
                n => TotalChapters::Known(n),
            },
        };
        let percent_complete = match total_chapters {
            TotalChapters::Known(n) => {
                ((f64::from(read_chapters) / f64::from(n)) * 100.0).round().min(100.0) as u32
            }
            TotalChapters::Unknown => 0,
        };
        Self {
            work_id: work.id.clone(),
            read_chapters,
            total_chapters,
            percent_complete,
            chapter_number,
            chapter_progress,
        }
    }
}

/// The remote side of bookmark sync. Implementations own transport and auth.
#[async_trait]
pub trait BookmarkSyncProtocol: Send + Sync {
    async fn update_bookmark(&self, update: &BookmarkUpdate) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// The throttle declined to call out; not a failure of the remote side.
    #[error("not at sync interval")]
    NotAtSyncInterval,
    #[error("sync disabled")]
    Disabled,
    #[error("{0}")]
    External(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub success: bool,
    pub error: Option<SyncError>,
}

impl SyncOutcome {
    fn synced() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failed(error: SyncError) -> Self {
        Self {
            success: false,
            error: Some(error),
        }
    }

    pub fn was_throttled(&self) -> bool {
        matches!(self.error, Some(SyncError::NotAtSyncInterval))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMark {
    pub last_synced_progress: u8,
    pub timestamp: Millis,
}

type SyncKey = (String, u32);

/// Remembers what was last synced per `(work, chapter)` and decides whether a
/// new progress value crosses the next threshold.
#[derive(Debug, Clone)]
pub struct SyncThrottle {
    thresholds: Vec<u8>,
    marks: HashMap<SyncKey, SyncMark>,
}

impl SyncThrottle {
    pub fn new(thresholds: Vec<u8>) -> Self {
        Self {
            thresholds,
            marks: HashMap::new(),
        }
    }

    pub fn should_sync(&self, work_id: &str, chapter_number: u32, current_progress: u8) -> bool {
        let Some(mark) = self.marks.get(&(work_id.to_owned(), chapter_number)) else {
            return self
                .thresholds
                .first()
                .is_some_and(|first| current_progress >= *first);
        };

        if current_progress == 100 && mark.last_synced_progress < 100 {
            return true;
        }
        self.thresholds
            .iter()
            .find(|threshold| **threshold > mark.last_synced_progress)
            .is_some_and(|next| current_progress >= *next)
    }

    pub fn record(&mut self, work_id: &str, chapter_number: u32, progress: u8, now: Millis) {
        self.marks.insert(
            (work_id.to_owned(), chapter_number),
            SyncMark {
                last_synced_progress: progress,
                timestamp: now,
            },
        );
    }

    pub fn mark(&self, work_id: &str, chapter_number: u32) -> Option<SyncMark> {
        self.marks.get(&(work_id.to_owned(), chapter_number)).copied()
    }

    /// Returns the number of entries removed.
    pub fn purge_older_than(&mut self, cutoff: Millis) -> usize {
        let before = self.marks.len();
        self.marks.retain(|_, mark| mark.timestamp >= cutoff);
        before - self.marks.len()
    }

    pub fn clear_work(&mut self, work_id: &str) -> usize {
        let before = self.marks.len();
        self.marks.retain(|(id, _), _| id != work_id);
        before - self.marks.len()
    }

    fn to_entries(&self) -> Vec<(SyncKey, SyncMark)> {
        let mut entries: Vec<_> = self
            .marks
            .iter()
            .map(|(key, mark)| (key.clone(), *mark))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

/// Throttled, rate-limited bridge to a [`BookmarkSyncProtocol`].
pub struct BookmarkSync {
    protocol: Arc<dyn BookmarkSyncProtocol>,
    kv: Arc<dyn KvStore>,
    enabled: bool,
    rate_limit: Duration,
    throttle: Mutex<SyncThrottle>,
    // Held for the whole check-wait-call-record sequence so outbound calls
    // never overlap and are spaced by `rate_limit`.
    last_call: Mutex<Option<Instant>>,
}

impl BookmarkSync {
    pub async fn load(
        kv: Arc<dyn KvStore>,
        protocol: Arc<dyn BookmarkSyncProtocol>,
        settings: &Settings,
    ) -> anyhow::Result<Self> {
        let throttle = load_throttle(kv.as_ref(), settings.sync_thresholds.clone()).await?;
        let sync = Self {
            protocol,
            kv,
            enabled: settings.sync_with_bookmarks,
            rate_limit: settings.rate_limit_delay(),
            throttle: Mutex::new(throttle),
            last_call: Mutex::new(None),
        };

        let purged = {
            let mut throttle = sync.throttle.lock().await;
            let purged = throttle.purge_older_than(now_millis() - SYNC_STATE_RETENTION_MS);
            if purged > 0 {
                sync.persist(&throttle).await?;
            }
            purged
        };
        if purged > 0 {
            tracing::debug!(purged, "purged stale sync state entries");
        }
        Ok(sync)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn should_sync(&self, work_id: &str, chapter_number: u32, current_progress: u8) -> bool {
        self.throttle
            .lock()
            .await
            .should_sync(work_id, chapter_number, current_progress)
    }

    pub async fn record_sync(&self, work_id: &str, chapter_number: u32, progress: u8) -> anyhow::Result<()> {
        let mut throttle = self.throttle.lock().await;
        throttle.record(work_id, chapter_number, progress, now_millis());
        self.persist(&throttle).await
    }

    pub async fn clear_synced_chapters(&self, work_id: &str) -> anyhow::Result<usize> {
        let mut throttle = self.throttle.lock().await;
        let cleared = throttle.clear_work(work_id);
        if cleared > 0 {
            self.persist(&throttle).await?;
        }
        Ok(cleared)
    }

    pub async fn sync_if_due(
        &self,
        work: &WorkRecord,
        chapter_number: Option<u32>,
        chapter_progress: Option<u8>,
    ) -> SyncOutcome {
        if !self.enabled {
            return SyncOutcome::failed(SyncError::Disabled);
        }

        let update = BookmarkUpdate::from_work(work, chapter_number, chapter_progress);
        let mut last_call = self.last_call.lock().await;

        if let (Some(chapter), Some(progress)) = (chapter_number, chapter_progress) {
            if !self.should_sync(&work.id, chapter, progress).await {
                tracing::debug!(work_id = %work.id, chapter, progress, "skipping sync below next threshold");
                return SyncOutcome::failed(SyncError::NotAtSyncInterval);
            }
        }

        if let Some(previous) = *last_call {
            let elapsed = previous.elapsed();
            if elapsed < self.rate_limit {
                let wait = self.rate_limit - elapsed;
                tracing::debug!(wait_ms = wait.as_millis() as u64, "rate limiting bookmark sync");
                tokio::time::sleep(wait).await;
            }
        }
        *last_call = Some(Instant::now());

        tracing::info!(
            work_id = %work.id,
            read = update.read_chapters,
            total = %update.total_chapters,
            percent = update.percent_complete,
            "updating bookmark progress"
        );
        if let Err(err) = self.protocol.update_bookmark(&update).await {
            tracing::warn!(work_id = %work.id, ?err, "bookmark sync failed");
            return SyncOutcome::failed(SyncError::External(format!("{err:#}")));
        }

        if let (Some(chapter), Some(progress)) = (chapter_number, chapter_progress) {
            if let Err(err) = self.record_sync(&work.id, chapter, progress).await {
                tracing::warn!(work_id = %work.id, ?err, "failed to persist sync state");
            }
        }
        SyncOutcome::synced()
    }

    async fn persist(&self, throttle: &SyncThrottle) -> anyhow::Result<()> {
        persist_throttle(self.kv.as_ref(), throttle).await
    }
}

async fn load_throttle(kv: &dyn KvStore, thresholds: Vec<u8>) -> anyhow::Result<SyncThrottle> {
    let mut throttle = SyncThrottle::new(thresholds);
    if let Some(raw) = kv.get(SYNC_STATE_KEY).await.context("read sync state")? {
        match serde_json::from_str::<Vec<(SyncKey, SyncMark)>>(&raw) {
            Ok(entries) => throttle.marks.extend(entries),
            Err(err) => tracing::warn!(?err, "discarding malformed sync state"),
        }
    }
    Ok(throttle)
}

async fn persist_throttle(kv: &dyn KvStore, throttle: &SyncThrottle) -> anyhow::Result<()> {
    let raw = serde_json::to_string(&throttle.to_entries()).context("serialize sync state")?;
    kv.set(SYNC_STATE_KEY, raw).await.context("write sync state")
}

/// Drops the stored sync state of a work when no sync session is open.
pub async fn forget_work(kv: &dyn KvStore, work_id: &str) -> anyhow::Result<usize> {
    let mut throttle = load_throttle(kv, Vec::new()).await?;
    let cleared = throttle.clear_work(work_id);
    if cleared > 0 {
        persist_throttle(kv, &throttle).await?;
    }
    Ok(cleared)
}

/// Builds the bookmark tag text for a progress snapshot.
pub fn format_progress_tag(
    prefix: &str,
    read_chapters: u32,
    total_chapters: TotalChapters,
    percent_complete: u32,
) -> String {
    if read_chapters == 0 && percent_complete == 0 {
        return format!("{prefix} Not started");
    }
    if let TotalChapters::Known(total) = total_chapters {
        if read_chapters >= total {
            return format!("{prefix} Complete");
        }
    }
    format!("{prefix} {read_chapters}/{total_chapters} chapters ({percent_complete} Percent)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChapterState;
    use crate::settings::default_sync_thresholds;
    use crate::store::kv::MemoryKvStore;

    #[derive(Default)]
    struct RecordingProtocol {
        fail: bool,
        calls: std::sync::Mutex<Vec<(BookmarkUpdate, Instant)>>,
    }

    impl RecordingProtocol {
        fn calls(&self) -> Vec<(BookmarkUpdate, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BookmarkSyncProtocol for RecordingProtocol {
        async fn update_bookmark(&self, update: &BookmarkUpdate) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((update.clone(), Instant::now()));
            if self.fail {
                anyhow::bail!("remote said no");
            }
            Ok(())
        }
    }

    fn enabled_settings() -> Settings {
        Settings {
            sync_with_bookmarks: true,
            ..Settings::default()
        }
    }

    fn work(read: &[u32], unread: &[u32], total: Option<TotalChapters>) -> WorkRecord {
        let mut work = WorkRecord::new("w", Some("Work"));
        for (numbers, percent) in [(read, 100u8), (unread, 30u8)] {
            for number in numbers {
                work.chapters.insert(
                    *number,
                    ChapterState {
                        chapter_id: format!("c{number}"),
                        percent_read: percent,
                        last_visible_paragraph_index: None,
                    },
                );
            }
        }
        work.available_chapters = Some(work.tracked_chapter_count());
        if let Some(total) = total {
            work.set_total_chapters(total);
        }
        work
    }

    async fn sync_with(protocol: Arc<RecordingProtocol>, kv: Arc<MemoryKvStore>) -> BookmarkSync {
        BookmarkSync::load(kv, protocol, &enabled_settings())
            .await
            .expect("load bookmark sync")
    }

    #[test]
    fn throttle_syncs_at_successive_thresholds() {
        let mut throttle = SyncThrottle::new(default_sync_thresholds());
        assert!(!throttle.should_sync("w", 1, 4));
        assert!(throttle.should_sync("w", 1, 10));
        throttle.record("w", 1, 10, 0);
        assert!(!throttle.should_sync("w", 1, 20));
        assert!(throttle.should_sync("w", 1, 30));
        assert!(throttle.should_sync("w", 2, 5));
    }

    #[test]
    fn throttle_always_syncs_completion_once() {
        let mut throttle = SyncThrottle::new(default_sync_thresholds());
        throttle.record("w", 1, 90, 0);
        assert!(throttle.should_sync("w", 1, 100));
        assert!(!throttle.should_sync("w", 1, 99));

        throttle.record("w", 1, 100, 0);
        assert!(!throttle.should_sync("w", 1, 100));

        let mut custom = SyncThrottle::new(vec![10, 50]);
        custom.record("w", 1, 60, 0);
        assert!(!custom.should_sync("w", 1, 99));
        assert!(custom.should_sync("w", 1, 100));
    }

    #[test]
    fn bookmark_update_falls_back_to_available_chapters() {
        let update = BookmarkUpdate::from_work(&work(&[1, 2], &[3], Some(TotalChapters::Known(8))), None, None);
        assert_eq!(update.read_chapters, 2);
        assert_eq!(update.total_chapters, TotalChapters::Known(8));
        assert_eq!(update.percent_complete, 25);

        let update = BookmarkUpdate::from_work(&work(&[1], &[2, 3], Some(TotalChapters::Unknown)), None, None);
        assert_eq!(update.total_chapters, TotalChapters::Known(3));
        assert_eq!(update.percent_complete, 33);

        let mut unknown = work(&[], &[], None);
        unknown.available_chapters = None;
        let update = BookmarkUpdate::from_work(&unknown, None, None);
        assert_eq!(update.total_chapters, TotalChapters::Unknown);
        assert_eq!(update.percent_complete, 0);
    }

    #[test]
    fn progress_tag_formats() {
        let prefix = "Reading Progress:";
        assert_eq!(
            format_progress_tag(prefix, 0, TotalChapters::Unknown, 0),
            "Reading Progress: Not started"
        );
        assert_eq!(
            format_progress_tag(prefix, 3, TotalChapters::Known(3), 100),
            "Reading Progress: Complete"
        );
        assert_eq!(
            format_progress_tag(prefix, 2, TotalChapters::Unknown, 40),
            "Reading Progress: 2/? chapters (40 Percent)"
        );
        assert_eq!(
            format_progress_tag(prefix, 1, TotalChapters::Known(4), 25),
            "Reading Progress: 1/4 chapters (25 Percent)"
        );
    }

    #[tokio::test]
    async fn sync_if_due_short_circuits_without_calling_out() {
        let protocol = Arc::new(RecordingProtocol::default());
        let sync = sync_with(Arc::clone(&protocol), Arc::new(MemoryKvStore::new())).await;

        let outcome = sync.sync_if_due(&work(&[], &[1], None), Some(1), Some(3)).await;
        assert!(!outcome.success);
        assert!(outcome.was_throttled());
        assert_eq!(
            outcome.error.map(|err| err.to_string()).as_deref(),
            Some("not at sync interval")
        );
        assert!(protocol.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sync_if_due_records_success_and_spaces_calls() -> anyhow::Result<()> {
        let protocol = Arc::new(RecordingProtocol::default());
        let kv = Arc::new(MemoryKvStore::new());
        let sync = sync_with(Arc::clone(&protocol), Arc::clone(&kv)).await;
        let work = work(&[1], &[2], Some(TotalChapters::Known(2)));

        assert!(sync.sync_if_due(&work, Some(2), Some(30)).await.success);
        assert!(sync.sync_if_due(&work, Some(1), Some(100)).await.success);
        assert!(sync.sync_if_due(&work, Some(2), Some(40)).await.was_throttled());

        let calls = protocol.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].1 - calls[0].1 >= Duration::from_secs(2));
        assert_eq!(calls[0].0.chapter_progress, Some(30));

        let persisted = kv.get(SYNC_STATE_KEY).await?.unwrap_or_default();
        assert!(persisted.contains(r#"["w",2]"#));
        assert!(persisted.contains(r#""lastSyncedProgress":30"#));
        Ok(())
    }

    #[tokio::test]
    async fn external_failure_is_reported_and_not_recorded() {
        let protocol = Arc::new(RecordingProtocol {
            fail: true,
            ..RecordingProtocol::default()
        });
        let sync = sync_with(Arc::clone(&protocol), Arc::new(MemoryKvStore::new())).await;

        let outcome = sync.sync_if_due(&work(&[1], &[], None), Some(1), Some(100)).await;
        assert!(!outcome.success);
        assert!(matches!(outcome.error, Some(SyncError::External(ref msg)) if msg.contains("remote said no")));
        assert!(sync.should_sync("w", 1, 100).await);
    }

    #[tokio::test]
    async fn disabled_sync_never_calls_out() {
        let protocol = Arc::new(RecordingProtocol::default());
        let sync = BookmarkSync::load(
            Arc::new(MemoryKvStore::new()),
            Arc::clone(&protocol) as Arc<dyn BookmarkSyncProtocol>,
            &Settings::default(),
        )
        .await
        .expect("load bookmark sync");

        let outcome = sync.sync_if_due(&work(&[1], &[], None), None, None).await;
        assert_eq!(outcome.error, Some(SyncError::Disabled));
        assert!(protocol.calls().is_empty());
    }

    #[tokio::test]
    async fn load_purges_week_old_entries() -> anyhow::Result<()> {
        let kv = Arc::new(MemoryKvStore::new());
        let fresh = now_millis();
        let stale = fresh - SYNC_STATE_RETENTION_MS - 1;
        kv.set(
            SYNC_STATE_KEY,
            format!(
                r#"[[["old",1],{{"lastSyncedProgress":50,"timestamp":{stale}}}],[["new",1],{{"lastSyncedProgress":50,"timestamp":{fresh}}}]]"#
            ),
        )
        .await?;

        let sync = sync_with(Arc::new(RecordingProtocol::default()), Arc::clone(&kv)).await;
        assert!(sync.should_sync("old", 1, 10).await);
        assert!(!sync.should_sync("new", 1, 60).await);

        let persisted = kv.get(SYNC_STATE_KEY).await?.unwrap_or_default();
        assert!(!persisted.contains("old"));
        Ok(())
    }

    #[tokio::test]
    async fn clear_synced_chapters_forgets_one_work() -> anyhow::Result<()> {
        let sync = sync_with(Arc::new(RecordingProtocol::default()), Arc::new(MemoryKvStore::new())).await;
        sync.record_sync("a", 1, 50).await?;
        sync.record_sync("a", 2, 50).await?;
        sync.record_sync("b", 1, 50).await?;

        assert_eq!(sync.clear_synced_chapters("a").await?, 2);
        assert!(sync.should_sync("a", 1, 10).await);
        assert!(!sync.should_sync("b", 1, 60).await);
        Ok(())
    }

    #[tokio::test]
    async fn forget_work_edits_stored_state_directly() -> anyhow::Result<()> {
        let kv = Arc::new(MemoryKvStore::new());
        let sync = sync_with(Arc::new(RecordingProtocol::default()), Arc::clone(&kv)).await;
        sync.record_sync("a", 1, 50).await?;
        sync.record_sync("b", 1, 50).await?;

        assert_eq!(forget_work(kv.as_ref(), "a").await?, 1);
        assert_eq!(forget_work(kv.as_ref(), "missing").await?, 0);
        let persisted = kv.get(SYNC_STATE_KEY).await?.unwrap_or_default();
        assert!(!persisted.contains(r#""a""#));
        assert!(persisted.contains(r#""b""#));
        Ok(())
    }
}
