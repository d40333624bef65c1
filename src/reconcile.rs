use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::model::{ChapterMetadata, TotalChapters, now_millis};
use crate::settings::Settings;
use crate::store::ProgressStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapedChapter {
    pub chapter_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_date: Option<String>,
}

/// A work's current chapter listing as reported by the site.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterList {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub chapters: Vec<ScrapedChapter>,
    /// Present only when the page states a total (`"?"` for an ongoing work).
    #[serde(default)]
    pub total_chapters: Option<TotalChapters>,
}

#[async_trait]
pub trait PageDataFetcher: Send + Sync {
    async fn fetch_chapter_list(&self, work_id: &str) -> anyhow::Result<ChapterList>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    pub has_new_chapters: bool,
    pub available_chapters: u32,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("work not found: {0}")]
    WorkNotFound(String),
    #[error("fetch chapter list: {0}")]
    Fetch(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub checked: usize,
    pub with_new_chapters: usize,
    pub failed: usize,
}

/// Merges scraped chapter listings into stored works.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<ProgressStore>,
}

impl Reconciler {
    pub fn new(store: Arc<ProgressStore>) -> Self {
        Self { store }
    }

    /// Never changes read percentages. Metadata already known for a chapter is
    /// kept as is.
    pub async fn reconcile(
        &self,
        work_id: &str,
        chapters: &[ScrapedChapter],
        title: Option<&str>,
        total_chapters: Option<TotalChapters>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let scraped_count = chapters.len() as u32;
        self.store
            .amend_work(work_id, |work| {
                let old_available = work.effective_available_chapters();
                let has_new_chapters = scraped_count > old_available;

                let mut changed = work.apply_title(title);
                if work.available_chapters != Some(scraped_count) {
                    work.available_chapters = Some(scraped_count);
                    changed = true;
                }
                if let Some(total) = total_chapters {
                    if work.total_chapters != Some(total) {
                        work.set_total_chapters(total);
                        changed = true;
                    }
                }
                for chapter in chapters {
                    if chapter.chapter_id.is_empty()
                        || work.chapter_metadata.contains_key(&chapter.chapter_id)
                    {
                        continue;
                    }
                    work.chapter_metadata.insert(
                        chapter.chapter_id.clone(),
                        ChapterMetadata {
                            title: chapter.title.clone(),
                            published_date: chapter.published_date.clone(),
                        },
                    );
                    changed = true;
                }

                let now = now_millis();
                work.last_checked = Some(now);
                if changed {
                    work.last_updated = now;
                }

                ReconcileOutcome {
                    has_new_chapters,
                    available_chapters: scraped_count,
                    title: work.title.clone(),
                }
            })
            .await
            .ok_or_else(|| ReconcileError::WorkNotFound(work_id.to_owned()))
    }

    /// Fetches one work's listing and reconciles it.
    pub async fn check_work(
        &self,
        fetcher: &dyn PageDataFetcher,
        work_id: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if self.store.get_work(work_id).await.is_none() {
            return Err(ReconcileError::WorkNotFound(work_id.to_owned()));
        }
        let list = fetcher
            .fetch_chapter_list(work_id)
            .await
            .map_err(|err| ReconcileError::Fetch(format!("{err:#}")))?;
        let outcome = self
            .reconcile(work_id, &list.chapters, list.title.as_deref(), list.total_chapters)
            .await?;
        if outcome.has_new_chapters {
            tracing::info!(work_id, available = outcome.available_chapters, "new chapters available");
        }
        Ok(outcome)
    }

    /// Checks every ongoing or unfinished work, one at a time, pausing
    /// `politeness_delay` between fetches. A failing work is logged and skipped.
    pub async fn check_all(&self, fetcher: &dyn PageDataFetcher, settings: &Settings) -> BatchReport {
        let mut report = BatchReport::default();
        if !settings.check_for_updates {
            tracing::info!("update checking disabled");
            return report;
        }

        let work_ids: Vec<String> = self
            .store
            .get_all_works()
            .await
            .into_iter()
            .filter(|work| work.is_work_in_progress || work.completed_at.is_none())
            .map(|work| work.id)
            .collect();
        tracing::info!(works = work_ids.len(), "checking works for new chapters");

        let delay = settings.politeness_delay();
        for (index, work_id) in work_ids.iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            report.checked += 1;
            match self.check_work(fetcher, work_id).await {
                Ok(outcome) if outcome.has_new_chapters => report.with_new_chapters += 1,
                Ok(_) => {}
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(work_id = %work_id, %err, "update check failed");
                }
            }
        }

        if report.with_new_chapters > 0 {
            let noun = if report.with_new_chapters == 1 {
                "work has"
            } else {
                "works have"
            };
            tracing::info!(
                count = report.with_new_chapters,
                "{} {noun} new chapters available",
                report.with_new_chapters
            );
        }
        tracing::info!(
            checked = report.checked,
            updated = report.with_new_chapters,
            failed = report.failed,
            "update check complete"
        );
        report
    }

    /// Runs [`Self::check_all`] every `update_check_period`, then persists.
    pub fn spawn_periodic_checks(
        &self,
        fetcher: Arc<dyn PageDataFetcher>,
        settings: Settings,
        first_delay: Duration,
    ) -> JoinHandle<()> {
        let reconciler = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(first_delay).await;
            let mut ticker = tokio::time::interval(settings.update_check_period());
            loop {
                ticker.tick().await;
                reconciler.check_all(fetcher.as_ref(), &settings).await;
                if let Err(err) = reconciler.store.flush().await {
                    tracing::error!(?err, "flush after update check failed");
                }
            }
        })
    }
}
