use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;

use crate::cli::{
    CheckArgs, ExportArgs, ImportArgs, MarkAllArgs, ProgressArgs, SetChapterArgs, SettingsSetArgs,
    SyncArgs, WatchArgs, WorkArgs,
};
use crate::model::{ChapterInfo, WorkRecord, placeholder_chapter_id};
use crate::reconcile::Reconciler;
use crate::remote::{self, HttpBookmarkSyncProtocol, HttpChapterListFetcher};
use crate::settings::Settings;
use crate::store::kv::{KvStore, LocalFsKvStore};
use crate::store::{Bucket, ProgressStore, ProgressUpdate};
use crate::sync::{self, BookmarkSync, SyncError};

/// An opened data directory.
struct Workspace {
    kv: Arc<dyn KvStore>,
    store: Arc<ProgressStore>,
    settings: Settings,
}

impl Workspace {
    async fn open(data_dir: &Path) -> anyhow::Result<Self> {
        Self::open_with(data_dir, |store, _, _| async move { Ok(store) }).await
    }

    /// `attach` may decorate the store before it is shared.
    async fn open_with<F, Fut>(data_dir: &Path, attach: F) -> anyhow::Result<Self>
    where
        F: FnOnce(ProgressStore, Arc<dyn KvStore>, Settings) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<ProgressStore>>,
    {
        tracing::debug!(data_dir = %data_dir.display(), "opening data directory");
        let kv: Arc<dyn KvStore> = Arc::new(LocalFsKvStore::new(data_dir));
        let settings = Settings::load(kv.as_ref()).await?;
        let store = ProgressStore::load(Arc::clone(&kv))
            .await
            .context("load progress store")?;
        let store = attach(store, Arc::clone(&kv), settings.clone()).await?;
        Ok(Self {
            kv,
            store: Arc::new(store),
            settings,
        })
    }

    async fn find(&self, work_id: &str) -> anyhow::Result<WorkRecord> {
        self.store
            .get_work(work_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("work not found: {work_id}"))
    }
}

async fn open_bookmark_sync(
    kv: Arc<dyn KvStore>,
    settings: &Settings,
    sync_url: &str,
) -> anyhow::Result<BookmarkSync> {
    let protocol = HttpBookmarkSyncProtocol::new(
        remote::http_client()?,
        remote::parse_base_url(sync_url).context("parse --sync-url")?,
        settings,
    );
    BookmarkSync::load(kv, Arc::new(protocol), settings).await
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{text}");
    Ok(())
}

fn bucket_label(bucket: Bucket) -> &'static str {
    match bucket {
        Bucket::Active => "active",
        Bucket::Completed => "completed",
    }
}

pub async fn list(data_dir: &Path) -> anyhow::Result<()> {
    let ws = Workspace::open(data_dir).await?;
    let works = ws.store.get_all_works().await;
    let mut out = std::io::stdout().lock();
    for work in works {
        let status = if work.completed_at.is_some() {
            "completed"
        } else if work.is_work_in_progress {
            "wip"
        } else {
            "active"
        };
        let total = work
            .total_chapters
            .map_or_else(|| "-".to_owned(), |total| total.to_string());
        writeln!(
            out,
            "{}\t{}\t{}/{} read\ttotal {}\t{}",
            work.id,
            status,
            work.read_chapter_count(),
            work.effective_available_chapters(),
            total,
            work.title
        )
        .context("write work line")?;
    }
    Ok(())
}

pub async fn show(data_dir: &Path, args: WorkArgs) -> anyhow::Result<()> {
    let ws = Workspace::open(data_dir).await?;
    print_json(&ws.find(&args.work_id).await?)
}

pub async fn stats(data_dir: &Path) -> anyhow::Result<()> {
    let ws = Workspace::open(data_dir).await?;
    print_json(&ws.store.get_stats().await?)
}

pub async fn progress(data_dir: &Path, args: ProgressArgs) -> anyhow::Result<()> {
    let sync_url = args.sync_url.clone();
    let ws = Workspace::open_with(data_dir, |store, kv, settings| async move {
        match sync_url {
            Some(url) if settings.sync_with_bookmarks => {
                let sync = open_bookmark_sync(kv, &settings, &url).await?;
                Ok(store.with_bookmark_sync(Arc::new(sync)))
            }
            _ => Ok(store),
        }
    })
    .await?;

    let chapter_id = args
        .chapter_id
        .unwrap_or_else(|| placeholder_chapter_id(args.chapter));
    let mut update = ProgressUpdate::new(args.work_id.clone(), args.chapter, chapter_id, args.percent);
    update.title = args.title;
    update.last_paragraph = args.paragraph;
    if args.available.is_some() || args.total.is_some() {
        update.chapter_info = Some(ChapterInfo {
            current: args.available,
            total: args.total,
        });
    }

    let bucket = ws.store.update_progress(update).await?;
    ws.store.flush().await.context("flush progress")?;
    ws.store.wait_for_background_syncs().await;
    println!("{}\t{}", args.work_id, bucket_label(bucket));
    Ok(())
}

pub async fn set_chapter(data_dir: &Path, args: SetChapterArgs) -> anyhow::Result<()> {
    let ws = Workspace::open(data_dir).await?;
    if !ws
        .store
        .update_chapter_progress(&args.work_id, args.chapter, args.percent)
        .await
    {
        anyhow::bail!("work not found: {}", args.work_id);
    }
    ws.store.flush().await.context("flush chapter update")
}

pub async fn mark_all(data_dir: &Path, args: MarkAllArgs) -> anyhow::Result<()> {
    let ws = Workspace::open(data_dir).await?;
    let percent = if args.read { 100.0 } else { 0.0 };
    if !ws.store.set_all_chapters(&args.work_id, percent).await {
        anyhow::bail!("work not found: {}", args.work_id);
    }
    ws.store.flush().await.context("flush chapter update")
}

pub async fn complete(data_dir: &Path, args: WorkArgs) -> anyhow::Result<()> {
    let ws = Workspace::open(data_dir).await?;
    if !ws.store.mark_completed(&args.work_id).await {
        anyhow::bail!("work not found: {}", args.work_id);
    }
    ws.store.flush().await.context("flush completion")
}

pub async fn delete(data_dir: &Path, args: WorkArgs) -> anyhow::Result<()> {
    let ws = Workspace::open(data_dir).await?;
    if !ws.store.delete_work(&args.work_id).await {
        anyhow::bail!("work not found: {}", args.work_id);
    }
    ws.store.flush().await.context("flush deletion")?;
    let cleared = sync::forget_work(ws.kv.as_ref(), &args.work_id).await?;
    tracing::info!(work_id = %args.work_id, cleared, "work deleted");
    Ok(())
}

pub async fn export(data_dir: &Path, args: ExportArgs) -> anyhow::Result<()> {
    let ws = Workspace::open(data_dir).await?;
    let data = if args.legacy {
        ws.store.export_legacy_ndjson().await?
    } else {
        ws.store.export_snapshot().await?
    };

    match args.out {
        Some(path) => {
            tokio::fs::write(&path, format!("{data}\n"))
                .await
                .with_context(|| format!("write {}", path.display()))?;
            tracing::info!(path = %path.display(), "export written");
        }
        None => println!("{data}"),
    }
    Ok(())
}

pub async fn import(data_dir: &Path, args: ImportArgs) -> anyhow::Result<()> {
    let data = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("read {}", args.file.display()))?;
    let ws = Workspace::open(data_dir).await?;
    let imported = ws.store.import_snapshot(&data).await?;
    println!("imported {imported} works");
    Ok(())
}

pub async fn check(data_dir: &Path, args: CheckArgs) -> anyhow::Result<()> {
    let ws = Workspace::open(data_dir).await?;
    let fetcher = HttpChapterListFetcher::new(
        remote::http_client()?,
        remote::parse_base_url(&args.site_url).context("parse --site-url")?,
    );
    let reconciler = Reconciler::new(Arc::clone(&ws.store));

    match args.work_id {
        Some(work_id) => {
            let outcome = reconciler.check_work(&fetcher, &work_id).await;
            ws.store.flush().await.context("flush update check")?;
            let outcome = outcome?;
            println!(
                "{work_id}\t{} chapters\t{}",
                outcome.available_chapters,
                if outcome.has_new_chapters {
                    "new chapters"
                } else {
                    "up to date"
                }
            );
        }
        None => {
            let report = reconciler.check_all(&fetcher, &ws.settings).await;
            ws.store.flush().await.context("flush update check")?;
            println!(
                "checked {}\twith new chapters {}\tfailed {}",
                report.checked, report.with_new_chapters, report.failed
            );
        }
    }
    Ok(())
}

pub async fn sync_work(data_dir: &Path, args: SyncArgs) -> anyhow::Result<()> {
    let ws = Workspace::open(data_dir).await?;
    let work = ws.find(&args.work_id).await?;
    let sync = open_bookmark_sync(Arc::clone(&ws.kv), &ws.settings, &args.sync_url).await?;

    let outcome = sync.sync_if_due(&work, None, None).await;
    match outcome.error {
        None => {
            println!("{}\tsynced", work.id);
            Ok(())
        }
        Some(SyncError::Disabled) => {
            anyhow::bail!("bookmark sync is disabled (settings set syncWithBookmarks true)")
        }
        Some(err) => Err(anyhow::Error::new(err).context(format!("sync work {}", work.id))),
    }
}

pub async fn cleanup(data_dir: &Path) -> anyhow::Result<()> {
    let ws = Workspace::open(data_dir).await?;
    let removed = ws.store.cleanup_completed(&ws.settings).await?;
    println!("removed {removed} completed works");
    Ok(())
}

pub async fn watch(data_dir: &Path, args: WatchArgs) -> anyhow::Result<()> {
    let ws = Workspace::open(data_dir).await?;
    let fetcher = HttpChapterListFetcher::new(
        remote::http_client()?,
        remote::parse_base_url(&args.site_url).context("parse --site-url")?,
    );

    let removed = ws.store.cleanup_completed(&ws.settings).await?;
    if removed > 0 {
        tracing::info!(removed, "removed expired completed works");
    }

    let flusher = ws.store.spawn_auto_flush(ws.settings.flush_interval());
    let checker = ws.settings.check_for_updates.then(|| {
        Reconciler::new(Arc::clone(&ws.store)).spawn_periodic_checks(
            Arc::new(fetcher),
            ws.settings.clone(),
            Duration::from_secs(args.first_check_after),
        )
    });
    tracing::info!(
        flush_ms = ws.settings.flush_interval_ms,
        check_hours = ws.settings.update_check_interval,
        checking = checker.is_some(),
        "watching; press ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    flusher.abort();
    if let Some(checker) = checker {
        checker.abort();
    }
    ws.store.flush().await.context("final flush")
}

pub async fn settings_show(data_dir: &Path) -> anyhow::Result<()> {
    let kv = LocalFsKvStore::new(data_dir);
    print_json(&Settings::load(&kv).await?)
}

pub async fn settings_set(data_dir: &Path, args: SettingsSetArgs) -> anyhow::Result<()> {
    let kv = LocalFsKvStore::new(data_dir);
    let settings = Settings::load(&kv).await?;
    let updated = apply_setting(&settings, &args.key, &args.value)?;
    updated.save(&kv).await?;
    print_json(&updated)
}

/// Sets one camelCase field, reading `value` as JSON and falling back to a string.
fn apply_setting(settings: &Settings, key: &str, value: &str) -> anyhow::Result<Settings> {
    let mut document = serde_json::to_value(settings).context("serialize settings")?;
    let fields = document
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("settings must serialize to an object"))?;
    if !fields.contains_key(key) {
        let known: Vec<&str> = fields.keys().map(String::as_str).collect();
        anyhow::bail!("unknown setting {key:?} (known: {})", known.join(", "));
    }

    let parsed = serde_json::from_str::<serde_json::Value>(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_owned()));
    fields.insert(key.to_owned(), parsed);
    let settings: Settings = serde_json::from_value(document)
        .with_context(|| format!("invalid value for {key}: {value}"))?;
    Ok(settings.normalized())
}
