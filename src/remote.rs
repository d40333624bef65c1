use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use url::Url;

use crate::reconcile::{ChapterList, PageDataFetcher};
use crate::settings::Settings;
use crate::sync::{BookmarkSyncProtocol, BookmarkUpdate, format_progress_tag};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn http_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("chapterwatch/", env!("CARGO_PKG_VERSION")))
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("build http client")
}

/// Parses a base URL, making sure relative joins stay under its path.
pub fn parse_base_url(raw: &str) -> anyhow::Result<Url> {
    let mut url = Url::parse(raw.trim()).with_context(|| format!("parse base url {raw:?}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("unsupported url scheme: {}", url.scheme());
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn work_endpoint(base: &Url, segments: &[&str]) -> anyhow::Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| anyhow::anyhow!("base url cannot carry a path: {base}"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn error_message(raw: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    value
        .get("error")
        .and_then(|error| error.as_str().or_else(|| error.get("message")?.as_str()))
        .map(str::to_owned)
}

/// Reads `<base>/works/<id>/chapters.json`.
pub struct HttpChapterListFetcher {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpChapterListFetcher {
    pub fn new(client: reqwest::Client, base_url: Url) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl PageDataFetcher for HttpChapterListFetcher {
    async fn fetch_chapter_list(&self, work_id: &str) -> anyhow::Result<ChapterList> {
        let endpoint = work_endpoint(&self.base_url, &["works", work_id, "chapters.json"])?;
        tracing::debug!(%endpoint, "fetching chapter list");

        let response = self
            .client
            .get(endpoint.clone())
            .send()
            .await
            .with_context(|| format!("GET {endpoint}"))?;
        let status = response.status();
        let raw = response.text().await.context("read chapter list body")?;
        if !status.is_success() {
            let message = error_message(&raw).unwrap_or(raw);
            anyhow::bail!("chapter list request failed ({status}): {}", message.trim());
        }
        serde_json::from_str(&raw).with_context(|| format!("parse chapter list for work {work_id}"))
    }
}

/// Posts bookmark progress to `<base>/bookmarks/<id>`.
pub struct HttpBookmarkSyncProtocol {
    client: reqwest::Client,
    base_url: Url,
    tag_prefix: String,
    private: bool,
    auto_create: bool,
}

impl HttpBookmarkSyncProtocol {
    pub fn new(client: reqwest::Client, base_url: Url, settings: &Settings) -> Self {
        Self {
            client,
            base_url,
            tag_prefix: settings.bookmark_tag_prefix.clone(),
            private: settings.bookmark_private,
            auto_create: settings.bookmark_auto_create,
        }
    }

    fn body(&self, update: &BookmarkUpdate) -> serde_json::Value {
        let tag = format_progress_tag(
            &self.tag_prefix,
            update.read_chapters,
            update.total_chapters,
            update.percent_complete,
        );
        let mut body = serde_json::json!({
            "readChapters": update.read_chapters,
            "totalChapters": update.total_chapters,
            "percentComplete": update.percent_complete,
            "tag": tag,
            "private": self.private,
            "autoCreate": self.auto_create,
        });
        if let Some(obj) = body.as_object_mut() {
            if let Some(chapter) = update.chapter_number {
                obj.insert("chapterNumber".to_owned(), serde_json::json!(chapter));
            }
            if let Some(progress) = update.chapter_progress {
                obj.insert("chapterProgress".to_owned(), serde_json::json!(progress));
            }
        }
        body
    }
}

#[async_trait]
impl BookmarkSyncProtocol for HttpBookmarkSyncProtocol {
    async fn update_bookmark(&self, update: &BookmarkUpdate) -> anyhow::Result<()> {
        let endpoint = work_endpoint(&self.base_url, &["bookmarks", update.work_id.as_str()])?;
        let response = self
            .client
            .post(endpoint.clone())
            .json(&self.body(update))
            .send()
            .await
            .with_context(|| format!("POST {endpoint}"))?;

        let status = response.status();
        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            let message = error_message(&raw).unwrap_or(raw);
            anyhow::bail!("bookmark update failed ({status}): {}", message.trim());
        }
        Ok(())
    }
}
