use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::model::TotalChapters;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Directory holding the progress store.
    #[arg(
        long,
        global = true,
        env = "CHAPTERWATCH_DATA_DIR",
        default_value = ".chapterwatch"
    )]
    pub data_dir: PathBuf,

    /// Raise log verbosity (`-v` debug, `-vv` trace). `RUST_LOG` wins when set.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List tracked works, most recently updated first.
    List,
    /// Print one work record as JSON.
    Show(WorkArgs),
    /// Print storage statistics.
    Stats,
    /// Record reading progress for a chapter.
    Progress(ProgressArgs),
    /// Set the read percentage of a single chapter.
    SetChapter(SetChapterArgs),
    /// Mark every chapter of a work read or unread.
    MarkAll(MarkAllArgs),
    /// Mark a work completed.
    Complete(WorkArgs),
    /// Stop tracking a work.
    Delete(WorkArgs),
    Export(ExportArgs),
    /// Import a snapshot or legacy NDJSON file.
    Import(ImportArgs),
    /// Check the site for new chapters.
    Check(CheckArgs),
    /// Push a work's progress to the bookmark service now.
    Sync(SyncArgs),
    /// Delete completed works past the retention delay.
    Cleanup,
    /// Run periodic update checks and auto-flush until interrupted.
    Watch(WatchArgs),
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum SettingsCommand {
    Show,
    /// Set one field by its camelCase name, e.g. `syncWithBookmarks true`.
    Set(SettingsSetArgs),
}

#[derive(Debug, Args)]
pub struct WorkArgs {
    pub work_id: String,
}

#[derive(Debug, Args)]
pub struct ProgressArgs {
    pub work_id: String,

    /// 1-based chapter number.
    pub chapter: u32,

    /// Read percentage; rounded and clamped into 0..=100.
    #[arg(allow_negative_numbers = true)]
    pub percent: f64,

    /// Site chapter id (defaults to a placeholder).
    #[arg(long)]
    pub chapter_id: Option<String>,

    #[arg(long)]
    pub title: Option<String>,

    /// Index of the last visible paragraph.
    #[arg(long)]
    pub paragraph: Option<u32>,

    /// Chapters currently published.
    #[arg(long)]
    pub available: Option<u32>,

    /// Declared eventual total, or `?` when unknown.
    #[arg(long, value_parser = parse_total)]
    pub total: Option<TotalChapters>,

    /// Bookmark service base URL; progress is synced when bookmark sync is enabled.
    #[arg(long, env = "CHAPTERWATCH_SYNC_URL")]
    pub sync_url: Option<String>,
}

#[derive(Debug, Args)]
pub struct SetChapterArgs {
    pub work_id: String,
    pub chapter: u32,
    #[arg(allow_negative_numbers = true)]
    pub percent: f64,
}

#[derive(Debug, Args)]
pub struct MarkAllArgs {
    pub work_id: String,

    #[arg(long, conflicts_with = "unread", required_unless_present = "unread")]
    pub read: bool,

    #[arg(long)]
    pub unread: bool,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    /// Write the legacy single-stream NDJSON instead of a snapshot.
    #[arg(long)]
    pub legacy: bool,

    /// Output file (defaults to stdout).
    #[arg(long)]
    pub out: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    pub file: PathBuf,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    /// Check only this work (defaults to every unfinished work).
    pub work_id: Option<String>,

    /// Base URL serving `works/<id>/chapters.json`.
    #[arg(long, env = "CHAPTERWATCH_SITE_URL")]
    pub site_url: String,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    #[arg(long, env = "CHAPTERWATCH_SITE_URL")]
    pub site_url: String,

    /// Seconds before the first update check.
    #[arg(long, default_value_t = 0)]
    pub first_check_after: u64,
}

#[derive(Debug, Args)]
pub struct SyncArgs {
    pub work_id: String,

    #[arg(long, env = "CHAPTERWATCH_SYNC_URL")]
    pub sync_url: String,
}

#[derive(Debug, Args)]
pub struct SettingsSetArgs {
    pub key: String,

    /// JSON value; bare words are taken as strings.
    pub value: String,
}

fn parse_total(raw: &str) -> Result<TotalChapters, String> {
    TotalChapters::parse(raw).map_err(|err| err.to_string())
}
