use std::process::ExitCode;

use anyhow::Context as _;
use chapterwatch::cli::{Cli, Command, SettingsCommand};
use chapterwatch::commands;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    chapterwatch::logging::init(cli.verbose).context("init logging")?;
    tracing::debug!(?cli, "parsed cli");
    let data_dir = cli.data_dir.as_path();

    match cli.command {
        Command::List => commands::list(data_dir).await.context("list")?,
        Command::Show(args) => commands::show(data_dir, args).await.context("show")?,
        Command::Stats => commands::stats(data_dir).await.context("stats")?,
        Command::Progress(args) => commands::progress(data_dir, args)
            .await
            .context("progress")?,
        Command::SetChapter(args) => commands::set_chapter(data_dir, args)
            .await
            .context("set-chapter")?,
        Command::MarkAll(args) => commands::mark_all(data_dir, args)
            .await
            .context("mark-all")?,
        Command::Complete(args) => commands::complete(data_dir, args)
            .await
            .context("complete")?,
        Command::Delete(args) => commands::delete(data_dir, args).await.context("delete")?,
        Command::Export(args) => commands::export(data_dir, args).await.context("export")?,
        Command::Import(args) => commands::import(data_dir, args).await.context("import")?,
        Command::Check(args) => commands::check(data_dir, args).await.context("check")?,
        Command::Sync(args) => commands::sync_work(data_dir, args).await.context("sync")?,
        Command::Cleanup => commands::cleanup(data_dir).await.context("cleanup")?,
        Command::Watch(args) => commands::watch(data_dir, args).await.context("watch")?,
        Command::Settings {
            command: SettingsCommand::Show,
        } => commands::settings_show(data_dir)
            .await
            .context("settings show")?,
        Command::Settings {
            command: SettingsCommand::Set(args),
        } => commands::settings_set(data_dir, args)
            .await
            .context("settings set")?,
    }

    Ok(())
}
