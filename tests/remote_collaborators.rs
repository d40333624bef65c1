mod site_stub;

use std::collections::HashMap;
use std::path::Path;

use predicates::prelude::*;
use serde_json::{Value, json};
use site_stub::SiteStub;

fn chapterwatch(data_dir: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("chapterwatch");
    cmd.env_remove("CHAPTERWATCH_SYNC_URL")
        .env_remove("CHAPTERWATCH_SITE_URL")
        .env_remove("RUST_LOG")
        .arg("--data-dir")
        .arg(data_dir);
    cmd
}

fn chapter_list(title: &str, count: usize, total: Value) -> Value {
    let chapters: Vec<Value> = (1..=count)
        .map(|n| {
            json!({
                "chapterId": format!("c{n}"),
                "title": format!("Chapter {n}"),
                "publishedDate": format!("2024-02-{n:02}"),
            })
        })
        .collect();
    json!({ "title": title, "chapters": chapters, "totalChapters": total })
}

fn show(data_dir: &Path, work_id: &str) -> Value {
    let output = chapterwatch(data_dir)
        .args(["show", work_id])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("show prints json")
}

#[test]
fn check_reconciles_new_chapters_and_reports_failures() {
    let stub = SiteStub::spawn(
        HashMap::from([("w1".to_owned(), chapter_list("Renamed", 3, json!("?")))]),
        vec!["w2".to_owned()],
    );
    let dir = tempfile::tempdir().expect("tempdir");
    let data = dir.path();

    for work in ["w1", "w2"] {
        chapterwatch(data)
            .args(["progress", work, "1", "50", "--chapter-id", "c1"])
            .assert()
            .success();
    }
    chapterwatch(data)
        .args(["settings", "set", "politenessDelayMs", "0"])
        .assert()
        .success();

    chapterwatch(data)
        .args(["check", "w1", "--site-url", stub.base_url.as_str()])
        .assert()
        .success()
        .stdout("w1\t3 chapters\tnew chapters\n");

    let work = show(data, "w1");
    assert_eq!(work["title"], "Renamed");
    assert_eq!(work["availableChapters"], 3);
    assert_eq!(work["isWorkInProgress"], true);
    assert_eq!(work["chapters"]["1"]["percentRead"], 50);
    assert_eq!(work["chapterMetadata"]["c3"]["publishedDate"], "2024-02-03");
    assert!(work["lastChecked"].as_i64().is_some());

    chapterwatch(data)
        .args(["check", "--site-url", stub.base_url.as_str()])
        .assert()
        .success()
        .stdout("checked 2\twith new chapters 0\tfailed 1\n")
        .stderr(predicate::str::contains("update check failed"));

    chapterwatch(data)
        .args(["check", "w2", "--site-url", stub.base_url.as_str()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("upstream exploded"));
    chapterwatch(data)
        .args(["check", "ghost", "--site-url", stub.base_url.as_str()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("work not found: ghost"));
}

#[test]
fn progress_syncs_bookmark_once_per_threshold() {
    let stub = SiteStub::spawn(HashMap::new(), Vec::new());
    let dir = tempfile::tempdir().expect("tempdir");
    let data = dir.path();

    for (key, value) in [("syncWithBookmarks", "true"), ("rateLimitDelayMs", "0")] {
        chapterwatch(data)
            .args(["settings", "set", key, value])
            .assert()
            .success();
    }

    for percent in ["30", "40", "100"] {
        chapterwatch(data)
            .args(["progress", "w1", "1", percent, "--chapter-id", "c1"])
            .args(["--available", "2", "--total", "4", "--sync-url", stub.base_url.as_str()])
            .assert()
            .success();
    }

    let posts = stub.posts();
    assert_eq!(posts.len(), 2, "40% is below the next threshold after 30%");
    assert_eq!(posts[0].path, "/api/bookmarks/w1");
    assert_eq!(posts[0].body["chapterNumber"], 1);
    assert_eq!(posts[0].body["chapterProgress"], 30);
    assert_eq!(posts[0].body["tag"], "Reading Progress: Not started");
    assert_eq!(posts[1].body["chapterProgress"], 100);
    assert_eq!(posts[1].body["readChapters"], 1);
    assert_eq!(posts[1].body["percentComplete"], 25);
    assert_eq!(
        posts[1].body["tag"],
        "Reading Progress: 1/4 chapters (25 Percent)"
    );
}

#[test]
fn manual_sync_reports_disabled_and_remote_failures() {
    let stub = SiteStub::spawn(HashMap::new(), vec!["w2".to_owned()]);
    let dir = tempfile::tempdir().expect("tempdir");
    let data = dir.path();

    for work in ["w1", "w2"] {
        chapterwatch(data)
            .args(["progress", work, "1", "60"])
            .assert()
            .success();
    }

    chapterwatch(data)
        .args(["sync", "w1", "--sync-url", stub.base_url.as_str()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("bookmark sync is disabled"));
    assert!(stub.posts().is_empty());

    chapterwatch(data)
        .args(["settings", "set", "syncWithBookmarks", "true"])
        .assert()
        .success();
    chapterwatch(data)
        .args(["sync", "w1", "--sync-url", stub.base_url.as_str()])
        .assert()
        .success()
        .stdout("w1\tsynced\n");
    let posts = stub.posts();
    assert_eq!(posts.len(), 1);
    assert!(posts[0].body.get("chapterNumber").is_none());
    assert_eq!(posts[0].body["totalChapters"], 1);

    chapterwatch(data)
        .args(["sync", "w2", "--sync-url", stub.base_url.as_str()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("bookmark locked"));
}
