use std::collections::HashMap;
use std::io::Read as _;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::Value;

#[derive(Debug, Clone)]
pub struct RecordedPost {
    pub path: String,
    pub body: Value,
}

/// Serves `/api/works/<id>/chapters.json` from a fixed table and records
/// `POST /api/bookmarks/<id>`. Works listed in `failing` answer 500.
pub struct SiteStub {
    pub base_url: String,
    posts: Arc<Mutex<Vec<RecordedPost>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SiteStub {
    pub fn spawn(chapter_lists: HashMap<String, Value>, failing: Vec<String>) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start site stub server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}/api");
        let posts = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&posts);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let mut request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let method = request.method().clone();
                let path = request.url().to_string();
                let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
                let (status, body) = match (&method, segments.as_slice()) {
                    (tiny_http::Method::Get, ["api", "works", id, "chapters.json"]) => {
                        if failing.iter().any(|f| f == id) {
                            (500, r#"{"error":"upstream exploded"}"#.to_owned())
                        } else {
                            match chapter_lists.get(*id) {
                                Some(list) => (200, list.to_string()),
                                None => (404, r#"{"error":"no such work"}"#.to_owned()),
                            }
                        }
                    }
                    (tiny_http::Method::Post, ["api", "bookmarks", id]) => {
                        let failed = failing.iter().any(|f| f == id);
                        let mut raw = String::new();
                        let parsed = request
                            .as_reader()
                            .read_to_string(&mut raw)
                            .ok()
                            .and_then(|_| serde_json::from_str::<Value>(&raw).ok());
                        match parsed {
                            Some(body) if !failed => {
                                recorded.lock().expect("lock posts").push(RecordedPost {
                                    path: path.clone(),
                                    body,
                                });
                                (200, "{}".to_owned())
                            }
                            Some(_) => (500, r#"{"error":{"message":"bookmark locked"}}"#.to_owned()),
                            None => (400, "invalid json".to_owned()),
                        }
                    }
                    _ => (404, "not found".to_owned()),
                };

                let header =
                    tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                        .expect("build header");
                let response = tiny_http::Response::from_string(body)
                    .with_status_code(status)
                    .with_header(header);
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            posts,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn posts(&self) -> Vec<RecordedPost> {
        self.posts.lock().expect("lock posts").clone()
    }
}

impl Drop for SiteStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
