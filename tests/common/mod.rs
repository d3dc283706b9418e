//! Shared test harness: an in-process HTTP origin serving manifests and
//! segment payloads on a random port.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Once};

use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Router;
use parking_lot::RwLock;

use reelcache::FeedItem;

type ResponseMap = Arc<RwLock<HashMap<String, (StatusCode, Vec<u8>)>>>;

/// A fake CDN origin. Paths not registered answer 404, which the engine
/// treats as "no manifest" on probe paths.
pub struct TestOrigin {
    addr: SocketAddr,
    responses: ResponseMap,
}

async fn serve_path(State(responses): State<ResponseMap>, uri: Uri) -> impl IntoResponse {
    match responses.read().get(uri.path()) {
        Some((status, body)) => (*status, body.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

static INIT_TRACING: Once = Once::new();

/// Route engine logs through `RUST_LOG` during tests.
fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

impl TestOrigin {
    pub async fn start() -> Self {
        init_tracing();
        let responses: ResponseMap = Arc::new(RwLock::new(HashMap::new()));
        let app = Router::new()
            .fallback(serve_path)
            .with_state(Arc::clone(&responses));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, responses }
    }

    pub fn uri(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.uri(), path)
    }

    pub fn put_bytes(&self, path: &str, body: impl Into<Vec<u8>>) {
        self.responses
            .write()
            .insert(path.to_string(), (StatusCode::OK, body.into()));
    }

    pub fn put_json(&self, path: &str, value: serde_json::Value) {
        self.put_bytes(path, serde_json::to_vec(&value).unwrap());
    }

    pub fn put_status(&self, path: &str, status: StatusCode) {
        self.responses
            .write()
            .insert(path.to_string(), (status, Vec::new()));
    }

    pub fn remove(&self, path: &str) {
        self.responses.write().remove(path);
    }

    /// Register a segmented video: a manifest next to the source location
    /// plus one payload per segment. Segment `i` is filled with the letter
    /// `'a' + i`, so the assembled artifact's content is checkable.
    /// Returns the feed item and the expected full concatenation.
    pub fn segmented_video(
        &self,
        id: &str,
        segment_sizes: &[usize],
        segment_duration_secs: f64,
    ) -> (FeedItem, Vec<u8>) {
        let source_path = format!("/videos/{id}.mp4");

        let mut declared = Vec::new();
        let mut full = Vec::new();
        for (index, size) in segment_sizes.iter().enumerate() {
            let path = format!("/videos/{id}/seg{index}.m4s");
            let body = vec![b'a' + (index as u8 % 26); *size];
            full.extend_from_slice(&body);
            declared.push(serde_json::json!({
                "index": index,
                "url": self.url(&path),
                "size_bytes": size,
            }));
            self.put_bytes(&path, body);
        }

        self.put_json(
            &format!("{source_path}.manifest.json"),
            serde_json::json!({
                "segment_duration_secs": segment_duration_secs,
                "segments": declared,
            }),
        );

        let item = FeedItem::new(
            id,
            self.url(&source_path),
            self.url(&format!("/posters/{id}.jpg")),
        );
        (item, full)
    }

    /// Register a plain single-file video with no manifest; the probe 404s
    /// and the engine falls back to one synthetic segment.
    pub fn plain_video(&self, id: &str, body: &[u8]) -> FeedItem {
        let source_path = format!("/videos/{id}.mp4");
        self.put_bytes(&source_path, body.to_vec());
        FeedItem::new(
            id,
            self.url(&source_path),
            self.url(&format!("/posters/{id}.jpg")),
        )
    }

    /// A feed item whose source (and manifest probe) always answers 404.
    pub fn missing_video(&self, id: &str) -> FeedItem {
        FeedItem::new(
            id,
            self.url(&format!("/videos/{id}.mp4")),
            self.url(&format!("/posters/{id}.jpg")),
        )
    }
}
