#![allow(dead_code)]

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{StatusCode, Uri};
use axum::Router;
use bytes::Bytes;
use onion::config::HarnessConfig;
use onion::layer::Encoding;
use onion::normalizer::{ContentNormalizer, DecodeError, NormalizerRegistry};
use onion::runner::Harness;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub type Responder = Arc<dyn Fn(&str) -> (StatusCode, Vec<u8>) + Send + Sync>;

/// A local layer answering every GET through `responder`, keyed by request path.
pub struct MockLayer {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl MockLayer {
    pub async fn spawn(responder: Responder) -> Self {
        Self::spawn_with_delay(responder, None).await
    }

    pub async fn spawn_with_delay(responder: Responder, delay: Option<Duration>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock layer");
        let addr = listener.local_addr().expect("mock layer addr");
        let app = Router::new().fallback(move |uri: Uri| {
            let responder = Arc::clone(&responder);
            async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                responder(uri.path())
            }
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("mock layer server");
        });

        Self {
            addr,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }
}

impl Drop for MockLayer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.task.abort();
    }
}

pub fn fixed(status: StatusCode, body: &'static str) -> Responder {
    Arc::new(move |_path: &str| (status, body.as_bytes().to_vec()))
}

/// Answers 200 with the request path as the body.
pub fn echo_path() -> Responder {
    Arc::new(|path: &str| (StatusCode::OK, path.as_bytes().to_vec()))
}

/// Same as [`echo_path`] but wraps the body the way [`PrefixArchive`] expects.
pub fn echo_path_archived() -> Responder {
    Arc::new(|path: &str| (StatusCode::OK, format!("CAR:{path}").into_bytes()))
}

/// A layer that promises more body bytes than it sends, then hangs up.
pub async fn spawn_truncating_layer() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind truncating layer");
    let addr = listener.local_addr().expect("truncating layer addr");
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            request.extend_from_slice(&buf[..n]);
                            if request.windows(4).any(|window| window == b"\r\n\r\n") {
                                break;
                            }
                        }
                    }
                }
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 1000\r\n\r\npartial")
                    .await;
                let _ = socket.shutdown().await;
            });
        }
    });
    (addr, task)
}

/// An address nothing listens on.
pub fn closed_endpoint() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    let addr = listener.local_addr().expect("free port addr");
    drop(listener);
    addr.to_string()
}

/// Decodes bodies of the form `CAR:<payload>`.
pub struct PrefixArchive;

#[async_trait]
impl ContentNormalizer for PrefixArchive {
    async fn normalize(&self, body: Bytes, _encoding: Encoding) -> Result<Bytes, DecodeError> {
        body.strip_prefix(b"CAR:".as_slice())
            .map(Bytes::copy_from_slice)
            .ok_or_else(|| DecodeError::MalformedContainer("missing CAR: header".to_string()))
    }
}

pub struct LayerSpec {
    pub id: &'static str,
    pub endpoint: String,
    pub encoding: &'static str,
}

impl LayerSpec {
    pub fn raw(id: &'static str, endpoint: String) -> Self {
        Self {
            id,
            endpoint,
            encoding: "raw",
        }
    }

    pub fn car(id: &'static str, endpoint: String) -> Self {
        Self {
            id,
            endpoint,
            encoding: "car",
        }
    }
}

/// Every layer compared against the first one.
pub fn config_toml(layers: &[LayerSpec], concurrency: usize) -> String {
    let mut toml = format!(
        "concurrency = {concurrency}\nrequest_timeout_secs = 10\npool_max_idle_per_host = 100\n\n[replay]\nurl_field = 0\nskip_substrings = []\n\n[normalizer]\ncar_command = [\"cat\"]\n"
    );
    for layer in layers {
        toml.push_str(&format!(
            "\n[[layers]]\nid = \"{}\"\nendpoint = \"{}\"\nscheme = \"http\"\nencoding = \"{}\"\n",
            layer.id, layer.endpoint, layer.encoding
        ));
    }
    toml
}

pub fn harness(toml: &str, output_dir: &Path) -> Harness {
    configured_harness(toml, output_dir).with_normalizers(
        NormalizerRegistry::new().with(Encoding::Car, Arc::new(PrefixArchive)),
    )
}

/// A harness decoding with the `[normalizer]` command from `toml`.
pub fn configured_harness(toml: &str, output_dir: &Path) -> Harness {
    let config = HarnessConfig::from_toml(toml).expect("test config parses");
    Harness::new(config, output_dir, Uuid::nil()).expect("test config validates")
}

/// Writes a one-column replay log with one source url per path.
pub fn write_replay_log(dir: &Path, paths: &[String]) -> PathBuf {
    let file = dir.join("replay.tsv");
    let content = paths
        .iter()
        .map(|path| format!("http://source.invalid{path}\n"))
        .collect::<String>();
    fs::write(&file, content).expect("write replay log");
    file
}

pub fn content_paths(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("/ipfs/bafy{i:04}")).collect()
}
