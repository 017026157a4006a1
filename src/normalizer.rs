//! Content normalization seam.
//!
//! Layers that answer with a content-addressed archive have to be decoded to
//! canonical file bytes before their body can be compared with a layer that
//! serves the file directly. The decoder itself lives outside this crate; the
//! consistency engine only sees [`ContentNormalizer`].

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::layer::Encoding;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed container: {0}")]
    MalformedContainer(String),
    #[error("unsupported root type: {0}")]
    UnsupportedRoot(String),
    #[error("content absent from container: {0}")]
    ContentAbsent(String),
    #[error("decoder unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ContentNormalizer: Send + Sync {
    async fn normalize(&self, body: Bytes, encoding: Encoding) -> Result<Bytes, DecodeError>;
}

/// Exit codes a decoder command uses to classify its failure.
const EXIT_MALFORMED: i32 = 2;
const EXIT_UNSUPPORTED_ROOT: i32 = 3;
const EXIT_CONTENT_ABSENT: i32 = 4;

/// Pipes the body through an external decoder: archive on stdin, file bytes on stdout.
///
/// A decoder that has not exited within `deadline` is killed and the body is
/// reported as [`DecodeError::Unavailable`].
#[derive(Clone, Debug)]
pub struct CommandNormalizer {
    program: String,
    args: Vec<String>,
    deadline: Duration,
}

impl CommandNormalizer {
    pub fn new(program: impl Into<String>, args: Vec<String>, deadline: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            deadline,
        }
    }

    /// Builds a normalizer from `[program, args...]`.
    pub fn from_argv(argv: &[String], deadline: Duration) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.to_vec(), deadline))
    }
}

#[async_trait]
impl ContentNormalizer for CommandNormalizer {
    async fn normalize(&self, body: Bytes, encoding: Encoding) -> Result<Bytes, DecodeError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("ONION_ENCODING", encoding.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| DecodeError::Unavailable(format!("spawn {}: {err}", self.program)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DecodeError::Unavailable("decoder stdin unavailable".to_string()))?;
        let feed = async move {
            let written = stdin.write_all(&body).await;
            drop(stdin);
            written
        };

        // Dropping the timed-out future drops the child, which kills it.
        let (write_result, output) =
            match timeout(self.deadline, async { tokio::join!(feed, child.wait_with_output()) }).await {
                Ok(finished) => finished,
                Err(_) => {
                    return Err(DecodeError::Unavailable(format!(
                        "decoder {} did not finish within {:?}",
                        self.program, self.deadline
                    )))
                }
            };
        let output =
            output.map_err(|err| DecodeError::Unavailable(format!("wait for decoder: {err}")))?;

        if output.status.success() {
            if let Err(err) = write_result {
                return Err(DecodeError::Unavailable(format!(
                    "decoder exited before reading input: {err}"
                )));
            }
            return Ok(Bytes::from(output.stdout));
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(match output.status.code() {
            Some(EXIT_MALFORMED) => DecodeError::MalformedContainer(stderr),
            Some(EXIT_UNSUPPORTED_ROOT) => DecodeError::UnsupportedRoot(stderr),
            Some(EXIT_CONTENT_ABSENT) => DecodeError::ContentAbsent(stderr),
            Some(code) => DecodeError::Unavailable(format!("decoder exited with {code}: {stderr}")),
            None => DecodeError::Unavailable(format!("decoder terminated by signal: {stderr}")),
        })
    }
}

/// Maps each non-canonical encoding to the normalizer that decodes it.
#[derive(Clone, Default)]
pub struct NormalizerRegistry {
    normalizers: BTreeMap<Encoding, Arc<dyn ContentNormalizer>>,
}

impl NormalizerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, encoding: Encoding, normalizer: Arc<dyn ContentNormalizer>) {
        self.normalizers.insert(encoding, normalizer);
    }

    pub fn with(mut self, encoding: Encoding, normalizer: Arc<dyn ContentNormalizer>) -> Self {
        self.register(encoding, normalizer);
        self
    }

    /// Canonical bytes for `body`. Canonical encodings skip normalization.
    pub async fn normalize(&self, body: &Bytes, encoding: Encoding) -> Result<Bytes, DecodeError> {
        if encoding.is_canonical() {
            return Ok(body.clone());
        }
        match self.normalizers.get(&encoding) {
            Some(normalizer) => normalizer.normalize(body.clone(), encoding).await,
            None => Err(DecodeError::Unavailable(format!(
                "no normalizer registered for {encoding}"
            ))),
        }
    }
}

impl std::fmt::Debug for NormalizerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NormalizerRegistry")
            .field("encodings", &self.normalizers.keys().collect::<Vec<_>>())
            .finish()
    }
}
