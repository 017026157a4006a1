//! Logical requests and how they are derived from a replay log.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use reqwest::Url;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::config::{Endpoint, HarnessConfig, ReplayConfig};
use crate::errors::{HarnessError, HarnessResult};
use crate::layer::LayerId;

/// One piece of content, tested identically against every configured layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogicalRequest {
    path: String,
    targets: BTreeMap<LayerId, String>,
}

impl LogicalRequest {
    pub fn new(path: impl Into<String>, targets: BTreeMap<LayerId, String>) -> Self {
        Self {
            path: path.into(),
            targets,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn target(&self, layer: LayerId) -> Option<&str> {
        self.targets.get(&layer).map(String::as_str)
    }

    pub fn target_urls(&self) -> &BTreeMap<LayerId, String> {
        &self.targets
    }

    pub fn targets(&self) -> impl Iterator<Item = (LayerId, &str)> {
        self.targets
            .iter()
            .map(|(layer, url)| (*layer, url.as_str()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("invalid source url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("source url '{0}' has no content path")]
    MissingPath(String),
    #[error("cannot rewrite '{url}' for layer {layer}: {reason}")]
    Rewrite {
        layer: LayerId,
        url: String,
        reason: String,
    },
}

/// Maps one source request to one URL per layer under test.
pub trait TargetResolver: Send + Sync {
    fn resolve(&self, source: &str) -> Result<LogicalRequest, ResolveError>;
}

#[derive(Clone, Debug)]
struct LayerRoute {
    layer: LayerId,
    endpoint: Endpoint,
    scheme: Option<String>,
    strip_query: bool,
    extra_query: Vec<String>,
}

/// Rewrites the host (and optionally scheme and query) of the source URL per layer.
#[derive(Clone, Debug)]
pub struct EndpointResolver {
    routes: Vec<LayerRoute>,
}

impl EndpointResolver {
    pub fn from_config(config: &HarnessConfig) -> HarnessResult<Self> {
        let routes = config
            .layers
            .iter()
            .map(|layer| {
                Ok(LayerRoute {
                    layer: layer.id,
                    endpoint: layer.endpoint()?,
                    scheme: layer.scheme.clone(),
                    strip_query: layer.strip_query,
                    extra_query: layer.extra_query.clone(),
                })
            })
            .collect::<HarnessResult<Vec<_>>>()?;
        Ok(Self { routes })
    }

    fn rewrite(&self, route: &LayerRoute, source: &Url) -> Result<String, ResolveError> {
        let rewrite_error = |reason: String| ResolveError::Rewrite {
            layer: route.layer,
            url: source.to_string(),
            reason,
        };

        let mut url = source.clone();
        if let Some(scheme) = route.scheme.as_deref() {
            url.set_scheme(scheme)
                .map_err(|_| rewrite_error(format!("cannot switch scheme to {scheme}")))?;
        }
        url.set_host(Some(&route.endpoint.host))
            .map_err(|err| rewrite_error(err.to_string()))?;
        url.set_port(route.endpoint.port)
            .map_err(|_| rewrite_error("cannot set port".to_string()))?;
        if route.strip_query {
            url.set_query(None);
        }
        if !route.extra_query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for param in &route.extra_query {
                match param.split_once('=') {
                    Some((key, value)) => pairs.append_pair(key, value),
                    None => pairs.append_key_only(param),
                };
            }
        }
        Ok(url.to_string())
    }
}

impl TargetResolver for EndpointResolver {
    fn resolve(&self, source: &str) -> Result<LogicalRequest, ResolveError> {
        let url = Url::parse(source).map_err(|err| ResolveError::InvalidUrl {
            url: source.to_string(),
            reason: err.to_string(),
        })?;
        let path = url.path();
        if path.is_empty() || path == "/" {
            return Err(ResolveError::MissingPath(source.to_string()));
        }

        let mut targets = BTreeMap::new();
        for route in &self.routes {
            targets.insert(route.layer, self.rewrite(route, &url)?);
        }
        Ok(LogicalRequest::new(path, targets))
    }
}

pub fn read_replay_log(path: &Path, config: &ReplayConfig) -> HarnessResult<Vec<String>> {
    let file = File::open(path).map_err(|err| {
        HarnessError::ReplayLog(format!("failed to open {}: {err}", path.display()))
    })?;
    parse_replay_log(BufReader::new(file), config)
}

/// Extracts source URLs from a tab-separated replay log.
pub fn parse_replay_log<R: BufRead>(reader: R, config: &ReplayConfig) -> HarnessResult<Vec<String>> {
    let mut urls = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line_number = index + 1;
        let line = line.map_err(|err| {
            HarnessError::ReplayLog(format!("failed to read line {line_number}: {err}"))
        })?;
        if line.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').collect();
        let url = fields.get(config.url_field).ok_or_else(|| {
            HarnessError::ReplayLog(format!(
                "line {line_number} has {} fields; expected the url in field {}",
                fields.len(),
                config.url_field
            ))
        })?;
        let url = url.trim();
        if url.is_empty() {
            return Err(HarnessError::ReplayLog(format!(
                "line {line_number} has an empty source url"
            )));
        }
        if config
            .skip_substrings
            .iter()
            .any(|needle| url.contains(needle.as_str()))
        {
            continue;
        }
        urls.push(url.to_string());
    }
    Ok(urls)
}

/// Resolves up to `count` requests with unique paths, in log order.
pub fn build_requests(
    sources: &[String],
    resolver: &dyn TargetResolver,
    count: usize,
) -> HarnessResult<Vec<LogicalRequest>> {
    let mut seen = BTreeSet::new();
    let mut requests = Vec::with_capacity(count);
    for source in sources {
        if requests.len() == count {
            break;
        }
        let request = match resolver.resolve(source) {
            Ok(request) => request,
            Err(err) => {
                warn!(target = "onion::request", "skipping source request: {err}");
                continue;
            }
        };
        if seen.insert(request.path().to_string()) {
            requests.push(request);
        }
    }

    if requests.len() < count {
        return Err(HarnessError::ReplayLog(format!(
            "not enough unique requests: requested {count}, available {}",
            requests.len()
        )));
    }
    Ok(requests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn resolver() -> EndpointResolver {
        let config = HarnessConfig::from_toml(
            r#"
[[layers]]
id = "kubo"
endpoint = "ipfs.io"
scheme = "https"
strip_query = true

[[layers]]
id = "lassie"
endpoint = "10.0.0.2:7766"
scheme = "http"

[[layers]]
id = "l1-shim"
endpoint = "10.0.0.3:3000"
scheme = "http"
extra_query = ["nocache=1"]
"#,
        )
        .unwrap();
        EndpointResolver::from_config(&config).unwrap()
    }

    #[test]
    fn rewrites_host_scheme_and_query_per_layer() {
        let request = resolver()
            .resolve("https://203.0.113.9/ipfs/bafyabc/file.txt?format=car&dag-scope=entity")
            .unwrap();
        assert_eq!(request.path(), "/ipfs/bafyabc/file.txt");
        assert_eq!(
            request.target(LayerId::Kubo),
            Some("https://ipfs.io/ipfs/bafyabc/file.txt")
        );
        assert_eq!(
            request.target(LayerId::Lassie),
            Some("http://10.0.0.2:7766/ipfs/bafyabc/file.txt?format=car&dag-scope=entity")
        );
        assert_eq!(
            request.target(LayerId::L1Shim),
            Some("http://10.0.0.3:3000/ipfs/bafyabc/file.txt?format=car&dag-scope=entity&nocache=1")
        );
        assert_eq!(request.target(LayerId::L1Nginx), None);
    }

    #[test]
    fn rejects_urls_without_paths() {
        assert_eq!(
            resolver().resolve("https://203.0.113.9/").unwrap_err(),
            ResolveError::MissingPath("https://203.0.113.9/".to_string())
        );
        assert!(matches!(
            resolver().resolve("not a url"),
            Err(ResolveError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn replay_log_extracts_configured_field_and_skips_filtered_urls() {
        let config = ReplayConfig {
            url_field: 2,
            skip_substrings: vec!["ipfs-404".to_string()],
        };
        let log = "a\tb\thttps://h/ipfs/one\n\na\tb\thttps://ipfs-404.example/ipfs/two\na\tb\thttps://h/ipfs/three\n";
        let urls = parse_replay_log(Cursor::new(log), &config).unwrap();
        assert_eq!(urls, vec!["https://h/ipfs/one", "https://h/ipfs/three"]);
    }

    #[test]
    fn replay_log_rejects_short_lines_and_empty_urls() {
        let config = ReplayConfig {
            url_field: 2,
            skip_substrings: Vec::new(),
        };
        let err = parse_replay_log(Cursor::new("a\tb\n"), &config).unwrap_err();
        assert!(err.to_string().contains("line 1 has 2 fields"), "{err}");
        let err = parse_replay_log(Cursor::new("a\tb\t \n"), &config).unwrap_err();
        assert!(err.to_string().contains("empty source url"), "{err}");
    }

    #[test]
    fn build_requests_dedupes_paths_and_enforces_count() {
        let sources = vec![
            "https://h/ipfs/one?format=car".to_string(),
            "https://h/ipfs/one?format=raw".to_string(),
            "::garbage::".to_string(),
            "https://h/ipfs/two".to_string(),
            "https://h/ipfs/three".to_string(),
        ];
        let resolver = resolver();
        let requests = build_requests(&sources, &resolver, 2).unwrap();
        let paths: Vec<_> = requests.iter().map(LogicalRequest::path).collect();
        assert_eq!(paths, vec!["/ipfs/one", "/ipfs/two"]);

        let err = build_requests(&sources, &resolver, 4).unwrap_err();
        assert!(err.to_string().contains("requested 4, available 3"), "{err}");
    }
}
