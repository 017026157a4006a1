use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::consistency::{Comparison, ComparisonGraph, ComparisonMode};
use crate::errors::{HarnessError, HarnessResult};
use crate::layer::{Encoding, LayerId, LayerPair};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default)]
    pub mode: ComparisonMode,
    /// Shape of the comparison graph when no `[[comparisons]]` are listed.
    #[serde(default)]
    pub topology: Topology,
    #[serde(default)]
    pub replay: ReplayConfig,
    pub layers: Vec<LayerConfig>,
    #[serde(default)]
    pub comparisons: Vec<ComparisonConfig>,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub provider_lookup: Option<ProviderLookupConfig>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    /// Every layer against the first one.
    #[default]
    Star,
    /// Every layer against the one listed before it.
    Chain,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayerConfig {
    pub id: LayerId,
    /// `host` or `host:port` substituted into every source URL.
    pub endpoint: String,
    #[serde(default)]
    pub scheme: Option<String>,
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default)]
    pub strip_query: bool,
    #[serde(default)]
    pub extra_query: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComparisonConfig {
    pub reference: LayerId,
    pub candidate: LayerId,
    #[serde(default = "default_true")]
    pub content: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplayConfig {
    #[serde(default = "default_url_field")]
    pub url_field: usize,
    #[serde(default = "default_skip_substrings")]
    pub skip_substrings: Vec<String>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            url_field: default_url_field(),
            skip_substrings: default_skip_substrings(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NormalizerConfig {
    /// Decoder command for `car` bodies: reads the archive on stdin, writes file bytes to stdout.
    #[serde(default)]
    pub car_command: Option<Vec<String>>,
    /// A decoder still running after this long is killed and the body counts as a decode error.
    #[serde(default = "default_decode_timeout_secs")]
    pub decode_timeout_secs: u64,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            car_command: None,
            decode_timeout_secs: default_decode_timeout_secs(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub push_gateway: String,
    #[serde(default = "default_metrics_job")]
    pub job: String,
}

/// Classifies mismatched content ids by the providers an indexer knows for them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderLookupConfig {
    #[serde(default = "default_lookup_endpoint")]
    pub endpoint: String,
    /// Tries per content id before it is counted as unresolved.
    #[serde(default = "default_lookup_attempts")]
    pub attempts: u32,
    #[serde(default = "default_lookup_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_lookup_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    5
}

fn default_request_timeout_secs() -> u64 {
    180
}

fn default_pool_max_idle_per_host() -> usize {
    1_000
}

fn default_true() -> bool {
    true
}

fn default_url_field() -> usize {
    20
}

fn default_skip_substrings() -> Vec<String> {
    vec!["ipfs-404".to_string()]
}

fn default_metrics_job() -> String {
    "onion".to_string()
}

fn default_decode_timeout_secs() -> u64 {
    60
}

fn default_lookup_endpoint() -> String {
    "https://cid.contact".to_string()
}

fn default_lookup_attempts() -> u32 {
    3
}

fn default_lookup_retry_delay_ms() -> u64 {
    1_000
}

fn default_lookup_concurrency() -> usize {
    8
}

fn http_url(field: &str, raw: &str) -> HarnessResult<Url> {
    let url = Url::parse(raw)
        .map_err(|err| HarnessError::Config(format!("invalid {field} '{raw}': {err}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(HarnessError::Config(format!(
            "{field} must be an http(s) URL, got '{raw}'"
        )));
    }
    Ok(url)
}

/// Parsed `host[:port]` of a layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: Option<u16>,
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let (host, port) = match raw.rsplit_once(':') {
            Some((host, port)) if !host.ends_with(':') => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port '{port}' in endpoint '{raw}'"))?;
                if port == 0 {
                    return Err(format!("port must be between 1 and 65535 in endpoint '{raw}'"));
                }
                (host, Some(port))
            }
            Some(_) => return Err(format!("ipv6 endpoint '{raw}' must be bracketed")),
            None => (raw, None),
        };

        if host.is_empty() {
            return Err(format!("endpoint '{raw}' has an empty host"));
        }
        if host
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '/' | '?' | '#' | '@'))
        {
            return Err(format!("endpoint '{raw}' has an invalid host"));
        }
        if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
            return Err(format!("ipv6 endpoint '{raw}' must be bracketed"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{port}", self.host),
            None => f.write_str(&self.host),
        }
    }
}

impl LayerConfig {
    pub fn endpoint(&self) -> HarnessResult<Endpoint> {
        self.endpoint
            .parse()
            .map_err(|err| HarnessError::Config(format!("layer {}: {err}", self.id)))
    }
}

impl HarnessConfig {
    pub fn load(path: &Path) -> HarnessResult<Self> {
        let content = fs::read_to_string(path).map_err(|err| {
            HarnessError::Config(format!("unable to read {}: {err}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> HarnessResult<Self> {
        toml::from_str(content)
            .map_err(|err| HarnessError::Config(format!("unable to parse config: {err}")))
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if self.layers.is_empty() {
            return Err(HarnessError::Config(
                "at least one layer must be configured".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(HarnessError::Config(
                "concurrency must be greater than zero".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(HarnessError::Config(
                "request_timeout_secs must be greater than zero".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for layer in &self.layers {
            if !seen.insert(layer.id) {
                return Err(HarnessError::Config(format!(
                    "layer {} is configured more than once",
                    layer.id
                )));
            }
            layer.endpoint()?;
            if let Some(scheme) = layer.scheme.as_deref() {
                if scheme != "http" && scheme != "https" {
                    return Err(HarnessError::Config(format!(
                        "layer {}: scheme must be http or https, got '{scheme}'",
                        layer.id
                    )));
                }
            }
        }

        let required_pool = self.concurrency.saturating_mul(self.layers.len());
        if self.pool_max_idle_per_host < required_pool {
            return Err(HarnessError::Config(format!(
                "pool_max_idle_per_host ({}) must be at least concurrency x layers ({required_pool})",
                self.pool_max_idle_per_host
            )));
        }

        let mut pairs = BTreeSet::new();
        for comparison in &self.comparisons {
            for layer in [comparison.reference, comparison.candidate] {
                if !seen.contains(&layer) {
                    return Err(HarnessError::Config(format!(
                        "comparison {}-{} references unconfigured layer {layer}",
                        comparison.reference, comparison.candidate
                    )));
                }
            }
            if comparison.reference == comparison.candidate {
                return Err(HarnessError::Config(format!(
                    "comparison must name two different layers, got {} twice",
                    comparison.reference
                )));
            }
            if !pairs.insert((comparison.reference, comparison.candidate)) {
                return Err(HarnessError::Config(format!(
                    "comparison {}-{} is configured more than once",
                    comparison.reference, comparison.candidate
                )));
            }
        }

        if self.mode == ComparisonMode::StatusAndContent && self.normalizer.car_command.is_none() {
            let encodings = self.encodings();
            let needs_decoder = self
                .comparison_graph()
                .comparisons()
                .iter()
                .filter(|comparison| comparison.content)
                .flat_map(|comparison| [comparison.pair.reference, comparison.pair.candidate])
                .any(|layer| encodings.get(&layer) == Some(&Encoding::Car));
            if needs_decoder {
                return Err(HarnessError::Config(
                    "a car-encoded layer is content-compared but normalizer.car_command is not set"
                        .to_string(),
                ));
            }
        }
        if let Some(command) = &self.normalizer.car_command {
            if command.first().map_or(true, |program| program.trim().is_empty()) {
                return Err(HarnessError::Config(
                    "normalizer.car_command must name a program".to_string(),
                ));
            }
        }
        if self.normalizer.decode_timeout_secs == 0 {
            return Err(HarnessError::Config(
                "normalizer.decode_timeout_secs must be greater than zero".to_string(),
            ));
        }

        if let Some(metrics) = &self.metrics {
            http_url("metrics push_gateway", &metrics.push_gateway)?;
            if metrics.job.trim().is_empty() {
                return Err(HarnessError::Config(
                    "metrics job must not be empty".to_string(),
                ));
            }
        }

        if let Some(lookup) = &self.provider_lookup {
            http_url("provider_lookup endpoint", &lookup.endpoint)?;
            if lookup.attempts == 0 {
                return Err(HarnessError::Config(
                    "provider_lookup attempts must be greater than zero".to_string(),
                ));
            }
            if lookup.concurrency == 0 {
                return Err(HarnessError::Config(
                    "provider_lookup concurrency must be greater than zero".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn layer_ids(&self) -> Vec<LayerId> {
        self.layers.iter().map(|layer| layer.id).collect()
    }

    pub fn encodings(&self) -> BTreeMap<LayerId, Encoding> {
        self.layers
            .iter()
            .map(|layer| (layer.id, layer.encoding))
            .collect()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn decode_timeout(&self) -> Duration {
        Duration::from_secs(self.normalizer.decode_timeout_secs)
    }

    /// Configured comparisons, or the `topology` over all layers when none are listed.
    pub fn comparison_graph(&self) -> ComparisonGraph {
        if self.comparisons.is_empty() {
            let layers = self.layer_ids();
            return match (self.topology, layers.first()) {
                (Topology::Chain, _) => ComparisonGraph::chain(&layers),
                (Topology::Star, Some(reference)) => ComparisonGraph::star(*reference, &layers),
                (Topology::Star, None) => ComparisonGraph::default(),
            };
        }
        ComparisonGraph::new(
            self.comparisons
                .iter()
                .map(|comparison| Comparison {
                    pair: LayerPair::new(comparison.reference, comparison.candidate),
                    content: comparison.content,
                })
                .collect(),
        )
    }
}
