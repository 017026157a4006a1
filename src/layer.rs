//! Identities of the layers under comparison and the encodings they answer with.
//!
//! The set of layers a deployment can name is closed: adding a layer means
//! adding one variant here. Which layers take part in a run, and how they are
//! paired, is configuration (see [`crate::config::HarnessConfig`]).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LayerId {
    /// Public Kubo HTTP gateway, the usual trusted reference.
    #[serde(rename = "kubo")]
    Kubo,
    #[serde(rename = "lassie")]
    Lassie,
    #[serde(rename = "l1-shim")]
    L1Shim,
    #[serde(rename = "l1-nginx")]
    L1Nginx,
    #[serde(rename = "bifrost")]
    Bifrost,
}

impl LayerId {
    pub const ALL: [LayerId; 5] = [
        LayerId::Kubo,
        LayerId::Lassie,
        LayerId::L1Shim,
        LayerId::L1Nginx,
        LayerId::Bifrost,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LayerId::Kubo => "kubo",
            LayerId::Lassie => "lassie",
            LayerId::L1Shim => "l1-shim",
            LayerId::L1Nginx => "l1-nginx",
            LayerId::Bifrost => "bifrost",
        }
    }

    /// Human-readable name used in console summaries.
    pub fn label(self) -> &'static str {
        match self {
            LayerId::Kubo => "Kubo GW",
            LayerId::Lassie => "Lassie",
            LayerId::L1Shim => "L1 Shim",
            LayerId::L1Nginx => "L1 Nginx",
            LayerId::Bifrost => "Bifrost",
        }
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayerId {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        LayerId::ALL
            .into_iter()
            .find(|layer| layer.as_str() == value)
            .ok_or_else(|| format!("unknown layer '{value}'"))
    }
}

/// Shape of a layer's successful response body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// Canonical file bytes; compared as-is.
    #[default]
    Raw,
    /// Content-addressed archive that must be decoded before comparison.
    Car,
}

impl Encoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Raw => "raw",
            Encoding::Car => "car",
        }
    }

    pub fn is_canonical(self) -> bool {
        matches!(self, Encoding::Raw)
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered comparison: `candidate` is judged against `reference`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LayerPair {
    pub reference: LayerId,
    pub candidate: LayerId,
}

impl LayerPair {
    pub fn new(reference: LayerId, candidate: LayerId) -> Self {
        Self {
            reference,
            candidate,
        }
    }

    /// Stable key used for report file names and JSON object keys.
    pub fn key(&self) -> String {
        format!("{}-{}", self.reference, self.candidate)
    }

    pub fn contains(&self, layer: LayerId) -> bool {
        self.reference == layer || self.candidate == layer
    }
}

impl fmt::Display for LayerPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} <> {}",
            self.reference.label(),
            self.candidate.label()
        )
    }
}
