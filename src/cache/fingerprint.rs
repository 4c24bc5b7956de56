//! Request fingerprints.
//!
//! A [`Fingerprint`] identifies an equivalence class of requests: same
//! resource, same normalized cell set, same rendering. The optional epoch pins
//! a fingerprint to one write generation of its resource so in-flight
//! coalescing never mixes data from before and after a write.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::range::{CellRange, RangeError};

/// How cell values are rendered by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RenderOption {
    #[default]
    FormattedValue,
    UnformattedValue,
    Formula,
}

impl fmt::Display for RenderOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderOption::FormattedValue => write!(f, "formatted"),
            RenderOption::UnformattedValue => write!(f, "unformatted"),
            RenderOption::Formula => write!(f, "formula"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    resource_id: String,
    range: CellRange,
    render: RenderOption,
    epoch: Option<u64>,
}

/// Key a request. Fails only when the range does not parse.
pub fn key(resource_id: &str, range: &str, render: RenderOption) -> Result<Fingerprint, RangeError> {
    Ok(Fingerprint::new(resource_id, CellRange::parse(range)?, render))
}

impl Fingerprint {
    pub fn new(resource_id: &str, range: CellRange, render: RenderOption) -> Self {
        Self {
            resource_id: resource_id.trim().to_string(),
            range,
            render,
            epoch: None,
        }
    }

    /// The same fingerprint pinned to a write epoch.
    pub fn at_epoch(&self, epoch: u64) -> Self {
        Self {
            epoch: Some(epoch),
            ..self.clone()
        }
    }

    /// The same fingerprint without an epoch, as used for cache keys.
    pub fn base(&self) -> Self {
        Self {
            epoch: None,
            ..self.clone()
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn range(&self) -> &CellRange {
        &self.range
    }

    pub fn render(&self) -> RenderOption {
        self.render
    }

    pub fn epoch(&self) -> Option<u64> {
        self.epoch
    }

    pub fn cell_count(&self) -> u64 {
        self.range.cell_count()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}[{}]", self.resource_id, self.range, self.render)?;
        if let Some(epoch) = self.epoch {
            write!(f, "@{epoch}")?;
        }
        Ok(())
    }
}
