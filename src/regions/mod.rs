//! Spatial region service
//!
//! Regions are axis-aligned cuboids in a named world carrying a priority and optional
//! audio and delay rules. A region with id [`GLOBAL_REGION_ID`] covers its whole world.
//! The tracker only sees the [`RegionService`] trait; the backend behind it is chosen
//! once at startup by [`select_region_service`].

pub mod grid;
pub mod linear;
pub mod version;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audio::rules::{AudioRule, DelayRule, RuleParseError};
use crate::host::BlockPos;

pub use grid::GridRegionIndex;
pub use linear::LinearRegionIndex;
pub use version::Version;

/// Id of the region that applies to every position of its world
pub const GLOBAL_REGION_ID: &str = "__global__";

/// First region provider version backed by the chunk grid index
pub const GRID_INDEX_VERSION: &str = "7.0.0";

#[derive(Debug, thiserror::Error)]
pub enum RegionError {
    #[error("invalid region provider version '{0}'")]
    InvalidVersion(String),
    #[error("region '{id}': {source}")]
    InvalidRule {
        id: String,
        #[source]
        source: RuleParseError,
    },
    #[error("region '{0}' needs both min and max corners")]
    MissingBounds(String),
    #[error("duplicate region '{world}/{id}'")]
    Duplicate { world: String, id: String },
}

/// Source of the rules applying to a position
pub trait RegionService: Send + Sync {
    /// The global region of a world, if one is defined
    fn global_region(&self, world: &str) -> Option<Arc<Region>>;

    /// Non-global regions containing `pos`, highest priority first
    fn applicable_regions(&self, world: &str, pos: BlockPos) -> Vec<Arc<Region>>;
}

/// A region with parsed rules
///
/// `audio`/`delay` are `None` when the region does not set the flag at all, which is
/// different from setting it to an empty list: only regions that set a flag take part
/// in the priority reduction for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub id: String,
    pub world: String,
    pub min: BlockPos,
    pub max: BlockPos,
    pub priority: i32,
    pub audio: Option<Vec<AudioRule>>,
    pub delay: Option<Vec<DelayRule>>,
}

impl Region {
    pub fn is_global(&self) -> bool {
        self.id == GLOBAL_REGION_ID
    }

    /// Inclusive containment check, ignoring the world
    pub fn contains(&self, pos: BlockPos) -> bool {
        self.is_global()
            || (pos.x >= self.min.x
                && pos.x <= self.max.x
                && pos.y >= self.min.y
                && pos.y <= self.max.y
                && pos.z >= self.min.z
                && pos.z <= self.max.z)
    }
}

/// Region as written in the configuration file
///
/// ```toml
/// [[regions]]
/// id = "forest"
/// world = "world"
/// priority = 5
/// min = [0, 0, 0]
/// max = [100, 255, 100]
/// audio = ["birds", "owls:time=night", "rain:track=weather"]
/// delay = ["5-10"]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegionDef {
    pub id: String,
    pub world: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub min: Option<[i32; 3]>,
    #[serde(default)]
    pub max: Option<[i32; 3]>,
    #[serde(default)]
    pub audio: Option<Vec<String>>,
    #[serde(default)]
    pub delay: Option<Vec<String>>,
}

impl RegionDef {
    /// Parse the rule strings and normalise the corners
    pub fn build(&self) -> Result<Region, RegionError> {
        let invalid = |source| RegionError::InvalidRule {
            id: self.id.clone(),
            source,
        };

        let audio = self
            .audio
            .as_ref()
            .map(|rules| rules.iter().map(|r| AudioRule::parse(r)).collect::<Result<Vec<_>, _>>())
            .transpose()
            .map_err(invalid)?;
        let delay = self
            .delay
            .as_ref()
            .map(|rules| rules.iter().map(|r| DelayRule::parse(r)).collect::<Result<Vec<_>, _>>())
            .transpose()
            .map_err(invalid)?;

        let (min, max) = if self.id == GLOBAL_REGION_ID {
            (BlockPos::default(), BlockPos::default())
        } else {
            match (self.min, self.max) {
                (Some(a), Some(b)) => (
                    BlockPos::new(a[0].min(b[0]), a[1].min(b[1]), a[2].min(b[2])),
                    BlockPos::new(a[0].max(b[0]), a[1].max(b[1]), a[2].max(b[2])),
                ),
                _ => return Err(RegionError::MissingBounds(self.id.clone())),
            }
        };

        Ok(Region {
            id: self.id.clone(),
            world: self.world.clone(),
            min,
            max,
            priority: self.priority,
            audio,
            delay,
        })
    }
}

/// Parse every definition, rejecting duplicate ids within a world
pub fn build_regions(defs: &[RegionDef]) -> Result<Vec<Region>, RegionError> {
    let mut seen = std::collections::HashSet::new();
    let mut regions = Vec::with_capacity(defs.len());
    for def in defs {
        if !seen.insert((def.world.as_str(), def.id.as_str())) {
            return Err(RegionError::Duplicate {
                world: def.world.clone(),
                id: def.id.clone(),
            });
        }
        regions.push(def.build()?);
    }
    Ok(regions)
}

/// Order used for applicable regions: priority descending, then id
pub(crate) fn sort_by_priority(regions: &mut [Arc<Region>]) {
    regions.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
}

/// Pick the region backend for the detected provider version
///
/// Providers from [`GRID_INDEX_VERSION`] on use the chunk grid index, older ones the
/// linear scan.
pub fn select_region_service(
    provider_version: &str,
    defs: &[RegionDef],
) -> Result<Arc<dyn RegionService>, RegionError> {
    let version = Version::detect(provider_version)?;
    let regions = build_regions(defs)?;
    let threshold = Version::parse(GRID_INDEX_VERSION)?;

    let service: Arc<dyn RegionService> = if version >= threshold {
        tracing::debug!("Region provider {} uses the grid index", version);
        Arc::new(GridRegionIndex::new(regions))
    } else {
        tracing::debug!("Region provider {} uses the linear index", version);
        Arc::new(LinearRegionIndex::new(regions))
    };
    Ok(service)
}
