//! Linear scan over every region of a world

use std::collections::HashMap;
use std::sync::Arc;

use super::{sort_by_priority, Region, RegionService};
use crate::host::BlockPos;

#[derive(Default)]
struct WorldRegions {
    global: Option<Arc<Region>>,
    regions: Vec<Arc<Region>>,
}

/// Region store that tests every region of the queried world
pub struct LinearRegionIndex {
    worlds: HashMap<String, WorldRegions>,
}

impl LinearRegionIndex {
    pub fn new(regions: Vec<Region>) -> Self {
        let mut worlds: HashMap<String, WorldRegions> = HashMap::new();
        for region in regions {
            let entry = worlds.entry(region.world.clone()).or_default();
            if region.is_global() {
                entry.global = Some(Arc::new(region));
            } else {
                entry.regions.push(Arc::new(region));
            }
        }
        Self { worlds }
    }

    pub fn len(&self) -> usize {
        self.worlds
            .values()
            .map(|w| w.regions.len() + usize::from(w.global.is_some()))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RegionService for LinearRegionIndex {
    fn global_region(&self, world: &str) -> Option<Arc<Region>> {
        self.worlds.get(world).and_then(|w| w.global.clone())
    }

    fn applicable_regions(&self, world: &str, pos: BlockPos) -> Vec<Arc<Region>> {
        let Some(world) = self.worlds.get(world) else {
            return Vec::new();
        };
        let mut found: Vec<Arc<Region>> = world
            .regions
            .iter()
            .filter(|region| region.contains(pos))
            .cloned()
            .collect();
        sort_by_priority(&mut found);
        found
    }
}
