//! Chunk grid region index
//!
//! Every region is registered in each 16x16 column chunk it overlaps, so a query only
//! tests the regions of one chunk. Regions spanning more than [`MAX_CHUNKS_PER_REGION`]
//! chunks are kept in a per-world list that is always scanned instead.

use std::sync::Arc;

use hashbrown::HashMap;

use super::{sort_by_priority, Region, RegionService};
use crate::host::BlockPos;

/// Chunk edge length in blocks
pub const CHUNK_SIZE: i32 = 16;

/// Regions covering more chunks than this are not registered per chunk
pub const MAX_CHUNKS_PER_REGION: i64 = 4096;

/// Chunk key - (x, z) chunk coordinates
pub type ChunkKey = (i32, i32);

#[inline]
fn chunk_of(x: i32, z: i32) -> ChunkKey {
    (x.div_euclid(CHUNK_SIZE), z.div_euclid(CHUNK_SIZE))
}

#[derive(Default)]
struct WorldGrid {
    global: Option<Arc<Region>>,
    chunks: HashMap<ChunkKey, Vec<Arc<Region>>>,
    oversized: Vec<Arc<Region>>,
}

impl WorldGrid {
    fn insert(&mut self, region: Arc<Region>) {
        if region.is_global() {
            self.global = Some(region);
            return;
        }
        let (min_cx, min_cz) = chunk_of(region.min.x, region.min.z);
        let (max_cx, max_cz) = chunk_of(region.max.x, region.max.z);
        let span = (i64::from(max_cx) - i64::from(min_cx) + 1) * (i64::from(max_cz) - i64::from(min_cz) + 1);
        if span > MAX_CHUNKS_PER_REGION {
            self.oversized.push(region);
            return;
        }
        for cx in min_cx..=max_cx {
            for cz in min_cz..=max_cz {
                self.chunks.entry((cx, cz)).or_default().push(Arc::clone(&region));
            }
        }
    }
}

/// Region store indexed by chunk
pub struct GridRegionIndex {
    worlds: HashMap<String, WorldGrid>,
}

impl GridRegionIndex {
    pub fn new(regions: Vec<Region>) -> Self {
        let mut worlds: HashMap<String, WorldGrid> = HashMap::new();
        for region in regions {
            worlds
                .entry(region.world.clone())
                .or_default()
                .insert(Arc::new(region));
        }
        Self { worlds }
    }

    /// Number of non-empty chunks in a world
    pub fn chunk_count(&self, world: &str) -> usize {
        self.worlds.get(world).map_or(0, |w| w.chunks.len())
    }
}

impl RegionService for GridRegionIndex {
    fn global_region(&self, world: &str) -> Option<Arc<Region>> {
        self.worlds.get(world).and_then(|w| w.global.clone())
    }

    fn applicable_regions(&self, world: &str, pos: BlockPos) -> Vec<Arc<Region>> {
        let Some(grid) = self.worlds.get(world) else {
            return Vec::new();
        };
        let chunk = grid.chunks.get(&chunk_of(pos.x, pos.z));
        let mut found: Vec<Arc<Region>> = chunk
            .into_iter()
            .flatten()
            .chain(grid.oversized.iter())
            .filter(|region| region.contains(pos))
            .cloned()
            .collect();
        sort_by_priority(&mut found);
        found
    }
}
