//! R\*-tree over record locations.

use std::fmt;

use geo::{BoundingRect, Coord, Intersects, Polygon};
use rstar::{AABB, RTree, RTreeObject};

use crate::key::StoreKey;

/// Point entry stored in the tree.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SpatialEntry {
    key: StoreKey,
    point: [f64; 2],
}

impl SpatialEntry {
    pub(crate) const fn new(key: StoreKey, (x, y): (f64, f64)) -> Self {
        Self { key, point: [x, y] }
    }
}

impl RTreeObject for SpatialEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.point)
    }
}

/// Incrementally maintained spatial index of one stream.
#[derive(Clone, Default)]
pub(crate) struct SpatialIndex {
    tree: RTree<SpatialEntry>,
}

impl fmt::Debug for SpatialIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpatialIndex")
            .field("entries", &self.tree.size())
            .finish()
    }
}

impl SpatialIndex {
    pub(crate) fn bulk_load(entries: Vec<SpatialEntry>) -> Self {
        Self {
            tree: RTree::bulk_load(entries),
        }
    }

    pub(crate) fn insert(&mut self, key: StoreKey, location: (f64, f64)) {
        self.tree.insert(SpatialEntry::new(key, location));
    }

    pub(crate) fn remove(&mut self, key: &StoreKey, location: (f64, f64)) -> bool {
        self.tree
            .remove(&SpatialEntry::new(key.clone(), location))
            .is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.tree.size()
    }

    /// Keys whose location lies inside `region` or on its boundary, sorted.
    ///
    /// The tree narrows candidates to the region's bounding box; each
    /// candidate is then tested against the polygon itself.
    pub(crate) fn query_region(&self, region: &Polygon<f64>) -> Vec<StoreKey> {
        let Some(bbox) = region.bounding_rect() else {
            return Vec::new();
        };
        let envelope =
            AABB::from_corners([bbox.min().x, bbox.min().y], [bbox.max().x, bbox.max().y]);
        let mut keys: Vec<StoreKey> = self
            .tree
            .locate_in_envelope_intersecting(&envelope)
            .filter(|entry| {
                let [x, y] = entry.point;
                region.intersects(&Coord { x, y })
            })
            .map(|entry| entry.key.clone())
            .collect();
        keys.sort_unstable();
        keys
    }
}

/// Whether a location lies inside `region` or on its boundary.
pub(crate) fn contains_location(region: &Polygon<f64>, (x, y): (f64, f64)) -> bool {
    region.intersects(&Coord { x, y })
}
