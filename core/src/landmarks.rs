//! Landmark map and spatial index.
//!
//! The map is the fixed set of pole positions the vehicle localizes against. Each landmark has a
//! 2D position and may carry auxiliary attributes (pole width, height, cluster size, ...) that are
//! kept alongside but never enter the likelihood.
//!
//! The index is an R-tree over the landmark positions. Queries answer "how far is the closest
//! mapped landmark, if any lies within `max_distance`?", which is the only question the
//! measurement update asks. A miss is reported as `None` and is the normal outcome for spurious
//! detections, not an error.
use nalgebra::Vector2;
use rstar::RTree;
use rstar::primitives::GeomWithData;

/// A single mapped landmark.
#[derive(Clone, Debug, PartialEq)]
pub struct Landmark {
    pub position: Vector2<f64>,
    pub attributes: Vec<f64>,
}

impl Landmark {
    pub fn new(x: f64, y: f64) -> Self {
        Landmark {
            position: Vector2::new(x, y),
            attributes: Vec::new(),
        }
    }

    pub fn with_attributes(x: f64, y: f64, attributes: Vec<f64>) -> Self {
        Landmark {
            position: Vector2::new(x, y),
            attributes,
        }
    }
}

/// Immutable collection of landmarks in the world frame.
#[derive(Clone, Debug, Default)]
pub struct LandmarkMap {
    landmarks: Vec<Landmark>,
}

impl LandmarkMap {
    pub fn new(landmarks: Vec<Landmark>) -> Self {
        LandmarkMap { landmarks }
    }

    /// Build a map from bare positions (no attributes).
    pub fn from_positions(positions: &[Vector2<f64>]) -> Self {
        LandmarkMap {
            landmarks: positions
                .iter()
                .map(|p| Landmark::new(p.x, p.y))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.landmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }

    pub fn landmarks(&self) -> &[Landmark] {
        &self.landmarks
    }

    pub fn get(&self, index: usize) -> Option<&Landmark> {
        self.landmarks.get(index)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Vector2<f64>> {
        self.landmarks.iter().map(|l| &l.position)
    }
}

/// A landmark position tagged with its index in the map.
type IndexedPosition = GeomWithData<[f64; 2], usize>;

/// Static nearest-neighbor index over a [`LandmarkMap`].
///
/// Built once with a bulk load and only read afterwards, so it can be shared by reference across
/// threads during the per-particle likelihood evaluation.
///
/// # Example
/// ```rust
/// use nalgebra::Vector2;
/// use poleloc::landmarks::{LandmarkIndex, LandmarkMap};
///
/// let map = LandmarkMap::from_positions(&[Vector2::new(10.0, 0.0), Vector2::new(0.0, 5.0)]);
/// let index = LandmarkIndex::new(&map);
///
/// let hit = index.nearest_distance(&Vector2::new(9.0, 0.0), 2.0);
/// assert!((hit.unwrap() - 1.0).abs() < 1e-12);
/// assert!(index.nearest_distance(&Vector2::new(-20.0, 0.0), 2.0).is_none());
/// ```
#[derive(Clone)]
pub struct LandmarkIndex {
    tree: RTree<IndexedPosition>,
}

impl LandmarkIndex {
    pub fn new(map: &LandmarkMap) -> Self {
        let indexed: Vec<IndexedPosition> = map
            .positions()
            .enumerate()
            .map(|(i, p)| IndexedPosition::new([p.x, p.y], i))
            .collect();
        LandmarkIndex {
            tree: RTree::bulk_load(indexed),
        }
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    /// Closest landmark to `point`, as `(map index, distance)`.
    ///
    /// Returns `None` when the closest landmark is farther than `max_distance`.
    /// O(log M) in the number of landmarks.
    pub fn nearest(&self, point: &Vector2<f64>, max_distance: f64) -> Option<(usize, f64)> {
        let query = [point.x, point.y];
        self.tree.nearest_neighbor(&query).and_then(|entry| {
            let [x, y] = *entry.geom();
            let distance = (x - point.x).hypot(y - point.y);
            (distance <= max_distance).then_some((entry.data, distance))
        })
    }

    /// Distance to the closest landmark within `max_distance`, or `None`.
    pub fn nearest_distance(&self, point: &Vector2<f64>, max_distance: f64) -> Option<f64> {
        self.nearest(point, max_distance).map(|(_, d)| d)
    }

    /// Batch form of [`LandmarkIndex::nearest_distance`] for all points of one step.
    pub fn nearest_distances(&self, points: &[Vector2<f64>], max_distance: f64) -> Vec<Option<f64>> {
        points
            .iter()
            .map(|p| self.nearest_distance(p, max_distance))
            .collect()
    }
}
