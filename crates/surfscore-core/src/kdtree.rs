//! KD-tree for nearest-neighbor queries against a target patch.
//!
//! Median-split construction over 3D coordinates. The tree is immutable once built, so a single
//! tree can serve every candidate patch of a pair.
use std::cmp::Ordering;

#[derive(Clone, Copy, Debug)]
struct Point3D {
    coords: [f32; 3],
    idx: usize,
}

impl Point3D {
    #[inline]
    fn distance_sq(&self, query: &[f32; 3]) -> f32 {
        let dx = self.coords[0] - query[0];
        let dy = self.coords[1] - query[1];
        let dz = self.coords[2] - query[2];
        dx * dx + dy * dy + dz * dz
    }
}

#[derive(Debug)]
struct KdNode {
    point: Point3D,
    split_dim: usize,
    left: Option<Box<KdNode>>,
    right: Option<Box<KdNode>>,
}

/// 3D KD-tree
///
/// Construction: O(n log n)
/// Nearest neighbor: O(log n) average
#[derive(Debug)]
pub struct KdTree {
    root: Option<Box<KdNode>>,
    size: usize,
}

/// Result of a nearest-neighbor query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Row of the matched point in the slice the tree was built from.
    pub index: usize,
    pub distance: f32,
}

impl KdTree {
    /// Build a KD-tree from a slice of 3D coordinates.
    ///
    /// The index reported by queries is the position in the input slice.
    pub fn build(coords: &[[f32; 3]]) -> Self {
        let mut points: Vec<Point3D> = coords
            .iter()
            .enumerate()
            .map(|(idx, &coords)| Point3D { coords, idx })
            .collect();
        let size = points.len();
        let root = Self::build_recursive(&mut points, 0);
        KdTree { root, size }
    }

    /// Build from the rows of an `(n, 3)` array.
    pub fn from_rows(points: ndarray::ArrayView2<f32>) -> Self {
        let coords: Vec<[f32; 3]> = points
            .rows()
            .into_iter()
            .map(|row| [row[0], row[1], row[2]])
            .collect();
        Self::build(&coords)
    }

    fn build_recursive(points: &mut [Point3D], depth: usize) -> Option<Box<KdNode>> {
        if points.is_empty() {
            return None;
        }
        let dim = depth % 3;
        let mid = points.len() / 2;
        points.select_nth_unstable_by(mid, |a, b| {
            a.coords[dim]
                .partial_cmp(&b.coords[dim])
                .unwrap_or(Ordering::Equal)
        });

        let (left, rest) = points.split_at_mut(mid);
        let (pivot, right) = rest.split_first_mut()?;

        Some(Box::new(KdNode {
            point: *pivot,
            split_dim: dim,
            left: Self::build_recursive(left, depth + 1),
            right: Self::build_recursive(right, depth + 1),
        }))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Nearest point to `query`, or `None` for an empty tree or a query with NaN coordinates.
    ///
    /// Among points at exactly the same distance the lowest index wins.
    pub fn nearest(&self, query: [f32; 3]) -> Option<Neighbor> {
        let root = self.root.as_ref()?;
        let mut best = (f32::INFINITY, usize::MAX);
        Self::nearest_recursive(root, &query, &mut best);
        // NaN distances never compare, so nothing was picked
        (best.1 != usize::MAX).then(|| Neighbor {
            index: best.1,
            distance: best.0.sqrt(),
        })
    }

    fn nearest_recursive(node: &KdNode, query: &[f32; 3], best: &mut (f32, usize)) {
        let dist_sq = node.point.distance_sq(query);
        if dist_sq < best.0 || (dist_sq == best.0 && node.point.idx < best.1) {
            *best = (dist_sq, node.point.idx);
        }

        let diff = query[node.split_dim] - node.point.coords[node.split_dim];
        let (first, second) = if diff < 0.0 {
            (&node.left, &node.right)
        } else {
            (&node.right, &node.left)
        };

        if let Some(child) = first {
            Self::nearest_recursive(child, query, best);
        }
        // Only cross the splitting plane if it is not farther than the current best.
        if diff * diff <= best.0 {
            if let Some(child) = second {
                Self::nearest_recursive(child, query, best);
            }
        }
    }
}
