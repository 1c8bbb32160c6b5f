//! Boxes and neighbour directions in global index space

use std::fmt;

/// Highest grid dimensionality supported; bounded by the fixed-size
/// wire form of a tile.
pub const MAX_DIMS: usize = 3;

/// Which neighbours a stencil reads from
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Connectivity {
    /// Neighbours sharing a (D-1)-dimensional face only
    Faces,
    /// Faces, edges and corners
    Full,
}

impl Connectivity {
    pub fn admits(&self, direction: &Direction) -> bool {
        match self {
            Connectivity::Faces => direction.order() == 1,
            Connectivity::Full => direction.order() >= 1,
        }
    }
}

impl From<&str> for Connectivity {
    fn from(s: &str) -> Self {
        match s {
            "full" | "corners" | "diagonal" => Connectivity::Full,
            _ => Connectivity::Faces,
        }
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Connectivity::Faces => write!(f, "faces"),
            Connectivity::Full => write!(f, "full"),
        }
    }
}

/// Offset from a tile towards one of its neighbours, one component
/// in {-1, 0, 1} per axis.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Direction {
    ndim: u8,
    offsets: [i8; MAX_DIMS],
}

impl Direction {
    pub fn new(offsets: &[i8]) -> Self {
        debug_assert!(offsets.len() <= MAX_DIMS);
        debug_assert!(offsets.iter().all(|o| (-1..=1).contains(o)));
        let mut d = Direction { ndim: offsets.len() as u8, offsets: [0; MAX_DIMS] };
        d.offsets[..offsets.len()].copy_from_slice(offsets);
        d
    }

    /// Unit direction along `axis`, negative if `upper` is false
    pub fn face(ndim: usize, axis: usize, upper: bool) -> Self {
        let mut offsets = [0; MAX_DIMS];
        offsets[axis] = if upper {1} else {-1};
        Direction::new(&offsets[..ndim])
    }

    /// Every direction admitted by `connectivity`, in a fixed order that all
    /// ranks agree on: lexicographic over the offsets, axis 0 most significant.
    pub fn all(ndim: usize, connectivity: Connectivity) -> Vec<Direction> {
        let count = 3usize.pow(ndim as u32);
        (0..count)
            .map(|mut code| {
                let mut offsets = [0i8; MAX_DIMS];
                for a in (0..ndim).rev() {
                    offsets[a] = (code % 3) as i8 - 1;
                    code /= 3;
                }
                Direction::new(&offsets[..ndim])
            })
            .filter(|d| connectivity.admits(d))
            .collect()
    }

    pub fn ndim(&self) -> usize {
        self.ndim as usize
    }

    pub fn offsets(&self) -> &[i8] {
        &self.offsets[..self.ndim()]
    }

    pub fn offset(&self, axis: usize) -> i8 {
        self.offsets[axis]
    }

    /// 1 for a face, 2 for an edge, 3 for a corner
    pub fn order(&self) -> usize {
        self.offsets().iter().filter(|&&o| o != 0).count()
    }

    pub fn opposite(&self) -> Self {
        let flipped: Vec<i8> = self.offsets().iter().map(|o| -o).collect();
        Direction::new(&flipped)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s: Vec<&str> = self.offsets().iter()
            .map(|o| match o { -1 => "-", 1 => "+", _ => "0" })
            .collect();
        write!(f, "({})", s.join(","))
    }
}

/// Half-open axis-aligned box `[origin, origin + extent)`
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Region {
    origin: Vec<usize>,
    extent: Vec<usize>,
}

impl Region {
    pub fn new(origin: Vec<usize>, extent: Vec<usize>) -> Self {
        assert_eq!(origin.len(), extent.len(), "origin and extent must have equal dimension");
        Region { origin, extent }
    }

    /// The whole of a grid with the given shape
    pub fn from_shape(shape: &[usize]) -> Self {
        Region::new(vec![0; shape.len()], shape.to_vec())
    }

    pub fn ndim(&self) -> usize {
        self.origin.len()
    }

    pub fn origin(&self) -> &[usize] {
        &self.origin
    }

    pub fn extent(&self) -> &[usize] {
        &self.extent
    }

    /// Exclusive upper corner
    pub fn end(&self) -> Vec<usize> {
        self.origin.iter().zip(self.extent.iter()).map(|(o, e)| o + e).collect()
    }

    pub fn volume(&self) -> usize {
        self.extent.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.extent.iter().any(|&e| e == 0)
    }

    pub fn contains(&self, coords: &[usize]) -> bool {
        coords.len() == self.ndim()
            && coords.iter().zip(self.origin.iter().zip(self.extent.iter()))
                .all(|(&x, (&o, &e))| x >= o && x < o + e)
    }

    pub fn contains_region(&self, other: &Region) -> bool {
        other.ndim() == self.ndim()
            && (0..self.ndim()).all(|a| {
                other.origin[a] >= self.origin[a]
                    && other.origin[a] + other.extent[a] <= self.origin[a] + self.extent[a]
            })
    }

    /// Common part of two boxes, `None` if they do not overlap
    pub fn intersect(&self, other: &Region) -> Option<Region> {
        if other.ndim() != self.ndim() {
            return None;
        }
        let mut origin = Vec::with_capacity(self.ndim());
        let mut extent = Vec::with_capacity(self.ndim());
        for a in 0..self.ndim() {
            let lo = self.origin[a].max(other.origin[a]);
            let hi = (self.origin[a] + self.extent[a]).min(other.origin[a] + other.extent[a]);
            if hi <= lo {
                return None;
            }
            origin.push(lo);
            extent.push(hi - lo);
        }
        Some(Region { origin, extent })
    }

    /// Widen by `lo` cells below and `hi` cells above, per axis.
    /// The lower widening must not pass index zero.
    pub fn grow(&self, lo: &[usize], hi: &[usize]) -> Region {
        let origin = self.origin.iter().zip(lo).map(|(o, l)| o - l).collect();
        let extent = (0..self.ndim()).map(|a| self.extent[a] + lo[a] + hi[a]).collect();
        Region { origin, extent }
    }

    /// Replace the interval along one axis
    pub fn with_axis(&self, axis: usize, origin: usize, extent: usize) -> Region {
        let mut r = self.clone();
        r.origin[axis] = origin;
        r.extent[axis] = extent;
        r
    }

    /// Position of this box's origin relative to the origin of `frame`
    pub fn offset_within(&self, frame: &Region) -> Vec<usize> {
        self.origin.iter().zip(frame.origin.iter()).map(|(a, b)| a - b).collect()
    }

    /// Visits every cell of the box in row-major order
    pub fn for_each_cell<F: FnMut(&[usize])>(&self, mut f: F) {
        for_each_index(&self.extent, |idx| {
            let global: Vec<usize> = idx.iter().zip(self.origin.iter()).map(|(i, o)| i + o).collect();
            f(&global)
        });
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}+{:?}", self.origin, self.extent)
    }
}

/// Odometer over `[0, shape)` in row-major order
pub fn for_each_index<F: FnMut(&[usize])>(shape: &[usize], mut f: F) {
    if shape.is_empty() || shape.iter().any(|&n| n == 0) {
        return;
    }
    let mut idx = vec![0; shape.len()];
    loop {
        f(&idx);
        let mut a = shape.len();
        loop {
            if a == 0 {
                return;
            }
            a -= 1;
            idx[a] += 1;
            if idx[a] < shape[a] {
                break;
            }
            idx[a] = 0;
        }
    }
}

/// Row-major linear index of `idx` within `shape`
pub fn linear_index(idx: &[usize], shape: &[usize]) -> usize {
    idx.iter().zip(shape.iter()).fold(0, |acc, (&i, &n)| acc * n + i)
}
