//! Per-rank storage: interior plus ghost layers, addressed globally

use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Dimension, IxDyn, Slice};

use crate::comm::Element;
use crate::error::{Error, Result};
use crate::geometry::Region;
use crate::tile::Tile;

/// View of `region` inside an array whose element zero sits at
/// global coordinates `frame`.
pub(crate) fn region_view<'a, T>(array: &'a ArrayD<T>, region: &Region, frame: &[usize]) -> ArrayViewD<'a, T> {
    array.slice_each_axis(|ax| {
        let a = ax.axis.index();
        let start = region.origin()[a] - frame[a];
        Slice::from(start..start + region.extent()[a])
    })
}

pub(crate) fn region_view_mut<'a, T>(array: &'a mut ArrayD<T>, region: &Region, frame: &[usize]) -> ArrayViewMutD<'a, T> {
    array.slice_each_axis_mut(|ax| {
        let a = ax.axis.index();
        let start = region.origin()[a] - frame[a];
        Slice::from(start..start + region.extent()[a])
    })
}

/// Buffer shaped like a tile's extended region
#[derive(Clone, Debug, PartialEq)]
pub struct LocalField<T> {
    tile: Tile,
    data: ArrayD<T>,
}

impl<T: Element> LocalField<T> {
    /// All cells, ghosts included, set to `T::default()`
    pub fn new(tile: &Tile) -> Self {
        LocalField {
            tile: tile.clone(),
            data: ArrayD::default(IxDyn(&tile.ext_extent())),
        }
    }

    /// Interior cells from `f(global coordinates)`, ghosts defaulted
    pub fn from_fn<F: Fn(&[usize]) -> T>(tile: &Tile, f: F) -> Self {
        let mut field = LocalField::new(tile);
        let origin = tile.origin().to_vec();
        let mut global = vec![0; origin.len()];
        for (idx, v) in field.interior_mut().indexed_iter_mut() {
            for (g, (i, o)) in global.iter_mut().zip(idx.slice().iter().zip(origin.iter())) {
                *g = i + o;
            }
            *v = f(&global);
        }
        field
    }

    pub fn tile(&self) -> &Tile {
        &self.tile
    }

    pub fn data(&self) -> &ArrayD<T> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ArrayD<T> {
        &mut self.data
    }

    pub fn interior(&self) -> ArrayViewD<'_, T> {
        region_view(&self.data, self.tile.region(), &self.tile.local_offset())
    }

    pub fn interior_mut(&mut self) -> ArrayViewMutD<'_, T> {
        let frame = self.tile.local_offset();
        region_view_mut(&mut self.data, self.tile.region(), &frame)
    }

    /// Value at global coordinates, ghosts included
    pub fn get(&self, global: &[usize]) -> Option<T> {
        let local = self.tile.to_local(global)?;
        self.data.get(IxDyn(&local)).copied()
    }

    pub fn get_mut(&mut self, global: &[usize]) -> Option<&mut T> {
        let local = self.tile.to_local(global)?;
        self.data.get_mut(IxDyn(&local))
    }

    /// Copies `region` out in row-major order
    pub fn pack(&self, region: &Region) -> Result<Vec<T>> {
        self.check_inside(region)?;
        let frame = self.tile.local_offset();
        Ok(region_view(&self.data, region, &frame).iter().copied().collect())
    }

    /// Writes a row-major `payload` into `region`
    pub fn unpack(&mut self, region: &Region, payload: &[T]) -> Result<()> {
        self.check_inside(region)?;
        if payload.len() != region.volume() {
            return Err(Error::MalformedTransfer {
                peer: self.tile.rank(),
                detail: format!("{} values for region {} of {} cells", payload.len(), region, region.volume()),
            });
        }
        let src = ArrayViewD::from_shape(IxDyn(region.extent()), payload).map_err(|e| Error::MalformedTransfer {
            peer: self.tile.rank(),
            detail: e.to_string(),
        })?;
        let frame = self.tile.local_offset();
        region_view_mut(&mut self.data, region, &frame).assign(&src);
        Ok(())
    }

    /// Sum over interior cells
    pub fn interior_sum(&self) -> T
    where
        T: std::iter::Sum<T>,
    {
        self.interior().iter().copied().sum()
    }

    fn check_inside(&self, region: &Region) -> Result<()> {
        if self.tile.ext_region().contains_region(region) {
            Ok(())
        } else {
            Err(Error::MalformedTransfer {
                peer: self.tile.rank(),
                detail: format!("region {} outside local buffer {}", region, self.tile.ext_region()),
            })
        }
    }
}
