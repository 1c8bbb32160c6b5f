//! Demonstration kernel: explicit heat diffusion on one rank's field

use ndarray::{ArrayD, Dimension, IxDyn, Zip};

use crate::field::LocalField;

/// One forward-Euler step of u += alpha * laplacian(u) over the interior.
///
/// Neighbour values come from the ghost layers, so the halo must be
/// current. Where the field ends at the domain boundary the centre value
/// is mirrored, i.e. no flux leaves the domain. Stable for
/// alpha <= 1 / (2 * ndim).
pub fn diffuse(field: &mut LocalField<f64>, alpha: f64) {
    let offset = field.tile().halo_lo().to_vec();
    let shape = field.tile().ext_extent();
    let old = field.data().clone();

    let mut interior = field.interior_mut();
    // IxDyn indices are not Copy, so Zip::indexed has no parallel path
    let indices = ArrayD::from_shape_fn(interior.raw_dim(), |idx| idx);
    Zip::from(&mut interior).and(&indices).par_for_each(|out, idx| {
        let mut here: Vec<usize> = idx.slice().iter().zip(offset.iter()).map(|(i, o)| i + o).collect();
        let centre = old[IxDyn(&here)];
        let mut laplacian = 0.0;
        for a in 0..here.len() {
            let c = here[a];
            let below = if c > 0 {
                here[a] = c - 1;
                old[IxDyn(&here)]
            } else {
                centre
            };
            let above = if c + 1 < shape[a] {
                here[a] = c + 1;
                old[IxDyn(&here)]
            } else {
                centre
            };
            here[a] = c;
            laplacian += below + above - 2.0 * centre;
        }
        *out = centre + alpha * laplacian;
    });
}

/// Initial condition: 1 inside a box around the domain centre, 0 elsewhere
pub fn hot_spot(domain: &[usize]) -> impl Fn(&[usize]) -> f64 {
    let lo: Vec<usize> = domain.iter().map(|&n| 3 * n / 8).collect();
    let hi: Vec<usize> = domain.iter().map(|&n| (5 * n / 8).max(3 * n / 8 + 1)).collect();
    move |g: &[usize]| {
        let inside = g.iter().zip(lo.iter().zip(hi.iter())).all(|(x, (l, h))| x >= l && x < h);
        if inside {1.0} else {0.0}
    }
}
