//! Centroid-based translation initializer

use nalgebra::{Point3, Vector3};

use crate::operator::{PointSpreadFunction, SliceSampler};
use crate::volume::{SliceStack, Volume};

/// Intensity-weighted centroid of `points`; `None` if the weights vanish
fn centroid(points: &[Point3<f64>], weights: &[f64]) -> Option<Point3<f64>> {
    let mut sum = Vector3::zeros();
    let mut total = 0.0;
    for (p, &w) in points.iter().zip(weights.iter()) {
        let w = w.max(0.0);
        sum += p.coords * w;
        total += w;
    }
    (total > 1e-12).then(|| Point3::from(sum / total))
}

/// Translation that moves the intensity centroid of slice `k` onto the
/// centroid of `volume` sampled on the slice's current plane
///
/// Both centroids are taken over the slice's in-mask pixel centres in
/// physical space, so the shift lies in the slice plane.
pub fn moments_translation(volume: &Volume, stack: &SliceStack, stack_index: usize, k: usize) -> Option<Vector3<f64>> {
    let pose = stack.slices[k].pose.matrix();
    let psf = PointSpreadFunction::from_spacing(stack.image.grid.spacing);
    let sampler = SliceSampler::new(stack, stack_index, k, &pose, &volume.grid, &psf).ok()?;
    if sampler.is_empty() {
        return None;
    }

    let to_physical = pose * stack.image.grid.affine();
    let (nx, _, _) = stack.image.grid.dims;
    let data = stack.slice_data(k);
    let mut points = Vec::with_capacity(sampler.len());
    let mut observed = Vec::with_capacity(sampler.len());
    for p in sampler.pixel_indices() {
        let (i, j) = (p % nx, p / nx);
        points.push(to_physical.transform_point(&Point3::new(i as f64, j as f64, k as f64)));
        observed.push(data[p]);
    }

    let mut predicted = vec![0.0; sampler.len()];
    sampler.forward(&volume.data, &mut predicted);

    let slice_centroid = centroid(&points, &observed)?;
    let volume_centroid = centroid(&points, &predicted)?;
    Some(volume_centroid - slice_centroid)
}
