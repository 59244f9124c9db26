use crate::enums::Orientation;
use crate::slice::{Slice, SliceGeometry};
use crate::volume_loader::VolumeLoaderError;

use ndarray::{Array3, ArrayView2, s};
use rayon::prelude::*;
use std::sync::Arc;

const SAGITTAL_COSINES: [f32; 6] = [0.0, 1.0, 0.0, 0.0, 0.0, -1.0];
const CORONAL_COSINES: [f32; 6] = [1.0, 0.0, 0.0, 0.0, 0.0, -1.0];

/// Reslices an axial stack along the other two anatomical planes.
///
/// The stack is held as a dense (depth, height, width) array. Depth is
/// reversed in every output slice so that the highest z ends up on the top
/// row.
pub struct OrientationResampler<'a> {
    raw: &'a [Slice],
    data: Array3<u16>,
}

impl<'a> OrientationResampler<'a> {
    /// # Errors
    ///
    /// Returns error if `raw` is empty or its slices differ in size.
    pub fn new(raw: &'a [Slice]) -> Result<Self, VolumeLoaderError> {
        let first = raw.first().ok_or(VolumeLoaderError::NoValidImages)?;
        Self::validate_dimensions(raw)?;
        let data = Self::build_volume_array(raw, first.width, first.height);
        Ok(Self { raw, data })
    }

    /// (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn source_orientation(&self) -> Orientation {
        self.raw[0].orientation()
    }

    /// Produces the slices of `target`.
    ///
    /// # Errors
    ///
    /// Only axial stacks can be resliced, and never to
    /// [`Orientation::Unknown`].
    pub fn resample(&self, target: Orientation) -> Result<Vec<Slice>, VolumeLoaderError> {
        let source = self.source_orientation();
        if target == source {
            return Ok(self.raw.to_vec());
        }
        if source != Orientation::Axial || target == Orientation::Unknown {
            return Err(VolumeLoaderError::UnsupportedReslice {
                from: source,
                to: target,
            });
        }

        let (_, height, width) = self.dim();
        let count = match target {
            Orientation::Sagittal => width,
            _ => height,
        };
        (0..count)
            .into_par_iter()
            .map(|index| self.resliced(target, index))
            .collect()
    }

    fn resliced(&self, target: Orientation, index: usize) -> Result<Slice, VolumeLoaderError> {
        let plane: ArrayView2<'_, u16> = match target {
            Orientation::Sagittal => self.data.slice(s![..;-1, .., index]),
            _ => self.data.slice(s![..;-1, index, ..]),
        };
        let (rows, columns) = plane.dim();
        let samples: Vec<u16> = plane.iter().copied().collect();

        let first = &self.raw[0];
        let mut slice = Slice::new(
            first.source_path.clone(),
            Arc::clone(&first.tags),
            index,
            columns,
            rows,
            self.resliced_geometry(target),
            samples,
        )?;
        slice.window_width = first.window_width;
        slice.window_center = first.window_center;
        Ok(slice)
    }

    /// Geometry of every slice of `target`, derived from the first source
    /// slice only.
    ///
    /// Sagittal slices take `(column spacing, thickness)` as their pixel
    /// spacing and the row spacing as their thickness. Coronal slices take
    /// `(row spacing, thickness)` and the column spacing as their thickness.
    fn resliced_geometry(&self, target: Orientation) -> SliceGeometry {
        let source = &self.raw[0].geometry;
        let (row_spacing, column_spacing) = source.pixel_spacing;
        let (image_orientation, pixel_spacing, slice_thickness) = match target {
            Orientation::Sagittal => (
                SAGITTAL_COSINES,
                (column_spacing, source.slice_thickness),
                row_spacing,
            ),
            _ => (
                CORONAL_COSINES,
                (row_spacing, source.slice_thickness),
                column_spacing,
            ),
        };
        let position = source.image_position.unwrap_or_default();

        SliceGeometry {
            image_position: remap_position(source.orientation, target, position),
            image_orientation,
            orientation: target,
            pixel_spacing,
            slice_thickness,
            ..source.clone()
        }
    }

    fn validate_dimensions(raw: &[Slice]) -> Result<(), VolumeLoaderError> {
        let first_dim = (raw[0].width, raw[0].height);
        if raw.iter().any(|slice| (slice.width, slice.height) != first_dim) {
            return Err(VolumeLoaderError::InconsistentDimensions);
        }
        Ok(())
    }

    fn build_volume_array(raw: &[Slice], width: usize, height: usize) -> Array3<u16> {
        let depth = raw.len();
        let mut volume = Array3::<u16>::zeros((depth, height, width));

        for (z, slice) in raw.iter().enumerate() {
            let mut plane = volume.slice_mut(s![z, .., ..]);
            for (target, &sample) in plane.iter_mut().zip(slice.samples()) {
                *target = sample;
            }
        }

        volume
    }
}

/// Patient position of a resliced stack, permuted from the first source
/// position. `None` for pairs without a mapping.
pub fn remap_position(from: Orientation, to: Orientation, p: [f32; 3]) -> Option<[f32; 3]> {
    match (from, to) {
        (Orientation::Axial, Orientation::Sagittal) => Some([-p[1], p[0], 0.0]),
        (Orientation::Axial, Orientation::Coronal) => Some([p[0], p[1], 0.0]),
        (Orientation::Sagittal, Orientation::Axial) => Some([p[1], p[0], 0.0]),
        (Orientation::Sagittal, Orientation::Coronal) => Some([p[0], p[2], 0.0]),
        _ if from == to => Some(p),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::slice::DEFAULT_PATIENT_POSITION;
    use crate::tags::TagRecord;
    use std::path::PathBuf;

    /// An axial stack whose sample at (x, y) of slice z is `100 * z + 10 * y + x`.
    pub(crate) fn axial_stack(width: usize, height: usize, depth: usize) -> Vec<Slice> {
        let tags = Arc::new(TagRecord::default());
        (0..depth)
            .map(|z| {
                let geometry = SliceGeometry {
                    patient_position: DEFAULT_PATIENT_POSITION.to_string(),
                    image_position: Some([3.0, 4.0, z as f32 * 2.0]),
                    image_orientation: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
                    orientation: Orientation::Axial,
                    rescale_slope: 1.0,
                    rescale_intercept: 0.0,
                    pixel_spacing: (0.5, 0.8),
                    slice_thickness: 2.0,
                    signed_samples: false,
                };
                let samples = (0..height)
                    .flat_map(|y| (0..width).map(move |x| (100 * z + 10 * y + x) as u16))
                    .collect();
                Slice::new(
                    PathBuf::from(format!("{z}.dcm")),
                    Arc::clone(&tags),
                    z,
                    width,
                    height,
                    geometry,
                    samples,
                )
                .expect("slice")
            })
            .collect()
    }

    #[test]
    fn sagittal_reverses_depth_and_uses_rows_as_columns() {
        let raw = axial_stack(4, 3, 2);
        let resampler = OrientationResampler::new(&raw).expect("resampler");

        let sagittal = resampler.resample(Orientation::Sagittal).expect("sagittal");

        assert_eq!(sagittal.len(), 4);
        let slice = &sagittal[1];
        assert_eq!((slice.width, slice.height), (3, 2));
        // top row is the last axial slice
        assert_eq!(slice.samples(), &[101, 111, 121, 1, 11, 21]);
        assert_eq!(slice.orientation(), Orientation::Sagittal);
        assert_eq!(slice.geometry.pixel_spacing, (0.8, 2.0));
        assert_eq!(slice.geometry.slice_thickness, 0.5);
        assert_eq!(slice.geometry.image_position, Some([-4.0, 3.0, 0.0]));
    }

    #[test]
    fn coronal_keeps_columns() {
        let raw = axial_stack(4, 3, 2);
        let resampler = OrientationResampler::new(&raw).expect("resampler");

        let coronal = resampler.resample(Orientation::Coronal).expect("coronal");

        assert_eq!(coronal.len(), 3);
        let slice = &coronal[2];
        assert_eq!((slice.width, slice.height), (4, 2));
        assert_eq!(slice.samples(), &[120, 121, 122, 123, 20, 21, 22, 23]);
        assert_eq!(slice.geometry.pixel_spacing, (0.5, 2.0));
        assert_eq!(slice.geometry.slice_thickness, 0.8);
        assert_eq!(slice.geometry.image_position, Some([3.0, 4.0, 0.0]));
    }

    #[test]
    fn resliced_spacing_swaps_in_source_thickness() {
        let mut raw = axial_stack(3, 3, 3);
        for slice in &mut raw {
            slice.geometry.pixel_spacing = (0.25, 0.75);
            slice.geometry.slice_thickness = 3.0;
        }
        let resampler = OrientationResampler::new(&raw).expect("resampler");

        for slice in resampler.resample(Orientation::Sagittal).expect("sagittal") {
            assert_eq!(slice.geometry.pixel_spacing, (0.75, 3.0));
            assert_eq!(slice.geometry.slice_thickness, 0.25);
        }
        for slice in resampler.resample(Orientation::Coronal).expect("coronal") {
            assert_eq!(slice.geometry.pixel_spacing, (0.25, 3.0));
            assert_eq!(slice.geometry.slice_thickness, 0.75);
        }
    }

    #[test]
    fn rejects_mixed_sizes_and_unsupported_pairs() {
        let mut raw = axial_stack(2, 2, 2);
        raw.extend(axial_stack(3, 2, 1));
        assert!(matches!(
            OrientationResampler::new(&raw),
            Err(VolumeLoaderError::InconsistentDimensions)
        ));

        let raw = axial_stack(2, 2, 2);
        let resampler = OrientationResampler::new(&raw).expect("resampler");
        assert!(matches!(
            resampler.resample(Orientation::Unknown),
            Err(VolumeLoaderError::UnsupportedReslice { .. })
        ));
    }

    #[test]
    fn remaps_positions() {
        use Orientation::*;
        let p = [1.0, 2.0, 3.0];
        assert_eq!(remap_position(Axial, Sagittal, p), Some([-2.0, 1.0, 0.0]));
        assert_eq!(remap_position(Axial, Coronal, p), Some([1.0, 2.0, 0.0]));
        assert_eq!(remap_position(Sagittal, Axial, p), Some([2.0, 1.0, 0.0]));
        assert_eq!(remap_position(Sagittal, Coronal, p), Some([1.0, 3.0, 0.0]));
        assert_eq!(remap_position(Coronal, Axial, p), None);
    }
}
