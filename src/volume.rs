use crate::enums::Orientation;
use crate::resampler::OrientationResampler;
use crate::rtstruct::StructureSet;
use crate::slice::Slice;
use crate::tags::TagRecord;
use crate::volume_loader::VolumeLoaderError;

use tracing::info;
use web_time::Instant;

/// The slices of one load, in acquisition order and as currently viewed.
#[derive(Debug, Clone, Default)]
pub struct VolumeCollection {
    raw: Vec<Slice>,
    view: Vec<Slice>,
    orientation: Orientation,
    structure_sets: Vec<StructureSet>,
}

impl VolumeCollection {
    /// `raw` is expected sorted and numbered. The view starts as a copy of it,
    /// in the orientation of its first slice.
    pub fn new(raw: Vec<Slice>, structure_sets: Vec<StructureSet>) -> Self {
        let orientation = raw.first().map(Slice::orientation).unwrap_or_default();
        Self {
            view: raw.clone(),
            raw,
            orientation,
            structure_sets,
        }
    }

    pub fn raw(&self) -> &[Slice] {
        &self.raw
    }

    pub fn view(&self) -> &[Slice] {
        &self.view
    }

    pub fn len(&self) -> usize {
        self.view.len()
    }

    pub fn is_empty(&self) -> bool {
        self.view.is_empty()
    }

    pub fn slice(&self, index: usize) -> Option<&Slice> {
        self.view.get(index)
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn matches_orientation(&self, orientation: Orientation) -> bool {
        self.orientation == orientation
    }

    pub fn structure_sets(&self) -> &[StructureSet] {
        &self.structure_sets
    }

    /// Structure sets drawn on the frame of reference `frame_of_reference_uid`.
    pub fn structure_sets_for<'a>(
        &'a self,
        frame_of_reference_uid: &'a str,
    ) -> impl Iterator<Item = &'a StructureSet> + 'a {
        self.structure_sets
            .iter()
            .filter(move |set| set.frame_of_reference_uid == frame_of_reference_uid)
    }

    /// Display text of the first slice.
    pub fn tag_record(&self) -> Option<&TagRecord> {
        self.raw.first().map(|slice| slice.tags.as_ref())
    }

    /// Mean window width and center over the view, rounded to 3 decimals.
    /// `(0.0, 0.0)` for an empty view.
    pub fn calculate_average_window_values(&self) -> (f64, f64) {
        if self.view.is_empty() {
            return (0.0, 0.0);
        }
        let count = self.view.len() as f64;
        let (width, center) = self.view.iter().fold((0.0, 0.0), |(width, center), slice| {
            (width + slice.window_width, center + slice.window_center)
        });
        (round3(width / count), round3(center / count))
    }

    /// Switches the view to `target`.
    ///
    /// Returns `Ok(false)` without touching the view when it is already in
    /// `target`. On error the view and its orientation are unchanged.
    pub fn change_orientation(&mut self, target: Orientation) -> Result<bool, VolumeLoaderError> {
        if self.matches_orientation(target) {
            return Ok(false);
        }
        if target == Orientation::Unknown {
            return Err(VolumeLoaderError::UnsupportedReslice {
                from: self.orientation,
                to: target,
            });
        }

        let started = Instant::now();
        let view = if self.raw.is_empty() {
            Vec::new()
        } else {
            OrientationResampler::new(&self.raw)?.resample(target)?
        };
        info!(
            "Resliced {} slices to {} {target} slices in {:?}",
            self.raw.len(),
            view.len(),
            started.elapsed()
        );

        self.view = view;
        self.orientation = target;
        Ok(true)
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
