use crate::enums::{Modality, Orientation};
use crate::progress::{ProgressCounter, ProgressSink};
use crate::rtstruct::StructureSet;
use crate::slice::{Slice, SliceDecoder};
use crate::tags::attribute_text;
use crate::volume::VolumeCollection;

use dicom::object::open_file;
use dicom_dictionary_std::tags;
use rayon::prelude::*;
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, warn};
use web_time::Instant;

/// Direction cosine components below this magnitude count as zero.
const ORIENTATION_TOLERANCE: f32 = 0.1;

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("{}: cannot image pixel data: {message}", path.display())]
    Imaging { path: PathBuf, message: String },

    #[error("ImageOrientationPatient must contain 6 values, found {0}")]
    InvalidOrientation(usize),

    #[error("Unknown slice orientation (patient position {patient_position})")]
    UnknownOrientation { patient_position: String },

    #[error("Sample buffer holds {actual} values, expected {expected}")]
    SampleCount { expected: usize, actual: usize },

    #[error("Cannot reslice a {from} volume to {to}")]
    UnsupportedReslice { from: Orientation, to: Orientation },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

impl VolumeLoaderError {
    /// Orientation errors invalidate the whole series, everything else only
    /// the file it came from.
    fn aborts_load(&self) -> bool {
        matches!(
            self,
            VolumeLoaderError::InvalidOrientation(_) | VolumeLoaderError::UnknownOrientation { .. }
        )
    }
}

/// What a single file contributed.
enum FileContents {
    Slices(Vec<Slice>),
    StructureSet(StructureSet),
    Skipped,
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Classifies a plane from its ImageOrientationPatient direction cosines.
    ///
    /// Checks axial, sagittal and coronal in that order; the first plane whose
    /// normal axis has both row and column components under 0.1 wins.
    ///
    /// # Errors
    ///
    /// [`VolumeLoaderError::InvalidOrientation`] for fewer than 6 cosines,
    /// [`VolumeLoaderError::UnknownOrientation`] for oblique planes.
    pub fn determine_slice_orientation(
        cosines: &[f32],
        patient_position: &str,
    ) -> Result<Orientation, VolumeLoaderError> {
        let [row_x, row_y, row_z, col_x, col_y, col_z] = match cosines {
            [a, b, c, d, e, f, ..] => [*a, *b, *c, *d, *e, *f],
            _ => return Err(VolumeLoaderError::InvalidOrientation(cosines.len())),
        };
        let flat = |row: f32, col: f32| {
            row.abs() < ORIENTATION_TOLERANCE && col.abs() < ORIENTATION_TOLERANCE
        };

        if flat(row_z, col_z) {
            Ok(Orientation::Axial)
        } else if flat(row_x, col_x) {
            Ok(Orientation::Sagittal)
        } else if flat(row_y, col_y) {
            Ok(Orientation::Coronal)
        } else {
            Err(VolumeLoaderError::UnknownOrientation {
                patient_position: patient_position.to_string(),
            })
        }
    }

    /// Load a single file. Any failure is returned.
    pub fn load_file(
        path: impl AsRef<Path>,
        progress: &dyn ProgressSink,
    ) -> Result<VolumeCollection, VolumeLoaderError> {
        let path = path.as_ref();
        let counter = ProgressCounter::new(progress, 1);
        let contents = Self::read_file(path);
        counter.tick();

        let mut raw = Vec::new();
        let mut structure_sets = Vec::new();
        match contents? {
            FileContents::Slices(slices) => raw = slices,
            FileContents::StructureSet(structure_set) => structure_sets.push(structure_set),
            FileContents::Skipped => {}
        }
        Self::assemble(raw, structure_sets)
    }

    /// Load a set of files in parallel.
    ///
    /// Files that cannot be read or imaged are logged and skipped; an
    /// orientation error in any file fails the whole load.
    ///
    /// # Errors
    ///
    /// Returns error if no file contributed slices or contours.
    pub fn load_files(
        paths: &[impl AsRef<Path> + Sync],
        progress: &dyn ProgressSink,
    ) -> Result<VolumeCollection, VolumeLoaderError> {
        let started = Instant::now();
        let counter = ProgressCounter::new(progress, paths.len());

        // indexed collect keeps discovery order, so equal z values stay stable
        let results: Vec<_> = paths
            .par_iter()
            .map(|path| {
                let contents = Self::read_file(path.as_ref());
                counter.tick();
                (path.as_ref(), contents)
            })
            .collect();

        let mut raw = Vec::new();
        let mut structure_sets = Vec::new();
        for (path, contents) in results {
            match contents {
                Ok(FileContents::Slices(slices)) => raw.extend(slices),
                Ok(FileContents::StructureSet(structure_set)) => {
                    structure_sets.push(structure_set)
                }
                Ok(FileContents::Skipped) => {}
                Err(err) if err.aborts_load() => return Err(err),
                Err(err) => warn!("Skipping {}: {err}", path.display()),
            }
        }

        info!(
            "Decoded {} slices and {} structure sets from {} files in {:?}",
            raw.len(),
            structure_sets.len(),
            paths.len(),
            started.elapsed()
        );
        Self::assemble(raw, structure_sets)
    }

    /// Load every DICOM candidate in a directory (not recursive).
    pub fn load_directory(
        path: impl AsRef<Path>,
        progress: &dyn ProgressSink,
    ) -> Result<VolumeCollection, VolumeLoaderError> {
        let mut paths: Vec<_> = fs::read_dir(path.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && Self::is_dicom_candidate(path))
            .collect();
        // read_dir order is platform dependent
        paths.sort();

        if paths.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }

        Self::load_files(&paths, progress)
    }

    /// Load a file or a directory.
    pub fn load_location(
        path: impl AsRef<Path>,
        progress: &dyn ProgressSink,
    ) -> Result<VolumeCollection, VolumeLoaderError> {
        let path = path.as_ref();
        if path.is_dir() {
            Self::load_directory(path, progress)
        } else {
            Self::load_file(path, progress)
        }
    }

    /// `.dcm` in any case, or no extension at all.
    pub fn is_dicom_candidate(path: &Path) -> bool {
        match path.file_name().and_then(|name| name.to_str()) {
            Some(name) if !name.contains('.') => true,
            _ => path
                .extension()
                .and_then(|s| s.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm")),
        }
    }

    fn read_file(path: &Path) -> Result<FileContents, VolumeLoaderError> {
        let started = Instant::now();
        let dicom_object = open_file(path)?;
        let modality = attribute_text(&dicom_object, tags::MODALITY)
            .map(|value| Modality::from(value.as_str()))
            .unwrap_or_else(|| Modality::Other(String::new()));

        let contents = match modality {
            modality if modality.is_image() => {
                FileContents::Slices(SliceDecoder::decode_object(path, &dicom_object)?)
            }
            Modality::RtStruct => {
                FileContents::StructureSet(StructureSet::from_dicom_object(path, &dicom_object))
            }
            other => {
                info!("{}: modality {other} is not ingested", path.display());
                FileContents::Skipped
            }
        };
        debug!("Read {} in {:?}", path.display(), started.elapsed());
        Ok(contents)
    }

    fn assemble(
        mut raw: Vec<Slice>,
        structure_sets: Vec<StructureSet>,
    ) -> Result<VolumeCollection, VolumeLoaderError> {
        if raw.is_empty() && structure_sets.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }
        Self::sort_slices(&mut raw);
        Ok(VolumeCollection::new(raw, structure_sets))
    }

    /// Stable sort by z (0 when unknown), then renumber 0..N-1.
    fn sort_slices(slices: &mut [Slice]) {
        slices.sort_by(|a, b| {
            a.z_position()
                .partial_cmp(&b.z_position())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for (number, slice) in slices.iter_mut().enumerate() {
            slice.number = number;
        }
    }
}
