use crate::enums::Orientation;
use crate::tags::TagRecord;
use crate::volume_loader::{VolumeLoader, VolumeLoaderError};

use dicom::core::Tag;
use dicom::object::{FileDicomObject, InMemDicomObject};
use dicom::pixeldata::{DecodedPixelData, PixelDecoder};
use dicom_dictionary_std::tags;
use image::GrayImage;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

pub const DEFAULT_PATIENT_POSITION: &str = "Unknown";
pub const UNKNOWN_SLICE_THICKNESS: f32 = -1.0;

/// Spatial and modality LUT attributes shared by every frame of a data set.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceGeometry {
    pub patient_position: String,
    pub image_position: Option<[f32; 3]>,
    pub image_orientation: [f32; 6],
    pub orientation: Orientation,
    pub rescale_slope: f32,
    pub rescale_intercept: f32,
    /// Row spacing and column spacing, in the order PixelSpacing stores them.
    pub pixel_spacing: (f32, f32),
    /// `-1.0` when the data set does not say.
    pub slice_thickness: f32,
    /// Stored values are two's complement (PixelRepresentation = 1).
    pub signed_samples: bool,
}

impl SliceGeometry {
    /// Reads the geometry of a CT or MR data set.
    ///
    /// # Errors
    ///
    /// Fails when ImageOrientationPatient is absent or its direction cosines
    /// do not describe an axial, sagittal or coronal plane.
    pub fn from_dicom_object(
        path: &Path,
        dicom_object: &InMemDicomObject,
    ) -> Result<Self, VolumeLoaderError> {
        let image_orientation: Vec<f32> = floats(dicom_object, tags::IMAGE_ORIENTATION_PATIENT)
            .ok_or(VolumeLoaderError::InvalidOrientation(0))?;
        let patient_position = crate::tags::attribute_text(dicom_object, tags::PATIENT_POSITION)
            .unwrap_or_else(|| DEFAULT_PATIENT_POSITION.to_string());
        let orientation =
            VolumeLoader::determine_slice_orientation(&image_orientation, &patient_position)?;

        let image_position = floats(dicom_object, tags::IMAGE_POSITION_PATIENT)
            .filter(|position| position.len() >= 3)
            .map(|position| [position[0], position[1], position[2]]);

        let pixel_spacing = match floats(dicom_object, tags::PIXEL_SPACING).as_deref() {
            Some([row, column, ..]) => (*row, *column),
            _ => {
                warn!("{}: no PixelSpacing, assuming 1.0\\1.0", path.display());
                (1.0, 1.0)
            }
        };

        let mut cosines = [0.0; 6];
        cosines.copy_from_slice(&image_orientation[..6]);

        Ok(Self {
            patient_position,
            image_position,
            image_orientation: cosines,
            orientation,
            rescale_slope: float(dicom_object, tags::RESCALE_SLOPE).unwrap_or(1.0),
            rescale_intercept: float(dicom_object, tags::RESCALE_INTERCEPT).unwrap_or(0.0),
            pixel_spacing,
            slice_thickness: float(dicom_object, tags::SLICE_THICKNESS)
                .unwrap_or(UNKNOWN_SLICE_THICKNESS),
            signed_samples: dicom_object
                .element(tags::PIXEL_REPRESENTATION)
                .ok()
                .and_then(|element| element.to_int::<u16>().ok())
                == Some(1),
        })
    }
}

fn floats(dicom_object: &InMemDicomObject, tag: Tag) -> Option<Vec<f32>> {
    dicom_object.element(tag).ok()?.to_multi_float32().ok()
}

fn float(dicom_object: &InMemDicomObject, tag: Tag) -> Option<f32> {
    dicom_object.element(tag).ok()?.to_float32().ok()
}

/// One 2D cross-section of a volume.
#[derive(Debug, Clone)]
pub struct Slice {
    pub source_path: PathBuf,
    pub source_directory: PathBuf,
    pub tags: Arc<TagRecord>,
    /// Display order within the owning collection.
    pub number: usize,
    pub width: usize,
    pub height: usize,
    pub geometry: SliceGeometry,
    pub window_width: f64,
    pub window_center: f64,
    samples: Vec<u16>,
}

impl Slice {
    /// # Errors
    ///
    /// Returns [`VolumeLoaderError::SampleCount`] unless `samples` holds exactly
    /// `width * height` values.
    pub fn new(
        source_path: PathBuf,
        tags: Arc<TagRecord>,
        number: usize,
        width: usize,
        height: usize,
        geometry: SliceGeometry,
        samples: Vec<u16>,
    ) -> Result<Self, VolumeLoaderError> {
        if samples.len() != width * height {
            return Err(VolumeLoaderError::SampleCount {
                expected: width * height,
                actual: samples.len(),
            });
        }
        let source_directory = source_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(Self {
            source_path,
            source_directory,
            window_width: tags.window_width,
            window_center: tags.window_level,
            tags,
            number,
            width,
            height,
            geometry,
            samples,
        })
    }

    pub fn samples(&self) -> &[u16] {
        &self.samples
    }

    pub fn orientation(&self) -> Orientation {
        self.geometry.orientation
    }

    /// The z component of ImagePositionPatient, or 0 when unknown.
    pub fn z_position(&self) -> f32 {
        self.geometry.image_position.map_or(0.0, |position| position[2])
    }

    /// Stored value of column `x` in row `y`.
    ///
    /// # Panics
    ///
    /// Panics when `x >= width` or `y >= height`.
    #[inline]
    pub fn sample(&self, x: usize, y: usize) -> u16 {
        assert!(
            x < self.width && y < self.height,
            "sample ({x}, {y}) outside {}x{} slice",
            self.width,
            self.height
        );
        self.samples[y * self.width + x]
    }

    /// Applies the modality rescale: `raw * slope + intercept`.
    #[inline]
    pub fn rescaled(&self, raw: u16) -> f64 {
        let stored = if self.geometry.signed_samples {
            f64::from(raw as i16)
        } else {
            f64::from(raw)
        };
        stored * f64::from(self.geometry.rescale_slope) + f64::from(self.geometry.rescale_intercept)
    }

    /// Maps the rescaled samples through a linear window to 8-bit grayscale.
    pub fn to_windowed_image(&self, window_width: f64, window_center: f64) -> Option<GrayImage> {
        let low = window_center - window_width / 2.0;
        let span = window_width.max(1.0);
        let pixel_data: Vec<u8> = self
            .samples
            .par_iter()
            .map(|&raw| ((self.rescaled(raw) - low) * 255.0 / span).clamp(0.0, 255.0) as u8)
            .collect();
        GrayImage::from_raw(self.width as u32, self.height as u32, pixel_data)
    }

    /// Renders with the slice's own window.
    pub fn to_image(&self) -> Option<GrayImage> {
        self.to_windowed_image(self.window_width, self.window_center)
    }
}

/// Decodes the frames of one CT or MR data set into slices.
pub struct SliceDecoder<'a> {
    path: &'a Path,
    tags: Arc<TagRecord>,
    geometry: SliceGeometry,
    pixel_data: DecodedPixelData<'a>,
}

impl<'a> SliceDecoder<'a> {
    /// Reads the metadata and decodes the pixel data of `dicom_object`.
    ///
    /// # Errors
    ///
    /// Geometry errors are returned as is; anything that prevents the pixel
    /// data from being imaged becomes [`VolumeLoaderError::Imaging`].
    pub fn new(
        path: &'a Path,
        dicom_object: &'a FileDicomObject<InMemDicomObject>,
    ) -> Result<Self, VolumeLoaderError> {
        let tags = Arc::new(TagRecord::from_dicom_object(dicom_object));
        let geometry = SliceGeometry::from_dicom_object(path, dicom_object)?;
        let pixel_data = dicom_object
            .decode_pixel_data()
            .map_err(|err| imaging_error(path, err))?;

        if pixel_data.bits_allocated() != 16 || pixel_data.samples_per_pixel() != 1 {
            return Err(imaging_error(
                path,
                format!(
                    "unsupported pixel layout: {} bits allocated, {} samples per pixel",
                    pixel_data.bits_allocated(),
                    pixel_data.samples_per_pixel()
                ),
            ));
        }

        let decoder = Self {
            path,
            tags,
            geometry,
            pixel_data,
        };
        let needed = decoder.frame_len() * decoder.frame_count();
        if decoder.pixel_data.data().len() < needed {
            return Err(imaging_error(
                path,
                format!(
                    "pixel data holds {} bytes, {} frames need {needed}",
                    decoder.pixel_data.data().len(),
                    decoder.frame_count()
                ),
            ));
        }
        Ok(decoder)
    }

    /// Decodes every frame of `dicom_object` in one go.
    pub fn decode_object(
        path: &'a Path,
        dicom_object: &'a FileDicomObject<InMemDicomObject>,
    ) -> Result<Vec<Slice>, VolumeLoaderError> {
        Self::new(path, dicom_object)?.decode_all()
    }

    pub fn tags(&self) -> &Arc<TagRecord> {
        &self.tags
    }

    pub fn frame_count(&self) -> usize {
        self.pixel_data.number_of_frames() as usize
    }

    fn width(&self) -> usize {
        self.pixel_data.columns() as usize
    }

    fn height(&self) -> usize {
        self.pixel_data.rows() as usize
    }

    fn frame_len(&self) -> usize {
        self.width() * self.height() * 2
    }

    fn frame_context(&self) -> FrameContext<'_> {
        FrameContext {
            path: self.path,
            tags: &self.tags,
            geometry: &self.geometry,
            width: self.width(),
            height: self.height(),
        }
    }

    /// Produces the slice of frame `frame` (0-based).
    pub fn decode_frame(&self, frame: usize) -> Result<Slice, VolumeLoaderError> {
        if frame >= self.frame_count() {
            return Err(imaging_error(
                self.path,
                format!("frame {frame} out of range ({} frames)", self.frame_count()),
            ));
        }
        let frame_len = self.frame_len();
        let bytes = &self.pixel_data.data()[frame * frame_len..(frame + 1) * frame_len];
        self.frame_context().slice(frame, bytes)
    }

    /// Produces one slice per frame, in frame order. Frames are converted on
    /// the rayon pool.
    pub fn decode_all(&self) -> Result<Vec<Slice>, VolumeLoaderError> {
        let context = self.frame_context();
        let frame_len = self.frame_len();
        let data = self.pixel_data.data();
        (0..self.frame_count())
            .into_par_iter()
            .map(|frame| context.slice(frame, &data[frame * frame_len..(frame + 1) * frame_len]))
            .collect()
    }
}

/// The per-object state a frame conversion needs, detached from the decoded
/// pixel data so that it can be shared across the pool.
struct FrameContext<'a> {
    path: &'a Path,
    tags: &'a Arc<TagRecord>,
    geometry: &'a SliceGeometry,
    width: usize,
    height: usize,
}

impl FrameContext<'_> {
    fn slice(&self, frame: usize, bytes: &[u8]) -> Result<Slice, VolumeLoaderError> {
        // host byte order, the decoder already produced native samples
        let samples: Vec<u16> = bytemuck::pod_collect_to_vec(bytes);
        Slice::new(
            self.path.to_path_buf(),
            Arc::clone(self.tags),
            frame,
            self.width,
            self.height,
            self.geometry.clone(),
            samples,
        )
    }
}

fn imaging_error(path: &Path, err: impl ToString) -> VolumeLoaderError {
    VolumeLoaderError::Imaging {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
