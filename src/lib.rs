//! # DICOM-slicer library
//!
//! This crate serves a high-level API for turning a set of DICOM files into
//! a volume that can be viewed in the three medical planes, plus a small
//! DICOM network stack to receive and send those files.
//!
//! This library is part of the dicom-rs ecosystem and leverages its components.
//! Volumes can either be loaded from a single file, a list of files or a
//! directory whose entries are DICOM candidates (a `.dcm` extension or no
//! extension at all). Files are decoded in parallel using rayon and progress
//! is reported through a [`ProgressSink`]. The volume can be viewed in the
//! three medical axes:
//!  - Axial
//!  - Coronal
//!  - Sagittal
//!
//!  The source orientation of a series is detected from the Image Orientation
//!  (Patient) attribute of its first slice. Reslicing keeps the source voxel
//!  grid, no interpolation takes place. CT and MR slices are ingested, RT
//!  Structure Sets are kept next to the images they were delivered with.
//!
//! # Networking
//!
//!  - [`StorageServer`] accepts associations and stores every received
//!    instance as `<root>/<StudyInstanceUID>/<SOPInstanceUID>.dcm`
//!  - [`scu`] sends C-ECHO, C-STORE, C-FIND and C-MOVE requests
//!
//! # Examples
//!
//! ## Reading a directory and exporting a sagittal slice
//!
//! ```no_run
//! # use dicom_slicer::{NoProgress, Orientation, VolumeLoader};
//! let mut volume = VolumeLoader::load_directory("dicom", &NoProgress)
//!     .expect("should have loaded files from directory");
//! volume
//!     .change_orientation(Orientation::Sagittal)
//!     .expect("should have resliced the volume");
//! let (width, level) = volume.calculate_average_window_values();
//! let image = volume
//!     .slice(volume.len() / 2)
//!     .and_then(|slice| slice.to_windowed_image(width, level))
//!     .expect("should have returned image at center of volume");
//! image.save("result.png").expect("should have written the image");
//! ```

pub mod association;
pub mod config;
pub mod dimse;
pub mod enums;
pub mod progress;
pub mod resampler;
pub mod rtstruct;
pub mod scu;
pub mod slice;
pub mod storage_server;
pub mod tags;
pub mod volume;
pub mod volume_loader;

pub use config::Config;
pub use enums::{Modality, Orientation};
pub use progress::{LoadProgress, NoProgress, ProgressSink};
pub use slice::Slice;
pub use storage_server::StorageServer;
pub use volume::VolumeCollection;
pub use volume_loader::{VolumeLoader, VolumeLoaderError};
