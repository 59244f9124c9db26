mod common;

use std::fs;
use std::sync::Mutex;

use common::write_axial_slice;
use dicom_slicer::{LoadProgress, NoProgress, Orientation, VolumeLoader, VolumeLoaderError};

const WIDTH: u16 = 4;
const HEIGHT: u16 = 3;

/// File names sort in the opposite order of the slice positions.
fn write_series(dir: &std::path::Path) {
    write_axial_slice(dir, "IM0003", 0, WIDTH, HEIGHT, ("400", "40"));
    write_axial_slice(dir, "IM0002", 1, WIDTH, HEIGHT, ("350", "50"));
    write_axial_slice(dir, "IM0001.dcm", 2, WIDTH, HEIGHT, ("1500", "-600"));
    fs::write(dir.join("notes.txt"), b"not a data set").expect("notes");
}

#[test]
fn loads_directory_sorted_by_position() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_series(dir.path());
    let reports = Mutex::new(Vec::new());
    let sink = |progress: LoadProgress| reports.lock().unwrap().push(progress);

    let collection = VolumeLoader::load_directory(dir.path(), &sink).expect("collection");

    assert_eq!(collection.orientation(), Orientation::Axial);
    assert_eq!(collection.raw().len(), 3);
    for (number, slice) in collection.raw().iter().enumerate() {
        assert_eq!(slice.number, number);
        assert_eq!(slice.sample(0, 0), 100 * number as u16);
    }
    assert!(collection.raw()[0].source_path.ends_with("IM0003"));

    let reports = reports.into_inner().unwrap();
    assert_eq!(reports.len(), 4);
    assert_eq!(reports[0].current, 0);
    assert!(reports.iter().all(|progress| progress.total == 3));
    assert_eq!(reports.iter().map(|progress| progress.current).max(), Some(3));
}

#[test]
fn averages_window_over_the_view() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_series(dir.path());

    let collection = VolumeLoader::load_location(dir.path(), &NoProgress).expect("collection");

    assert_eq!(collection.calculate_average_window_values(), (750.0, -170.0));
}

#[test]
fn reslices_to_every_plane_and_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_series(dir.path());
    let mut collection = VolumeLoader::load_directory(dir.path(), &NoProgress).expect("collection");

    assert!(collection.change_orientation(Orientation::Sagittal).expect("sagittal"));
    assert_eq!(collection.len(), usize::from(WIDTH));
    let sagittal = collection.slice(1).expect("slice");
    assert_eq!((sagittal.width, sagittal.height), (usize::from(HEIGHT), 3));
    // first row comes from the most superior axial slice
    assert_eq!(sagittal.sample(0, 0), 201);
    assert_eq!(sagittal.sample(2, 2), 21);
    assert!(!collection.change_orientation(Orientation::Sagittal).expect("same plane"));

    assert!(collection.change_orientation(Orientation::Coronal).expect("coronal"));
    assert_eq!(collection.len(), usize::from(HEIGHT));
    let coronal = collection.slice(2).expect("slice");
    assert_eq!((coronal.width, coronal.height), (usize::from(WIDTH), 3));
    assert_eq!(coronal.sample(3, 0), 223);

    assert!(collection.change_orientation(Orientation::Axial).expect("axial"));
    assert_eq!(collection.len(), 3);
    assert_eq!(collection.view()[2].samples(), collection.raw()[2].samples());
    assert_eq!(collection.raw().len(), 3);
}

#[test]
fn rejects_directories_without_images() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("notes.txt"), b"not a data set").expect("notes");

    assert!(matches!(
        VolumeLoader::load_directory(dir.path(), &NoProgress),
        Err(VolumeLoaderError::NoValidImages)
    ));
}

#[test]
fn exports_windowed_slice() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_series(dir.path());
    let collection = VolumeLoader::load_directory(dir.path(), &NoProgress).expect("collection");

    let image = collection
        .slice(0)
        .and_then(|slice| slice.to_windowed_image(400.0, 40.0))
        .expect("image");

    assert_eq!(image.dimensions(), (u32::from(WIDTH), u32::from(HEIGHT)));
}
