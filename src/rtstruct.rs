//! Region-of-interest contours carried by RT Structure Set objects.

use crate::tags::attribute_text;

use dicom::core::Tag;
use dicom::object::InMemDicomObject;
use dicom_dictionary_std::tags;
use std::path::{Path, PathBuf};

pub const DEFAULT_ROI_COLOR: &str = "#FFFFFF";
pub const DEFAULT_ROI_NAME: &str = "Unknown";

/// A contour vertex in patient coordinates (mm).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoiContour {
    pub number: i32,
    pub name: String,
    /// `#RRGGBB`.
    pub color: String,
    /// Closed polygons, one per ContourSequence item.
    pub contours: Vec<Vec<Point3>>,
    pub referenced_sop_instance_uids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructureSet {
    pub source_path: PathBuf,
    /// Empty when neither the object nor its referenced frame of reference
    /// says.
    pub frame_of_reference_uid: String,
    pub rois: Vec<RoiContour>,
}

impl StructureSet {
    /// Pairs every StructureSetROISequence item with the ROIContourSequence
    /// items whose ReferencedROINumber matches its ROINumber.
    ///
    /// ROIs without contours are kept with an empty contour list. An object
    /// without either sequence yields a structure set with no ROIs.
    pub fn from_dicom_object(path: &Path, dicom_object: &InMemDicomObject) -> Self {
        let frame_of_reference_uid = attribute_text(dicom_object, tags::FRAME_OF_REFERENCE_UID)
            .or_else(|| {
                items(dicom_object, tags::REFERENCED_FRAME_OF_REFERENCE_SEQUENCE)
                    .first()
                    .and_then(|item| attribute_text(item, tags::FRAME_OF_REFERENCE_UID))
            })
            .unwrap_or_default();

        let contour_items = items(dicom_object, tags::ROI_CONTOUR_SEQUENCE);
        let rois = items(dicom_object, tags::STRUCTURE_SET_ROI_SEQUENCE)
            .iter()
            .map(|roi_item| {
                let number = int(roi_item, tags::ROI_NUMBER).unwrap_or(0);
                let mut roi = RoiContour {
                    number,
                    name: attribute_text(roi_item, tags::ROI_NAME)
                        .unwrap_or_else(|| DEFAULT_ROI_NAME.to_string()),
                    color: DEFAULT_ROI_COLOR.to_string(),
                    contours: Vec::new(),
                    referenced_sop_instance_uids: Vec::new(),
                };
                for contour_item in contour_items
                    .iter()
                    .filter(|item| int(item, tags::REFERENCED_ROI_NUMBER).unwrap_or(0) == number)
                {
                    if let Some(color) = display_color(contour_item) {
                        roi.color = color;
                    }
                    for contour in items(contour_item, tags::CONTOUR_SEQUENCE) {
                        roi.contours.push(contour_points(contour));
                        roi.referenced_sop_instance_uids.extend(
                            items(contour, tags::CONTOUR_IMAGE_SEQUENCE).iter().filter_map(
                                |image| attribute_text(image, tags::REFERENCED_SOP_INSTANCE_UID),
                            ),
                        );
                    }
                }
                roi
            })
            .collect();

        Self {
            source_path: path.to_path_buf(),
            frame_of_reference_uid,
            rois,
        }
    }
}

fn items(dicom_object: &InMemDicomObject, tag: Tag) -> &[InMemDicomObject] {
    dicom_object
        .element(tag)
        .ok()
        .and_then(|element| element.items())
        .unwrap_or(&[])
}

fn int(dicom_object: &InMemDicomObject, tag: Tag) -> Option<i32> {
    dicom_object.element(tag).ok()?.to_int::<i32>().ok()
}

fn display_color(contour_item: &InMemDicomObject) -> Option<String> {
    let rgb = contour_item
        .element(tags::ROI_DISPLAY_COLOR)
        .ok()?
        .to_multi_int::<i32>()
        .ok()?;
    match rgb.as_slice() {
        [r, g, b, ..] => Some(format!(
            "#{:02X}{:02X}{:02X}",
            r.clamp(&0, &255),
            g.clamp(&0, &255),
            b.clamp(&0, &255)
        )),
        _ => None,
    }
}

fn contour_points(contour: &InMemDicomObject) -> Vec<Point3> {
    let data = contour
        .element(tags::CONTOUR_DATA)
        .ok()
        .and_then(|element| element.to_multi_float32().ok())
        .unwrap_or_default();
    // a trailing partial triple is dropped
    data.chunks_exact(3)
        .map(|xyz| Point3 {
            x: xyz[0],
            y: xyz[1],
            z: xyz[2],
        })
        .collect()
}
