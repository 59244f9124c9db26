use std::path::{Path, PathBuf};

use dicom::core::{DataElement, PrimitiveValue, VR, dicom_value};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_dictionary_std::{tags, uids};

pub const STUDY_INSTANCE_UID: &str = "1.2.826.0.1.3680043.2.1125.1";

/// Writes one single-frame axial CT slice. Sample `(x, y)` holds
/// `100 * index + 10 * y + x`.
pub fn write_axial_slice(
    dir: &Path,
    file_name: &str,
    index: u16,
    width: u16,
    height: u16,
    window: (&str, &str),
) -> PathBuf {
    let samples: Vec<u16> = (0..height)
        .flat_map(|y| (0..width).map(move |x| 100 * index + 10 * y + x))
        .collect();
    let sop_instance_uid = format!("{STUDY_INSTANCE_UID}.{}", index + 1);
    let z = f32::from(index) * 2.5;

    let dicom_object = InMemDicomObject::from_element_iter([
        DataElement::new(tags::SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::CT_IMAGE_STORAGE)),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, sop_instance_uid.as_str())),
        DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, STUDY_INSTANCE_UID)),
        DataElement::new(tags::MODALITY, VR::CS, dicom_value!(Str, "CT")),
        DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, "Roe^Alex")),
        DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, "PX-42")),
        DataElement::new(tags::PATIENT_POSITION, VR::CS, dicom_value!(Str, "HFS")),
        DataElement::new(
            tags::IMAGE_POSITION_PATIENT,
            VR::DS,
            dicom_value!(Strs, ["0".to_string(), "0".to_string(), z.to_string()]),
        ),
        DataElement::new(
            tags::IMAGE_ORIENTATION_PATIENT,
            VR::DS,
            dicom_value!(Strs, ["1", "0", "0", "0", "1", "0"]),
        ),
        DataElement::new(tags::PIXEL_SPACING, VR::DS, dicom_value!(Strs, ["0.5", "0.5"])),
        DataElement::new(tags::SLICE_THICKNESS, VR::DS, dicom_value!(Str, "2.5")),
        DataElement::new(tags::WINDOW_WIDTH, VR::DS, dicom_value!(Str, window.0)),
        DataElement::new(tags::WINDOW_CENTER, VR::DS, dicom_value!(Str, window.1)),
        DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, dicom_value!(U16, [1])),
        DataElement::new(
            tags::PHOTOMETRIC_INTERPRETATION,
            VR::CS,
            dicom_value!(Str, "MONOCHROME2"),
        ),
        DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [height])),
        DataElement::new(tags::COLUMNS, VR::US, dicom_value!(U16, [width])),
        DataElement::new(tags::BITS_ALLOCATED, VR::US, dicom_value!(U16, [16])),
        DataElement::new(tags::BITS_STORED, VR::US, dicom_value!(U16, [16])),
        DataElement::new(tags::HIGH_BIT, VR::US, dicom_value!(U16, [15])),
        DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, dicom_value!(U16, [0])),
        DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::U16(samples.into())),
    ]);
    let file = dicom_object
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
                .media_storage_sop_instance_uid(sop_instance_uid.as_str()),
        )
        .expect("file meta should be complete");

    let path = dir.join(file_name);
    file.write_to_file(&path).expect("should have written the slice");
    path
}
