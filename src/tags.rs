//! Display metadata extracted once per data set.

use std::fmt;

use chrono::{NaiveDate, NaiveTime};
use dicom::core::Tag;
use dicom::object::InMemDicomObject;
use dicom_dictionary_std::tags;

pub const DEFAULT_WINDOW_WIDTH: f64 = 400.0;
pub const DEFAULT_WINDOW_LEVEL: f64 = 40.0;

/// Patient, study and image text plus the display window of a data set.
///
/// Missing attributes never fail extraction: their line is simply omitted,
/// and the window falls back to 400/40.
#[derive(Debug, Clone, PartialEq)]
pub struct TagRecord {
    pub patient_details: String,
    pub study_details: String,
    pub image_details: String,
    pub window_width: f64,
    pub window_level: f64,
}

impl Default for TagRecord {
    fn default() -> Self {
        Self {
            patient_details: String::new(),
            study_details: String::new(),
            image_details: String::new(),
            window_width: DEFAULT_WINDOW_WIDTH,
            window_level: DEFAULT_WINDOW_LEVEL,
        }
    }
}

impl TagRecord {
    pub fn from_dicom_object(dicom_object: &InMemDicomObject) -> Self {
        let text = |tag| attribute_text(dicom_object, tag).unwrap_or_default();
        let number = |tag| {
            dicom_object
                .element(tag)
                .ok()
                .and_then(|element| element.to_int::<u32>().ok())
                .unwrap_or(0)
        };
        let window = |tag, default| {
            dicom_object
                .element(tag)
                .ok()
                .and_then(|element| element.to_float64().ok())
                .unwrap_or(default)
        };

        Self {
            patient_details: patient_details(
                &text(tags::PATIENT_NAME),
                &text(tags::PATIENT_ID),
                &text(tags::PATIENT_SEX),
                &text(tags::PATIENT_BIRTH_DATE),
            ),
            study_details: study_details(
                &text(tags::STUDY_DATE),
                &text(tags::STUDY_TIME),
                &text(tags::INSTITUTION_NAME),
                &text(tags::STUDY_DESCRIPTION),
                &text(tags::SERIES_DESCRIPTION),
            ),
            image_details: image_details(
                number(tags::NUMBER_OF_FRAMES),
                number(tags::COLUMNS),
                number(tags::ROWS),
            ),
            window_width: window(tags::WINDOW_WIDTH, DEFAULT_WINDOW_WIDTH),
            window_level: window(tags::WINDOW_CENTER, DEFAULT_WINDOW_LEVEL),
        }
    }
}

impl fmt::Display for TagRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.patient_details)?;
        if self.patient_details.len() > 1 {
            f.write_str("\n")?;
        }
        f.write_str(&self.study_details)
    }
}

/// Reads a string attribute, trimmed of padding. Empty values count as absent.
pub(crate) fn attribute_text(dicom_object: &InMemDicomObject, tag: Tag) -> Option<String> {
    dicom_object
        .element(tag)
        .ok()
        .and_then(|element| element.to_str().ok())
        .map(|value| value.trim_matches(|c: char| c == '\0' || c.is_whitespace()).to_string())
        .filter(|value| !value.is_empty())
}

fn patient_details(name: &str, id: &str, sex: &str, birth_date: &str) -> String {
    let mut lines = String::new();
    if !name.is_empty() {
        lines.push_str(&format!("Name: {name}\n"));
    }
    if id.len() > 1 {
        lines.push_str(&format!("ID: {id} {sex}\n"));
    }
    if birth_date.len() > 1 && lines.len() > 1 {
        lines.push_str(&format!("DOB: {}\n", format_dicom_date(birth_date)));
    }
    lines
}

fn study_details(
    date: &str,
    time: &str,
    institution: &str,
    study_description: &str,
    series_description: &str,
) -> String {
    let mut lines = String::new();
    if !date.is_empty() {
        lines.push_str(&format!(
            "Date: {} {}\n",
            format_dicom_date(date),
            format_dicom_time(time)
        ));
    }
    if !institution.is_empty() {
        let collapsed = institution.split_whitespace().collect::<Vec<_>>().join(" ");
        lines.push_str(&format!("Location: {collapsed}\n"));
    }
    for description in [study_description, series_description] {
        if !description.is_empty() {
            lines.push_str(description);
            lines.push('\n');
        }
    }
    lines
}

fn image_details(frames: u32, columns: u32, rows: u32) -> String {
    let mut lines = String::new();
    if frames != 0 {
        lines.push_str(&format!("Frames: {frames}\n"));
    }
    if columns > 0 && rows > 0 {
        lines.push_str(&format!("Size: {columns}x{rows}"));
    }
    lines
}

/// Formats a DICOM `DA` value (`YYYYMMDD`) as `dd-MMM-yyyy`.
///
/// Anything that is not exactly eight digits forming a real date is returned
/// unchanged.
pub fn format_dicom_date(raw: &str) -> String {
    if raw.len() == 8 && raw.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y%m%d") {
            return date.format("%d-%b-%Y").to_string();
        }
    }
    raw.to_string()
}

/// Formats a DICOM `TM` value (`HHmmss[.ffffff]`) as `HH:mm:ss`.
///
/// The fractional part is dropped first; anything else that is not exactly six
/// digits is returned unchanged.
pub fn format_dicom_time(raw: &str) -> String {
    let whole = match raw.find('.') {
        Some(idx) if idx > 0 => &raw[..idx],
        _ => raw,
    };
    if whole.len() == 6 && whole.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(time) = NaiveTime::parse_from_str(whole, "%H%M%S") {
            return time.format("%H:%M:%S").to_string();
        }
    }
    whole.to_string()
}
