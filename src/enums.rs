use std::{fmt, str::FromStr};

/// Anatomical plane of a slice or of a whole view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Orientation {
    #[default]
    Axial,
    Sagittal,
    Coronal,
    Unknown,
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Orientation::Axial => "axial",
            Orientation::Sagittal => "sagittal",
            Orientation::Coronal => "coronal",
            Orientation::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

impl FromStr for Orientation {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "axial" => Ok(Orientation::Axial),
            "sagittal" => Ok(Orientation::Sagittal),
            "coronal" => Ok(Orientation::Coronal),
            other => Err(format!("unknown orientation {other:?}")),
        }
    }
}

/// The modality of a data set, which selects how it is ingested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modality {
    Ct,
    Mr,
    RtStruct,
    Other(String),
}

impl Modality {
    /// CT and MR share the same geometric and pixel extraction.
    pub fn is_image(&self) -> bool {
        matches!(self, Modality::Ct | Modality::Mr)
    }
}

impl From<&str> for Modality {
    fn from(value: &str) -> Self {
        match value.trim() {
            "CT" => Modality::Ct,
            "MR" => Modality::Mr,
            "RTSTRUCT" => Modality::RtStruct,
            other => Modality::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modality::Ct => f.write_str("CT"),
            Modality::Mr => f.write_str("MR"),
            Modality::RtStruct => f.write_str("RTSTRUCT"),
            Modality::Other(name) if name.is_empty() => f.write_str("<none>"),
            Modality::Other(name) => f.write_str(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_orientations() {
        assert_eq!("Sagittal".parse(), Ok(Orientation::Sagittal));
        assert_eq!("coronal".parse(), Ok(Orientation::Coronal));
        assert!("oblique".parse::<Orientation>().is_err());
        assert_eq!(Orientation::Axial.to_string(), "axial");
    }

    #[test]
    fn maps_modalities() {
        assert_eq!(Modality::from(" CT "), Modality::Ct);
        assert_eq!(Modality::from("RTSTRUCT"), Modality::RtStruct);
        assert!(Modality::from("MR").is_image());
        assert_eq!(Modality::from("US"), Modality::Other("US".to_string()));
        assert!(!Modality::from("US").is_image());
    }
}
