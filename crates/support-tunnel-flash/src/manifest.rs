//! Firmware manifest in the ESP Web Tools format.

use serde::{Deserialize, Serialize};

use crate::error::FlashError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub builds: Vec<Build>,
}

/// Images for one chip family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    pub chip_family: String,
    pub parts: Vec<Part>,
}

/// One image and the flash address it is written to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub path: String,
    pub offset: u32,
}

impl Manifest {
    /// Parse a manifest document.
    ///
    /// # Errors
    /// Returns error if the document is not a valid manifest.
    pub fn parse(json: &str) -> Result<Self, FlashError> {
        serde_json::from_str(json).map_err(|e| FlashError::Manifest(e.to_string()))
    }

    /// Build for `chip_family`, matched case-insensitively.
    #[must_use]
    pub fn build_for(&self, chip_family: &str) -> Option<&Build> {
        self.builds
            .iter()
            .find(|b| b.chip_family.eq_ignore_ascii_case(chip_family))
    }
}
