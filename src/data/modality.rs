//! Input modalities understood by backbones

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of input a backbone can embed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Image,
    Video,
    Audio,
    Text,
}

impl Modality {
    /// All modalities in canonical order
    pub fn all() -> [Modality; 4] {
        [Modality::Image, Modality::Video, Modality::Audio, Modality::Text]
    }

    /// Lowercase name used in shape dicts and metric prefixes
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Image => "image",
            Modality::Video => "video",
            Modality::Audio => "audio",
            Modality::Text => "text",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "image" => Ok(Modality::Image),
            "video" => Ok(Modality::Video),
            "audio" => Ok(Modality::Audio),
            "text" => Ok(Modality::Text),
            other => Err(format!("unknown modality '{}'", other)),
        }
    }
}
