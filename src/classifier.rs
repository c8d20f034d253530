//! Image tagging
//!
//! Tagging is optional and best-effort: a classifier failure leaves the
//! record untagged and never aborts a pass.

use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::{CatalogError, CatalogResult};
use crate::models::TagScore;

/// Tagging strategy selected in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaggingModel {
    /// No tagging
    #[default]
    Off,
    /// Built-in palette classifier
    DominantColor,
}

impl TaggingModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaggingModel::Off => "off",
            TaggingModel::DominantColor => "dominant-color",
        }
    }
}

impl std::str::FromStr for TaggingModel {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" | "none" => Ok(TaggingModel::Off),
            "dominant-color" => Ok(TaggingModel::DominantColor),
            other => Err(CatalogError::config_error(
                None,
                format!("Unknown tagging model: {}", other),
            )),
        }
    }
}

/// An image classifier producing scored tags
pub trait Classify: Send + Sync {
    /// Identifier stored alongside the tags
    fn model_id(&self) -> &str;

    /// Tags for the image at `path`, best first
    fn classify(&self, path: &Path) -> CatalogResult<Vec<TagScore>>;
}

/// The tagging strategy in effect for a reconciler
#[derive(Clone, Default)]
pub enum Tagger {
    #[default]
    Off,
    DominantColor(DominantColorClassifier),
    Custom(Arc<dyn Classify>),
}

impl std::fmt::Debug for Tagger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tagger::Off => write!(f, "Tagger::Off"),
            Tagger::DominantColor(_) => write!(f, "Tagger::DominantColor"),
            Tagger::Custom(c) => write!(f, "Tagger::Custom({})", c.model_id()),
        }
    }
}

impl Tagger {
    /// Build the tagger for a configured model
    pub fn from_model(model: TaggingModel) -> Self {
        match model {
            TaggingModel::Off => Tagger::Off,
            TaggingModel::DominantColor => Tagger::DominantColor(DominantColorClassifier::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Tagger::Off)
    }

    /// Tag an image. Returns `None` when tagging is off or fails.
    pub fn tag(&self, path: &Path) -> Option<(Vec<TagScore>, String)> {
        let classifier: &dyn Classify = match self {
            Tagger::Off => return None,
            Tagger::DominantColor(c) => c,
            Tagger::Custom(c) => c.as_ref(),
        };
        match classifier.classify(path) {
            Ok(tags) => Some((tags, classifier.model_id().to_string())),
            Err(e) => {
                log::warn!("Tagging failed for {:?}: {}", path, e);
                None
            }
        }
    }
}

/// Tags an image with the names of its most common colors
#[derive(Debug, Clone)]
pub struct DominantColorClassifier {
    sample_size: u32,
    max_tags: usize,
}

impl Default for DominantColorClassifier {
    fn default() -> Self {
        Self {
            sample_size: 32,
            max_tags: 3,
        }
    }
}

impl Classify for DominantColorClassifier {
    fn model_id(&self) -> &str {
        TaggingModel::DominantColor.as_str()
    }

    fn classify(&self, path: &Path) -> CatalogResult<Vec<TagScore>> {
        let img = image::open(path)
            .map_err(|e| CatalogError::classifier_error(path.to_path_buf(), e.to_string()))?;
        let sample = img
            .resize_exact(self.sample_size, self.sample_size, FilterType::Triangle)
            .to_rgba8();

        let mut counts: HashMap<&'static str, u32> = HashMap::new();
        let mut total = 0u32;
        for pixel in sample.pixels() {
            if pixel[3] < 128 {
                continue;
            }
            *counts.entry(color_name(pixel[0], pixel[1], pixel[2])).or_default() += 1;
            total += 1;
        }
        if total == 0 {
            return Ok(Vec::new());
        }

        let mut ranked: Vec<_> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        Ok(ranked
            .into_iter()
            .take(self.max_tags)
            .map(|(name, count)| TagScore {
                tag: name.to_string(),
                confidence: count as f32 / total as f32,
            })
            .collect())
    }
}

/// Coarse color name for an sRGB pixel
fn color_name(r: u8, g: u8, b: u8) -> &'static str {
    let (r, g, b) = (r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    if max < 0.15 {
        return "black";
    }
    let saturation = if max > 0.0 { delta / max } else { 0.0 };
    if saturation < 0.2 {
        return if max > 0.85 { "white" } else { "gray" };
    }

    let hue = if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };

    match hue {
        h if !(15.0..345.0).contains(&h) => "red",
        h if h < 45.0 => "orange",
        h if h < 70.0 => "yellow",
        h if h < 170.0 => "green",
        h if h < 200.0 => "cyan",
        h if h < 260.0 => "blue",
        h if h < 300.0 => "purple",
        _ => "pink",
    }
}
