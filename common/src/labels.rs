//! The fixed, ordered label set of the ESC-50 environmental sound classes.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::info;

/// ESC-50 category names in the order the classifier emits scores.
pub const ESC50_LABELS: [&str; 50] = [
    "airplane",
    "breathing",
    "brushing_teeth",
    "can_opening",
    "car_horn",
    "cat",
    "chainsaw",
    "chirping_birds",
    "church_bells",
    "clapping",
    "clock_alarm",
    "clock_tick",
    "coughing",
    "cow",
    "crackling_fire",
    "crickets",
    "crow",
    "crying_baby",
    "dog",
    "door_wood_creaks",
    "door_wood_knock",
    "drinking_sipping",
    "engine",
    "fireworks",
    "footsteps",
    "frog",
    "glass_breaking",
    "hand_saw",
    "helicopter",
    "hen",
    "insects",
    "keyboard_typing",
    "laughing",
    "mouse_click",
    "pig",
    "pouring_water",
    "rain",
    "rooster",
    "sea_waves",
    "sheep",
    "siren",
    "sneezing",
    "snoring",
    "thunderstorm",
    "toilet_flush",
    "train",
    "vacuum_cleaner",
    "washing_machine",
    "water_drops",
    "wind",
];

/// Ordered, immutable list of category names.
///
/// Built once at startup and shared read-only; there is no way to mutate a
/// `LabelSet` after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    labels: Vec<String>,
}

impl LabelSet {
    /// The built-in ESC-50 label set.
    pub fn esc50() -> Self {
        Self {
            labels: ESC50_LABELS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Build a label set from an explicit list. Empty lists are rejected.
    pub fn new(labels: Vec<String>) -> Result<Self> {
        if labels.is_empty() {
            bail!("Label set must contain at least one label");
        }
        Ok(Self { labels })
    }

    /// Read one label per line, skipping blank lines.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read labels: {}", path.display()))?;
        let labels: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        info!("Loaded {} labels from {}", labels.len(), path.display());
        Self::new(labels).with_context(|| format!("No labels in {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.labels
    }
}

impl Default for LabelSet {
    fn default() -> Self {
        Self::esc50()
    }
}
