use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::OverlayError;

/// Options for the map overlay.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayOptions {
    /// Base map imagery (default: satellite)
    #[serde(default)]
    pub map_type: MapType,

    /// Reuse pool key for pin views (default: "waypoint")
    #[serde(default = "default_reuse_identifier")]
    pub reuse_identifier: String,

    /// Frame of the callout thumbnail placeholder (default: 59x59)
    #[serde(default)]
    pub thumbnail_size: Size,

    /// Timeout for track and thumbnail fetches in milliseconds (default: 30000)
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Animate the viewport when framing a loaded track (default: true)
    #[serde(default = "default_true")]
    pub animate_framing: bool,

    /// Extra span added on each side of the framed region, as a fraction (default: 0.1)
    #[serde(default = "default_frame_padding")]
    pub frame_padding: f64,

    /// Smallest span of the framed region in degrees (default: 0.01)
    #[serde(default = "default_min_span_degrees")]
    pub min_span_degrees: f64,

    /// Navigation route for the full-size image screen (default: "show-image")
    #[serde(default = "default_show_image_route")]
    pub show_image_route: String,

    /// Track to load as soon as the overlay is created (default: none)
    #[serde(default)]
    pub initial_track_url: Option<String>,

    /// Console log level, "off" or "error" through "trace" (default: "warn")
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for OverlayOptions {
    fn default() -> Self {
        Self {
            map_type: MapType::default(),
            reuse_identifier: default_reuse_identifier(),
            thumbnail_size: Size::default(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            animate_framing: true,
            frame_padding: default_frame_padding(),
            min_span_degrees: default_min_span_degrees(),
            show_image_route: default_show_image_route(),
            initial_track_url: None,
            log_level: default_log_level(),
        }
    }
}

impl OverlayOptions {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn log_filter(&self) -> Result<log::LevelFilter, OverlayError> {
        parse_log_level(&self.log_level)
    }
}

/// Case-insensitive level name as understood by `log`.
pub fn parse_log_level(level: &str) -> Result<log::LevelFilter, OverlayError> {
    level
        .parse()
        .map_err(|_| OverlayError::InvalidOptions(format!("unknown log level '{level}'")))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapType {
    Standard,
    #[default]
    Satellite,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Default for Size {
    fn default() -> Self {
        Self {
            width: 59.0,
            height: 59.0,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_reuse_identifier() -> String {
    "waypoint".to_string()
}

fn default_fetch_timeout_ms() -> u64 {
    30_000
}

fn default_frame_padding() -> f64 {
    0.1
}

fn default_min_span_degrees() -> f64 {
    0.01
}

fn default_show_image_route() -> String {
    "show-image".to_string()
}

fn default_log_level() -> String {
    "warn".to_string()
}
