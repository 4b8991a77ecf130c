use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::gpx_types::Waypoint;

/// Link type tag of the small callout image.
pub const THUMBNAIL_LINK_TYPE: &str = "thumbnail";
/// Link type tag of the full-size image.
pub const IMAGE_LINK_TYPE: &str = "large";

/// A geographic position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

/// Anything a map can display as a pin with a callout.
pub trait MapAnnotation {
    fn coordinate(&self) -> Coordinate;
    fn title(&self) -> &str;
    fn subtitle(&self) -> Option<&str>;
    fn thumbnail_url(&self) -> Option<&str>;
    fn image_url(&self) -> Option<&str>;
}

/// Presents a waypoint as a map annotation. Every field is read from the
/// wrapped waypoint on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct WaypointAnnotation {
    waypoint: Waypoint,
}

impl WaypointAnnotation {
    pub fn new(waypoint: Waypoint) -> Self {
        Self { waypoint }
    }

    pub fn waypoint(&self) -> &Waypoint {
        &self.waypoint
    }

    /// URL of the first link carrying `link_type`.
    fn link_url(&self, link_type: &str) -> Option<&str> {
        self.waypoint
            .links
            .iter()
            .find(|link| link.link_type == link_type)
            .map(|link| link.url.as_str())
    }
}

impl From<Waypoint> for WaypointAnnotation {
    fn from(waypoint: Waypoint) -> Self {
        Self::new(waypoint)
    }
}

impl MapAnnotation for WaypointAnnotation {
    fn coordinate(&self) -> Coordinate {
        Coordinate {
            latitude: self.waypoint.latitude,
            longitude: self.waypoint.longitude,
        }
    }

    fn title(&self) -> &str {
        &self.waypoint.name
    }

    fn subtitle(&self) -> Option<&str> {
        self.waypoint.info.as_deref()
    }

    fn thumbnail_url(&self) -> Option<&str> {
        self.link_url(THUMBNAIL_LINK_TYPE)
    }

    fn image_url(&self) -> Option<&str> {
        self.link_url(IMAGE_LINK_TYPE)
    }
}

/// Identifies one annotation of one load generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnnotationId {
    pub generation: u64,
    pub index: usize,
}

impl fmt::Display for AnnotationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAnnotationIdError(String);

impl fmt::Display for ParseAnnotationIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid annotation id '{}'", self.0)
    }
}

impl std::error::Error for ParseAnnotationIdError {}

impl FromStr for AnnotationId {
    type Err = ParseAnnotationIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseAnnotationIdError(s.to_string());
        let (generation, index) = s.split_once('-').ok_or_else(err)?;
        Ok(Self {
            generation: generation.parse().map_err(|_| err())?,
            index: index.parse().map_err(|_| err())?,
        })
    }
}

/// The annotations produced by a single track load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnotationSet {
    generation: u64,
    items: Vec<WaypointAnnotation>,
}

impl AnnotationSet {
    pub fn empty(generation: u64) -> Self {
        Self {
            generation,
            items: Vec::new(),
        }
    }

    pub fn new(generation: u64, waypoints: Vec<Waypoint>) -> Self {
        Self {
            generation,
            items: waypoints.into_iter().map(WaypointAnnotation::new).collect(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Look up an annotation; ids from another generation never resolve.
    pub fn get(&self, id: AnnotationId) -> Option<&WaypointAnnotation> {
        if id.generation != self.generation {
            return None;
        }
        self.items.get(id.index)
    }

    pub fn contains(&self, id: AnnotationId) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> impl Iterator<Item = AnnotationId> + '_ {
        (0..self.items.len()).map(|index| AnnotationId {
            generation: self.generation,
            index,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (AnnotationId, &WaypointAnnotation)> + '_ {
        self.ids().zip(self.items.iter())
    }
}
