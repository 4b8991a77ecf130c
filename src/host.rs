//! Seams between the overlay controller and the platform hosting it.

use std::time::Duration;

use serde::Serialize;

use crate::annotation::{AnnotationId, AnnotationSet};
use crate::converter::Region;
use crate::options::MapType;
use crate::view::ViewId;

/// The map widget that actually draws pins.
pub trait MapSurface {
    fn set_map_type(&mut self, map_type: MapType);
    fn add_annotations(&mut self, set: &AnnotationSet);
    fn remove_annotations(&mut self, set: &AnnotationSet);
    fn show_region(&mut self, region: Region, animated: bool);
}

/// Asynchronous network and parsing work. Requests return immediately;
/// results come back through the controller's `finish_*` methods on the
/// interaction thread.
pub trait Fetcher {
    /// Current time, used for fetch deadlines.
    fn now(&self) -> Duration;
    /// Fetch and parse the GPX document at `ticket.url`.
    fn request_track(&mut self, ticket: LoadTicket);
    /// Fetch the raw bytes at `ticket.url`.
    fn request_thumbnail(&mut self, ticket: ThumbnailTicket);
}

/// Issued once per track source assignment; strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LoadToken(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTicket {
    pub token: LoadToken,
    pub url: String,
    pub deadline: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailTicket {
    pub id: u64,
    pub view: ViewId,
    /// View binding at request time; a different binding means the view was recycled.
    pub binding: u64,
    pub annotation: AnnotationId,
    pub url: String,
    pub deadline: Duration,
}

/// Parameters for the full-size image screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShowImage {
    pub route: String,
    pub image_url: String,
    pub title: String,
}
