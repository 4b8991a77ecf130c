use geojson::feature::Id;
use geojson::{Feature, FeatureCollection, Geometry, Value};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::annotation::{AnnotationId, AnnotationSet, Coordinate, MapAnnotation};
use crate::options::OverlayOptions;

/// Latitude/longitude extent of a map viewport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    pub latitude_delta: f64,
    pub longitude_delta: f64,
}

/// A map viewport: centre plus span.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Region {
    pub center: Coordinate,
    pub span: Span,
}

impl Region {
    /// `[minLon, minLat, maxLon, maxLat]`, the GeoJSON bbox order.
    pub fn bbox(&self) -> Vec<f64> {
        let half_lat = self.span.latitude_delta / 2.0;
        let half_lon = self.span.longitude_delta / 2.0;
        vec![
            self.center.longitude - half_lon,
            self.center.latitude - half_lat,
            self.center.longitude + half_lon,
            self.center.latitude + half_lat,
        ]
    }
}

/// Convert the annotation set to a GeoJSON FeatureCollection, one Point per pin.
pub fn to_feature_collection(set: &AnnotationSet) -> FeatureCollection {
    let features = set
        .iter()
        .map(|(id, annotation)| annotation_to_feature(id, annotation))
        .collect();

    FeatureCollection {
        bbox: extent(set).map(|(min, max)| {
            vec![min.longitude, min.latitude, max.longitude, max.latitude]
        }),
        features,
        foreign_members: None,
    }
}

/// Region that frames every annotation of the set, or `None` if the set is empty.
pub fn bounding_region(set: &AnnotationSet, opts: &OverlayOptions) -> Option<Region> {
    let (min, max) = extent(set)?;
    let pad = 1.0 + 2.0 * opts.frame_padding.max(0.0);

    Some(Region {
        center: Coordinate {
            latitude: (min.latitude + max.latitude) / 2.0,
            longitude: (min.longitude + max.longitude) / 2.0,
        },
        span: Span {
            latitude_delta: ((max.latitude - min.latitude) * pad).max(opts.min_span_degrees),
            longitude_delta: ((max.longitude - min.longitude) * pad).max(opts.min_span_degrees),
        },
    })
}

fn annotation_to_feature(id: AnnotationId, annotation: &impl MapAnnotation) -> Feature {
    let coord = annotation.coordinate();
    let geometry = Geometry::new(Value::Point(vec![coord.longitude, coord.latitude]));

    let mut props = Map::new();
    props.insert(
        "title".to_string(),
        JsonValue::String(annotation.title().to_string()),
    );
    insert_optional(&mut props, "subtitle", annotation.subtitle());
    insert_optional(&mut props, "thumbnailUrl", annotation.thumbnail_url());
    insert_optional(&mut props, "imageUrl", annotation.image_url());
    props.insert(
        "hasThumbnail".to_string(),
        JsonValue::Bool(annotation.thumbnail_url().is_some()),
    );
    props.insert(
        "hasImage".to_string(),
        JsonValue::Bool(annotation.image_url().is_some()),
    );

    Feature {
        bbox: None,
        geometry: Some(geometry),
        id: Some(Id::String(id.to_string())),
        properties: Some(props),
        foreign_members: None,
    }
}

/// South-west and north-east corners of the set.
fn extent(set: &AnnotationSet) -> Option<(Coordinate, Coordinate)> {
    let mut coords = set.iter().map(|(_, annotation)| annotation.coordinate());
    let first = coords.next()?;

    Some(coords.fold((first, first), |(min, max), c| {
        (
            Coordinate {
                latitude: min.latitude.min(c.latitude),
                longitude: min.longitude.min(c.longitude),
            },
            Coordinate {
                latitude: max.latitude.max(c.latitude),
                longitude: max.longitude.max(c.longitude),
            },
        )
    }))
}

fn insert_optional(props: &mut Map<String, JsonValue>, key: &str, value: Option<&str>) {
    if let Some(v) = value {
        props.insert(key.to_string(), JsonValue::String(v.to_string()));
    }
}
