use serde::{Deserialize, Serialize};

/// A parsed GPX document, as handed over by the parser collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpxDocument {
    #[serde(default)]
    pub waypoints: Vec<Waypoint>,
}

/// A named GPX waypoint (<wpt>) with its media links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Waypoint {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub info: Option<String>,
    #[serde(default)]
    pub links: Vec<Link>,
}

impl Waypoint {
    pub fn new(latitude: f64, longitude: f64, name: impl Into<String>) -> Self {
        Self {
            latitude,
            longitude,
            name: name.into(),
            info: None,
            links: Vec::new(),
        }
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }

    pub fn with_link(mut self, link_type: impl Into<String>, url: impl Into<String>) -> Self {
        self.links.push(Link::new(link_type, url));
        self
    }
}

/// A GPX link element, tagged with a type such as "thumbnail" or "large".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    #[serde(rename = "type")]
    pub link_type: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Link {
    pub fn new(link_type: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            link_type: link_type.into(),
            url: url.into(),
            text: None,
        }
    }
}
