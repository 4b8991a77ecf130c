use thiserror::Error;
use wasm_bindgen::JsValue;

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("Fetch of '{url}' failed: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Fetch of '{url}' timed out after {timeout_ms} ms")]
    TimedOut { url: String, timeout_ms: u64 },

    #[error("Image at '{url}' could not be decoded: {source}")]
    Decode {
        url: String,
        #[source]
        source: image::ImageError,
    },

    #[error("Invalid overlay options: {0}")]
    InvalidOptions(String),

    #[error("Host callback failed: {0}")]
    Host(String),
}

impl OverlayError {
    pub fn fetch(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

impl From<OverlayError> for JsValue {
    fn from(e: OverlayError) -> Self {
        JsValue::from_str(&e.to_string())
    }
}
