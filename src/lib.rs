pub mod annotation;
pub mod controller;
pub mod converter;
pub mod error;
pub mod events;
pub mod gpx_types;
pub mod host;
pub mod options;
pub mod view;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use js_sys::{Array, Function, Object, Reflect};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use wasm_bindgen::prelude::*;

use crate::annotation::{AnnotationId, AnnotationSet};
use crate::controller::{LoadOutcome, OverlayController, ThumbnailOutcome};
use crate::converter::Region;
use crate::error::OverlayError;
use crate::events::{Subscription, TrackSourceBus, TrackSourceEvent};
use crate::gpx_types::GpxDocument;
use crate::host::{Fetcher, LoadTicket, MapSurface, ThumbnailTicket};
use crate::options::{MapType, OverlayOptions};
use crate::view::{ViewId, ViewPool};

type JsController = OverlayController<JsMap, JsFetcher>;

/// Waypoint overlay for a JS map widget.
///
/// `host` supplies the callbacks `setMapType(type)`, `addAnnotations(geojson)`,
/// `removeAnnotations(ids)`, `showRegion(region, animated)`,
/// `loadTrack(token, url, timeoutMs)` and `loadThumbnail(ticket, url, timeoutMs)`.
/// Loads are answered with `finishLoad` and `finishThumbnail`.
///
/// Callbacks run after the overlay has finished updating its own state, so
/// they may post to a [`TrackSourceChannel`]. They must not call methods of
/// the same overlay synchronously; answer from a later task instead.
#[wasm_bindgen]
pub struct GpxMapOverlay {
    controller: Rc<RefCell<JsController>>,
    host: Rc<HostQueue>,
    pool: ViewPool,
    subscription: Option<Subscription>,
}

#[wasm_bindgen]
impl GpxMapOverlay {
    #[wasm_bindgen(constructor)]
    pub fn new(host: Object, options: JsValue) -> Result<GpxMapOverlay, JsValue> {
        console_error_panic_hook::set_once();

        let opts = parse_options(options)?;
        install_console_logger();
        log::set_max_level(opts.log_filter()?);
        let initial = opts.initial_track_url.clone();
        let host = Rc::new(HostQueue::new(host));
        let controller = OverlayController::new(
            JsMap {
                host: Rc::clone(&host),
            },
            JsFetcher {
                host: Rc::clone(&host),
            },
            opts,
        );
        host.flush();

        let mut overlay = GpxMapOverlay {
            controller: Rc::new(RefCell::new(controller)),
            host,
            pool: ViewPool::new(),
            subscription: None,
        };
        if initial.is_some() {
            overlay.set_track_source(initial);
        }
        Ok(overlay)
    }

    /// Replace the track source; `undefined` clears the map. Returns the load token.
    #[wasm_bindgen(js_name = setTrackSource)]
    pub fn set_track_source(&mut self, url: Option<String>) -> Option<f64> {
        let token = drive(&self.controller, &self.host, |c| c.set_track_source(url));
        self.release_stale_views();
        token.map(|t| t.0 as f64)
    }

    /// Hand over the parsed document for a `loadTrack` request. Pass
    /// `undefined` when the parser found nothing, or an error message.
    #[wasm_bindgen(js_name = finishLoad)]
    pub fn finish_load(
        &mut self,
        token: f64,
        document: JsValue,
        error: Option<String>,
    ) -> Result<JsValue, JsValue> {
        let outcome = drive(&self.controller, &self.host, |c| {
            let ticket = c
                .pending_load()
                .filter(|ticket| ticket.token.0 == token as u64)
                .cloned();
            match ticket {
                Some(ticket) => {
                    let result = match error {
                        Some(reason) => Err(OverlayError::fetch(&ticket.url, reason)),
                        None => parse_document(document),
                    };
                    c.finish_load(&ticket, result)
                }
                None => LoadOutcome::Stale,
            }
        });
        to_js(&outcome)
    }

    /// Time out an overdue track load. Returns the outcome, or `null`.
    #[wasm_bindgen(js_name = expireOverdue)]
    pub fn expire_overdue(&mut self) -> Result<JsValue, JsValue> {
        match drive(&self.controller, &self.host, |c| c.expire_overdue()) {
            Some(outcome) => to_js(&outcome),
            None => Ok(JsValue::NULL),
        }
    }

    /// Give up on overdue thumbnail fetches. Returns the expired ticket ids;
    /// later answers for them are discarded.
    #[wasm_bindgen(js_name = expireThumbnails)]
    pub fn expire_thumbnails(&mut self) -> Vec<f64> {
        self.controller
            .borrow_mut()
            .expire_overdue_thumbnails()
            .into_iter()
            .map(|(id, _)| id as f64)
            .collect()
    }

    /// Current state of the overlay.
    pub fn status(&self) -> Result<JsValue, JsValue> {
        to_js(self.controller.borrow().status())
    }

    /// The shown annotations as a GeoJSON FeatureCollection.
    #[wasm_bindgen(js_name = annotationsGeoJson)]
    pub fn annotations_geojson(&self) -> Result<JsValue, JsValue> {
        to_js(&converter::to_feature_collection(
            self.controller.borrow().annotations(),
        ))
    }

    /// Prepare a pin view for an annotation id taken from the GeoJSON feature ids.
    #[wasm_bindgen(js_name = annotationView)]
    pub fn annotation_view(&mut self, annotation_id: &str) -> Result<JsValue, JsValue> {
        let id: AnnotationId = annotation_id
            .parse()
            .map_err(|e: annotation::ParseAnnotationIdError| JsValue::from_str(&e.to_string()))?;
        self.release_stale_views();

        let view = self.controller.borrow().annotation_view(&mut self.pool, id);
        match view.and_then(|view| self.pool.get(view)) {
            Some(view) => to_js(view),
            None => Ok(JsValue::NULL),
        }
    }

    /// The user selected a pin. Returns the thumbnail ticket id when a fetch started.
    #[wasm_bindgen(js_name = selectView)]
    pub fn select_view(&mut self, view: usize) -> Option<f64> {
        let pool = &self.pool;
        drive(&self.controller, &self.host, |c| {
            c.on_annotation_selected(pool, ViewId(view))
        })
        .map(|id| id as f64)
    }

    /// Hand over thumbnail bytes for a `loadThumbnail` request. Returns
    /// `"applied"`, `"discarded"` or `"failed"`.
    #[wasm_bindgen(js_name = finishThumbnail)]
    pub fn finish_thumbnail(
        &mut self,
        ticket: f64,
        bytes: Option<Vec<u8>>,
        error: Option<String>,
    ) -> String {
        let id = ticket as u64;
        let mut controller = self.controller.borrow_mut();
        let Some(url) = controller.pending_thumbnail(id).map(|t| t.url.clone()) else {
            return "discarded".to_string();
        };
        let result = match (bytes, error) {
            (Some(bytes), None) => Ok(bytes),
            (_, Some(reason)) => Err(OverlayError::fetch(&url, reason)),
            (None, None) => Err(OverlayError::fetch(&url, "no data")),
        };
        match controller.finish_thumbnail(&mut self.pool, id, result) {
            ThumbnailOutcome::Applied => "applied",
            ThumbnailOutcome::Discarded => "discarded",
            ThumbnailOutcome::Failed(_) => "failed",
        }
        .to_string()
    }

    /// Encoded bytes of the thumbnail shown by a view, once loaded.
    #[wasm_bindgen(js_name = thumbnailBytes)]
    pub fn thumbnail_bytes(&self, view: usize) -> Option<Vec<u8>> {
        let slot = self.pool.get(ViewId(view))?.left_accessory.as_ref()?;
        slot.image.as_ref().map(|image| image.bytes.clone())
    }

    /// The user tapped a callout accessory. Returns `{ route, imageUrl, title }` or `null`.
    #[wasm_bindgen(js_name = tapCallout)]
    pub fn tap_callout(&self, view: usize) -> Result<JsValue, JsValue> {
        let controller = self.controller.borrow();
        match controller.on_callout_accessory_tapped(&self.pool, ViewId(view)) {
            Some(show) => to_js(&show),
            None => Ok(JsValue::NULL),
        }
    }

    /// The host no longer displays a view; queue it for reuse.
    #[wasm_bindgen(js_name = releaseView)]
    pub fn release_view(&mut self, view: usize) -> bool {
        self.pool.recycle(ViewId(view))
    }

    /// Follow track source events posted on `channel`, replacing any
    /// previous subscription.
    pub fn listen(&mut self, channel: &TrackSourceChannel) {
        let host = Rc::clone(&self.host);
        self.subscription = Some(OverlayController::subscribe_then(
            &self.controller,
            &channel.bus,
            move || host.flush(),
        ));
    }

    pub fn unlisten(&mut self) {
        self.subscription = None;
    }
}

impl GpxMapOverlay {
    /// Queue views whose annotation belongs to an earlier load.
    fn release_stale_views(&mut self) {
        let controller = self.controller.borrow();
        let current = controller.annotations();
        self.pool.recycle_unless(|id| current.contains(id));
    }
}

/// Carries "new track source" events from the page's import flow to overlays.
#[wasm_bindgen]
#[derive(Clone, Default)]
pub struct TrackSourceChannel {
    bus: TrackSourceBus,
}

#[wasm_bindgen]
impl TrackSourceChannel {
    #[wasm_bindgen(constructor)]
    pub fn new() -> TrackSourceChannel {
        Self::default()
    }

    /// Post a new track URL. Returns the number of listening overlays.
    pub fn post(&self, url: String) -> usize {
        self.bus.post(&TrackSourceEvent { url })
    }

    /// Post a named event with a `{ url }` payload.
    #[wasm_bindgen(js_name = postNamed)]
    pub fn post_named(&self, name: &str, payload: JsValue) -> Result<bool, JsValue> {
        let payload: Map<String, JsonValue> = serde_wasm_bindgen::from_value(payload)
            .map_err(|e| JsValue::from_str(&e.to_string()))?;
        Ok(self.bus.post_named(name, &payload))
    }
}

/// Host callbacks waiting for the controller borrow to be released.
struct HostQueue {
    host: Object,
    calls: RefCell<Vec<(&'static str, Vec<JsValue>)>>,
}

impl HostQueue {
    fn new(host: Object) -> Self {
        Self {
            host,
            calls: RefCell::new(Vec::new()),
        }
    }

    fn push(&self, name: &'static str, args: Vec<JsValue>) {
        self.calls.borrow_mut().push((name, args));
    }

    /// Invoke queued callbacks in order, including ones queued by callbacks
    /// that re-enter through a channel.
    fn flush(&self) {
        loop {
            let calls = std::mem::take(&mut *self.calls.borrow_mut());
            if calls.is_empty() {
                break;
            }
            for (name, args) in calls {
                call_host(&self.host, name, &args);
            }
        }
    }
}

/// Run `f` on the controller, then deliver the host calls it queued.
fn drive<R>(
    controller: &RefCell<JsController>,
    host: &HostQueue,
    f: impl FnOnce(&mut JsController) -> R,
) -> R {
    let result = f(&mut controller.borrow_mut());
    host.flush();
    result
}

/// Map surface backed by the host's JS callbacks.
struct JsMap {
    host: Rc<HostQueue>,
}

impl MapSurface for JsMap {
    fn set_map_type(&mut self, map_type: MapType) {
        self.host.push("setMapType", vec![serialize_or_null(&map_type)]);
    }

    fn add_annotations(&mut self, set: &AnnotationSet) {
        let fc = converter::to_feature_collection(set);
        self.host.push("addAnnotations", vec![serialize_or_null(&fc)]);
    }

    fn remove_annotations(&mut self, set: &AnnotationSet) {
        let ids: Array = set.ids().map(|id| JsValue::from_str(&id.to_string())).collect();
        self.host.push("removeAnnotations", vec![ids.into()]);
    }

    fn show_region(&mut self, region: Region, animated: bool) {
        self.host.push(
            "showRegion",
            vec![serialize_or_null(&region), JsValue::from_bool(animated)],
        );
    }
}

/// Fetcher that forwards requests to the host. The controller keeps the
/// tickets; the host answers by token or ticket id.
struct JsFetcher {
    host: Rc<HostQueue>,
}

impl JsFetcher {
    fn timeout_ms(&self, deadline: Duration) -> f64 {
        deadline.saturating_sub(self.now()).as_millis() as f64
    }
}

impl Fetcher for JsFetcher {
    fn now(&self) -> Duration {
        Duration::from_millis(js_sys::Date::now() as u64)
    }

    fn request_track(&mut self, ticket: LoadTicket) {
        let args = vec![
            JsValue::from_f64(ticket.token.0 as f64),
            JsValue::from_str(&ticket.url),
            JsValue::from_f64(self.timeout_ms(ticket.deadline)),
        ];
        self.host.push("loadTrack", args);
    }

    fn request_thumbnail(&mut self, ticket: ThumbnailTicket) {
        let args = vec![
            JsValue::from_f64(ticket.id as f64),
            JsValue::from_str(&ticket.url),
            JsValue::from_f64(self.timeout_ms(ticket.deadline)),
        ];
        self.host.push("loadThumbnail", args);
    }
}

/// Route `log` output to the browser console at `level` (`"error"` to
/// `"trace"`, or `"off"`). The first call installs the logger; later calls
/// only change the level.
#[wasm_bindgen(js_name = initLogging)]
pub fn init_logging(level: &str) -> Result<(), JsValue> {
    let filter = options::parse_log_level(level)?;
    install_console_logger();
    log::set_max_level(filter);
    Ok(())
}

#[cfg(target_arch = "wasm32")]
fn install_console_logger() {
    // Err only when a logger is already installed.
    let _ = console_log::init_with_level(log::Level::Trace);
}

#[cfg(not(target_arch = "wasm32"))]
fn install_console_logger() {}

/// Invoke `host[name](...args)`. Missing or throwing callbacks are logged and skipped.
fn call_host(host: &Object, name: &str, args: &[JsValue]) {
    let result = Reflect::get(host, &JsValue::from_str(name))
        .and_then(|value| value.dyn_into::<Function>().map_err(JsValue::from))
        .and_then(|callback| {
            let args: Array = args.iter().collect();
            callback.apply(host, &args)
        });
    if let Err(e) = result {
        log::warn!("{}", OverlayError::Host(format!("{name}: {e:?}")));
    }
}

fn parse_options(options: JsValue) -> Result<OverlayOptions, JsValue> {
    if options.is_undefined() || options.is_null() {
        Ok(OverlayOptions::default())
    } else {
        serde_wasm_bindgen::from_value(options)
            .map_err(|e| OverlayError::InvalidOptions(e.to_string()).into())
    }
}

fn parse_document(document: JsValue) -> Result<Option<GpxDocument>, OverlayError> {
    if document.is_undefined() || document.is_null() {
        return Ok(None);
    }
    serde_wasm_bindgen::from_value(document)
        .map(Some)
        .map_err(|e| OverlayError::Host(format!("malformed GPX document: {e}")))
}

fn to_js<T: Serialize + ?Sized>(value: &T) -> Result<JsValue, JsValue> {
    value
        .serialize(&serde_wasm_bindgen::Serializer::json_compatible())
        .map_err(|e| JsValue::from_str(&e.to_string()))
}

fn serialize_or_null<T: Serialize>(value: &T) -> JsValue {
    to_js(value).unwrap_or(JsValue::NULL)
}
