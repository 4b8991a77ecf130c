use std::cell::RefCell;
use std::rc::Rc;

use serde::Serialize;

use crate::annotation::{AnnotationId, AnnotationSet, MapAnnotation};
use crate::converter;
use crate::error::OverlayError;
use crate::events::{Subscription, TrackSourceBus};
use crate::gpx_types::GpxDocument;
use crate::host::{Fetcher, LoadTicket, LoadToken, MapSurface, ShowImage, ThumbnailTicket};
use crate::options::OverlayOptions;
use crate::view::{CalloutAccessory, Thumbnail, ThumbnailSlot, ViewId, ViewPool};

/// Why a track load left the map empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Degradation {
    /// The parser produced no document.
    NoDocument,
    TimedOut,
    FetchFailed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum OverlayStatus {
    Idle,
    Loading { token: LoadToken, url: String },
    Populated { count: usize },
    Degraded { url: String, reason: Degradation },
}

/// Result of handing a finished track load to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum LoadOutcome {
    Populated { count: usize },
    Degraded(Degradation),
    /// The load belongs to a superseded track source; nothing changed.
    Stale,
}

/// Result of handing a finished thumbnail fetch to the controller.
#[derive(Debug)]
pub enum ThumbnailOutcome {
    Applied,
    /// The view was recycled or its annotation replaced.
    Discarded,
    Failed(OverlayError),
}

/// Keeps a map's pins in step with the current GPX track source.
///
/// All methods run on the interaction thread. Network work goes through the
/// [`Fetcher`], whose completions must be fed back with [`finish_load`] and
/// [`finish_thumbnail`].
///
/// [`finish_load`]: OverlayController::finish_load
/// [`finish_thumbnail`]: OverlayController::finish_thumbnail
pub struct OverlayController<M, F> {
    map: M,
    fetcher: F,
    options: OverlayOptions,
    source: Option<String>,
    last_token: u64,
    pending: Option<LoadTicket>,
    annotations: AnnotationSet,
    status: OverlayStatus,
    last_thumbnail: u64,
    thumbnails: Vec<ThumbnailTicket>,
}

impl<M: MapSurface, F: Fetcher> OverlayController<M, F> {
    pub fn new(mut map: M, fetcher: F, options: OverlayOptions) -> Self {
        map.set_map_type(options.map_type);
        Self {
            map,
            fetcher,
            options,
            source: None,
            last_token: 0,
            pending: None,
            annotations: AnnotationSet::empty(0),
            status: OverlayStatus::Idle,
            last_thumbnail: 0,
            thumbnails: Vec::new(),
        }
    }

    pub fn options(&self) -> &OverlayOptions {
        &self.options
    }

    pub fn map(&self) -> &M {
        &self.map
    }

    pub fn map_mut(&mut self) -> &mut M {
        &mut self.map
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn fetcher_mut(&mut self) -> &mut F {
        &mut self.fetcher
    }

    pub fn track_source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn status(&self) -> &OverlayStatus {
        &self.status
    }

    pub fn annotations(&self) -> &AnnotationSet {
        &self.annotations
    }

    pub fn pending_load(&self) -> Option<&LoadTicket> {
        self.pending.as_ref()
    }

    /// Thumbnail fetches that have been requested and not yet finished or expired.
    pub fn pending_thumbnails(&self) -> &[ThumbnailTicket] {
        &self.thumbnails
    }

    pub fn pending_thumbnail(&self, id: u64) -> Option<&ThumbnailTicket> {
        self.thumbnails.iter().find(|ticket| ticket.id == id)
    }

    /// Replace the track source. Current pins are removed before this
    /// returns; with a URL, a new load is requested from the fetcher.
    pub fn set_track_source(&mut self, url: Option<String>) -> Option<LoadToken> {
        self.last_token += 1;
        let token = LoadToken(self.last_token);

        if !self.annotations.is_empty() {
            self.map.remove_annotations(&self.annotations);
        }
        self.annotations = AnnotationSet::empty(token.0);
        if let Some(superseded) = self.pending.take() {
            log::debug!("superseding load {:?} of {}", superseded.token, superseded.url);
        }
        if !self.thumbnails.is_empty() {
            log::debug!(
                "forgetting {} thumbnail fetch(es) of the old track",
                self.thumbnails.len()
            );
            self.thumbnails.clear();
        }
        self.source = url.clone();

        let Some(url) = url else {
            self.status = OverlayStatus::Idle;
            return None;
        };

        log::info!("loading track {url} ({token:?})");
        let ticket = LoadTicket {
            token,
            url: url.clone(),
            deadline: self.fetcher.now() + self.options.fetch_timeout(),
        };
        self.pending = Some(ticket.clone());
        self.status = OverlayStatus::Loading { token, url };
        self.fetcher.request_track(ticket);
        Some(token)
    }

    /// Apply a completed track load. Only the load of the newest source may
    /// change the map.
    pub fn finish_load(
        &mut self,
        ticket: &LoadTicket,
        result: Result<Option<GpxDocument>, OverlayError>,
    ) -> LoadOutcome {
        let is_pending = self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.token == ticket.token);
        if !is_pending {
            log::debug!("dropping stale load {:?} of {}", ticket.token, ticket.url);
            return LoadOutcome::Stale;
        }
        self.pending = None;

        if self.fetcher.now() > ticket.deadline {
            log::warn!(
                "track {} arrived after its {} ms deadline",
                ticket.url,
                self.options.fetch_timeout_ms
            );
            return self.degrade(&ticket.url, Degradation::TimedOut);
        }

        let document = match result {
            Ok(Some(document)) => document,
            Ok(None) => {
                log::warn!("track {} produced no GPX document", ticket.url);
                return self.degrade(&ticket.url, Degradation::NoDocument);
            }
            Err(e) => {
                log::warn!("track {} failed to load: {e}", ticket.url);
                let reason = Degradation::FetchFailed {
                    message: e.to_string(),
                };
                return self.degrade(&ticket.url, reason);
            }
        };

        self.annotations = AnnotationSet::new(ticket.token.0, document.waypoints);
        let count = self.annotations.len();
        log::info!("track {} loaded with {count} waypoint(s)", ticket.url);

        if count > 0 {
            self.map.add_annotations(&self.annotations);
            if let Some(region) = converter::bounding_region(&self.annotations, &self.options) {
                self.map.show_region(region, self.options.animate_framing);
            }
        }
        self.status = OverlayStatus::Populated { count };
        LoadOutcome::Populated { count }
    }

    /// Give up on a pending load whose deadline has passed.
    pub fn expire_overdue(&mut self) -> Option<LoadOutcome> {
        let now = self.fetcher.now();
        let ticket = self.pending.take_if(|pending| now > pending.deadline)?;
        log::warn!(
            "track {} timed out after {} ms",
            ticket.url,
            self.options.fetch_timeout_ms
        );
        Some(self.degrade(&ticket.url, Degradation::TimedOut))
    }

    fn degrade(&mut self, url: &str, reason: Degradation) -> LoadOutcome {
        self.status = OverlayStatus::Degraded {
            url: url.to_string(),
            reason: reason.clone(),
        };
        LoadOutcome::Degraded(reason)
    }

    /// Prepare a pin view for `id`, reusing a queued view when one exists.
    pub fn annotation_view(&self, pool: &mut ViewPool, id: AnnotationId) -> Option<ViewId> {
        let annotation = self.annotations.get(id)?;
        let view = pool.dequeue_or_create(&self.options.reuse_identifier);
        view.bind(id);
        view.can_show_callout = true;

        if annotation.thumbnail_url().is_some() {
            // filled in lazily on selection
            view.left_accessory = Some(ThumbnailSlot::empty(self.options.thumbnail_size));
        }
        if annotation.image_url().is_some() {
            view.right_accessory = Some(CalloutAccessory::DetailDisclosure);
        }
        Some(view.id)
    }

    /// Request the callout thumbnail of a selected view. Returns the ticket id
    /// when a fetch was started; at most one fetch per view binding is in flight.
    pub fn on_annotation_selected(&mut self, pool: &ViewPool, view_id: ViewId) -> Option<u64> {
        let view = pool.get(view_id)?;
        let slot = view.left_accessory.as_ref()?;
        if slot.image.is_some() {
            return None;
        }
        if let Some(in_flight) = self
            .thumbnails
            .iter()
            .find(|ticket| ticket.view == view_id && ticket.binding == view.binding)
        {
            log::debug!(
                "thumbnail {} already requested by ticket {}",
                in_flight.url,
                in_flight.id
            );
            return None;
        }
        let annotation = view.annotation?;
        let url = self.annotations.get(annotation)?.thumbnail_url()?.to_string();

        self.last_thumbnail += 1;
        let ticket = ThumbnailTicket {
            id: self.last_thumbnail,
            view: view_id,
            binding: view.binding,
            annotation,
            url,
            deadline: self.fetcher.now() + self.options.fetch_timeout(),
        };
        log::debug!("fetching thumbnail {} for {annotation}", ticket.url);
        self.thumbnails.push(ticket.clone());
        self.fetcher.request_thumbnail(ticket);
        Some(self.last_thumbnail)
    }

    /// Apply fetched thumbnail bytes to the view that asked for ticket `id`.
    /// Unknown, expired and superseded tickets are discarded.
    pub fn finish_thumbnail(
        &mut self,
        pool: &mut ViewPool,
        id: u64,
        result: Result<Vec<u8>, OverlayError>,
    ) -> ThumbnailOutcome {
        let Some(pos) = self.thumbnails.iter().position(|ticket| ticket.id == id) else {
            log::debug!("discarding thumbnail for unknown ticket {id}");
            return ThumbnailOutcome::Discarded;
        };
        let ticket = self.thumbnails.swap_remove(pos);

        let still_bound = pool.get(ticket.view).is_some_and(|view| {
            view.binding == ticket.binding && view.annotation == Some(ticket.annotation)
        });
        if !still_bound || !self.annotations.contains(ticket.annotation) {
            log::debug!("discarding thumbnail {} for recycled view", ticket.url);
            return ThumbnailOutcome::Discarded;
        }

        let decoded = result.and_then(|bytes| {
            if self.fetcher.now() > ticket.deadline {
                return Err(OverlayError::TimedOut {
                    url: ticket.url.clone(),
                    timeout_ms: self.options.fetch_timeout_ms,
                });
            }
            decode_thumbnail(&ticket.url, bytes)
        });

        match decoded {
            Ok(thumbnail) => {
                match pool
                    .get_mut(ticket.view)
                    .and_then(|view| view.left_accessory.as_mut())
                {
                    Some(slot) => {
                        slot.image = Some(thumbnail);
                        ThumbnailOutcome::Applied
                    }
                    None => ThumbnailOutcome::Discarded,
                }
            }
            Err(e) => {
                log::warn!("thumbnail left empty: {e}");
                ThumbnailOutcome::Failed(e)
            }
        }
    }

    /// Give up on thumbnail fetches whose deadline has passed. Their
    /// placeholders stay empty, so a later selection retries.
    pub fn expire_overdue_thumbnails(&mut self) -> Vec<(u64, ThumbnailOutcome)> {
        let now = self.fetcher.now();
        let (overdue, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.thumbnails)
            .into_iter()
            .partition(|ticket| now > ticket.deadline);
        self.thumbnails = waiting;

        overdue
            .into_iter()
            .map(|ticket| {
                let error = OverlayError::TimedOut {
                    url: ticket.url,
                    timeout_ms: self.options.fetch_timeout_ms,
                };
                log::warn!("thumbnail left empty: {error}");
                (ticket.id, ThumbnailOutcome::Failed(error))
            })
            .collect()
    }

    /// Navigation parameters for the full-size image of a tapped callout.
    /// `None` unless the view shows a detail disclosure for a current annotation.
    pub fn on_callout_accessory_tapped(&self, pool: &ViewPool, view_id: ViewId) -> Option<ShowImage> {
        let view = pool.get(view_id)?;
        view.right_accessory?;
        let annotation = self.annotations.get(view.annotation?)?;

        Some(ShowImage {
            route: self.options.show_image_route.clone(),
            image_url: annotation.image_url()?.to_string(),
            title: annotation.title().to_string(),
        })
    }
}

impl<M, F> OverlayController<M, F>
where
    M: MapSurface + 'static,
    F: Fetcher + 'static,
{
    /// Follow track source events posted on `bus`. The controller is held
    /// weakly; drop the returned subscription to stop listening.
    ///
    /// An event posted while the controller is already borrowed (from inside
    /// one of its own map or fetcher calls) is dropped with a warning.
    pub fn subscribe(controller: &Rc<RefCell<Self>>, bus: &TrackSourceBus) -> Subscription {
        Self::subscribe_then(controller, bus, || {})
    }

    /// Like [`subscribe`](Self::subscribe), calling `after` once each event
    /// has been applied and the controller borrow released.
    pub fn subscribe_then<A>(
        controller: &Rc<RefCell<Self>>,
        bus: &TrackSourceBus,
        mut after: A,
    ) -> Subscription
    where
        A: FnMut() + 'static,
    {
        let weak = Rc::downgrade(controller);
        bus.subscribe(move |event| {
            let Some(controller) = weak.upgrade() else {
                return;
            };
            match controller.try_borrow_mut() {
                Ok(mut controller) => {
                    controller.set_track_source(Some(event.url.clone()));
                }
                Err(_) => {
                    log::warn!("track source {} posted while the overlay was busy", event.url);
                    return;
                }
            }
            after();
        })
    }
}

fn decode_thumbnail(url: &str, bytes: Vec<u8>) -> Result<Thumbnail, OverlayError> {
    let image = image::load_from_memory(&bytes).map_err(|source| OverlayError::Decode {
        url: url.to_string(),
        source,
    })?;
    Ok(Thumbnail {
        width: image.width(),
        height: image.height(),
        bytes,
    })
}
