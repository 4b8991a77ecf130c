use std::cell::RefCell;
use std::io::Cursor;
use std::rc::Rc;
use std::time::Duration;

use gpx_map_overlay::annotation::{AnnotationId, AnnotationSet, MapAnnotation};
use gpx_map_overlay::controller::{
    Degradation, LoadOutcome, OverlayController, OverlayStatus, ThumbnailOutcome,
};
use gpx_map_overlay::converter::Region;
use gpx_map_overlay::error::OverlayError;
use gpx_map_overlay::events::{TrackSourceBus, TrackSourceEvent};
use gpx_map_overlay::gpx_types::{GpxDocument, Waypoint};
use gpx_map_overlay::host::{Fetcher, LoadTicket, MapSurface, ShowImage, ThumbnailTicket};
use gpx_map_overlay::options::{MapType, OverlayOptions};
use gpx_map_overlay::view::{CalloutAccessory, ViewPool};

#[derive(Debug, Clone, PartialEq)]
enum MapCall {
    MapType(MapType),
    Add(Vec<String>),
    Remove(Vec<String>),
    Show(Region, bool),
}

#[derive(Default)]
struct RecordingMap {
    calls: Vec<MapCall>,
    shown: Vec<String>,
}

impl MapSurface for RecordingMap {
    fn set_map_type(&mut self, map_type: MapType) {
        self.calls.push(MapCall::MapType(map_type));
    }

    fn add_annotations(&mut self, set: &AnnotationSet) {
        let titles: Vec<String> = set.iter().map(|(_, a)| a.title().to_string()).collect();
        self.shown.extend(titles.iter().cloned());
        self.calls.push(MapCall::Add(titles));
    }

    fn remove_annotations(&mut self, set: &AnnotationSet) {
        let titles: Vec<String> = set.iter().map(|(_, a)| a.title().to_string()).collect();
        self.shown.retain(|t| !titles.contains(t));
        self.calls.push(MapCall::Remove(titles));
    }

    fn show_region(&mut self, region: Region, animated: bool) {
        self.calls.push(MapCall::Show(region, animated));
    }
}

#[derive(Default)]
struct ManualFetcher {
    now: Duration,
    tracks: Vec<LoadTicket>,
    thumbnails: Vec<ThumbnailTicket>,
}

impl Fetcher for ManualFetcher {
    fn now(&self) -> Duration {
        self.now
    }

    fn request_track(&mut self, ticket: LoadTicket) {
        self.tracks.push(ticket);
    }

    fn request_thumbnail(&mut self, ticket: ThumbnailTicket) {
        self.thumbnails.push(ticket);
    }
}

type TestController = OverlayController<RecordingMap, ManualFetcher>;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn controller() -> TestController {
    init_logging();
    OverlayController::new(
        RecordingMap::default(),
        ManualFetcher::default(),
        OverlayOptions::default(),
    )
}

fn document(waypoints: Vec<Waypoint>) -> Option<GpxDocument> {
    Some(GpxDocument { waypoints })
}

fn trail() -> Vec<Waypoint> {
    vec![
        Waypoint::new(37.4, -122.2, "Start")
            .with_info("Trailhead")
            .with_link("thumbnail", "http://x/t.jpg"),
        Waypoint::new(37.5, -122.0, "Summit")
            .with_link("thumbnail", "http://x/summit-t.jpg")
            .with_link("large", "http://x/summit.jpg"),
    ]
}

fn last_track(c: &TestController) -> LoadTicket {
    c.fetcher().tracks.last().cloned().unwrap()
}

fn titles(c: &TestController) -> Vec<String> {
    c.annotations()
        .iter()
        .map(|(_, a)| a.title().to_string())
        .collect()
}

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgb8(image::RgbImage::new(width, height))
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

fn loaded(waypoints: Vec<Waypoint>) -> TestController {
    let mut c = controller();
    c.set_track_source(Some("http://x/trail.gpx".to_string()));
    let ticket = last_track(&c);
    c.finish_load(&ticket, Ok(document(waypoints)));
    c
}

fn first_id(c: &TestController) -> AnnotationId {
    c.annotations().ids().next().unwrap()
}

// ---- loading ----

#[test]
fn test_applies_map_type_on_creation() {
    let c = controller();
    assert_eq!(c.map().calls, vec![MapCall::MapType(MapType::Satellite)]);
}

#[test]
fn test_load_populates_and_frames() {
    let mut c = controller();
    let token = c.set_track_source(Some("http://x/trail.gpx".to_string())).unwrap();
    assert_eq!(
        c.status(),
        &OverlayStatus::Loading {
            token,
            url: "http://x/trail.gpx".to_string()
        }
    );

    let ticket = last_track(&c);
    assert_eq!(ticket.url, "http://x/trail.gpx");
    assert_eq!(ticket.deadline, Duration::from_secs(30));

    let outcome = c.finish_load(&ticket, Ok(document(trail())));
    assert_eq!(outcome, LoadOutcome::Populated { count: 2 });
    assert_eq!(c.status(), &OverlayStatus::Populated { count: 2 });
    assert_eq!(titles(&c), vec!["Start", "Summit"]);
    assert_eq!(c.map().shown, vec!["Start", "Summit"]);

    match c.map().calls.last() {
        Some(MapCall::Show(region, animated)) => {
            assert!(*animated);
            assert!((region.center.latitude - 37.45).abs() < 1e-10);
            assert!((region.center.longitude + 122.1).abs() < 1e-10);
        }
        other => panic!("Expected Show, got {other:?}"),
    }
}

#[test]
fn test_clearing_is_synchronous() {
    let mut c = loaded(trail());
    assert_eq!(c.annotations().len(), 2);

    assert!(c.set_track_source(None).is_none());
    assert!(c.annotations().is_empty());
    assert!(c.map().shown.is_empty());
    assert_eq!(c.status(), &OverlayStatus::Idle);
    assert_eq!(c.track_source(), None);
    assert!(c.pending_load().is_none());
}

#[test]
fn test_clearing_empty_map_does_not_touch_surface() {
    let mut c = controller();
    c.set_track_source(None);
    c.set_track_source(None);
    assert_eq!(c.map().calls.len(), 1);
    assert!(c.fetcher().tracks.is_empty());
}

#[test]
fn test_superseded_load_never_populates() {
    let mut c = controller();
    c.set_track_source(Some("http://x/a.gpx".to_string()));
    let a = last_track(&c);
    c.set_track_source(Some("http://x/b.gpx".to_string()));
    let b = last_track(&c);
    assert!(b.token > a.token);

    let late = c.finish_load(&a, Ok(document(vec![Waypoint::new(1.0, 1.0, "A1")])));
    assert_eq!(late, LoadOutcome::Stale);
    assert!(c.annotations().is_empty());
    assert!(c.map().shown.is_empty());

    let outcome = c.finish_load(&b, Ok(document(vec![Waypoint::new(2.0, 2.0, "B1")])));
    assert_eq!(outcome, LoadOutcome::Populated { count: 1 });
    assert_eq!(titles(&c), vec!["B1"]);
    assert_eq!(c.map().shown, vec!["B1"]);
}

#[test]
fn test_completion_after_clear_is_stale() {
    let mut c = controller();
    c.set_track_source(Some("http://x/a.gpx".to_string()));
    let a = last_track(&c);
    c.set_track_source(None);

    assert_eq!(c.finish_load(&a, Ok(document(trail()))), LoadOutcome::Stale);
    assert!(c.annotations().is_empty());
    assert_eq!(c.status(), &OverlayStatus::Idle);
}

#[test]
fn test_duplicate_completion_is_stale() {
    let mut c = controller();
    c.set_track_source(Some("http://x/a.gpx".to_string()));
    let a = last_track(&c);
    c.finish_load(&a, Ok(document(trail())));

    assert_eq!(c.finish_load(&a, Ok(document(trail()))), LoadOutcome::Stale);
    assert_eq!(c.annotations().len(), 2);
}

#[test]
fn test_no_document_degrades_silently() {
    let mut c = controller();
    c.set_track_source(Some("http://x/broken.gpx".to_string()));
    let ticket = last_track(&c);

    let outcome = c.finish_load(&ticket, Ok(None));
    assert_eq!(outcome, LoadOutcome::Degraded(Degradation::NoDocument));
    assert!(c.annotations().is_empty());
    assert_eq!(
        c.status(),
        &OverlayStatus::Degraded {
            url: "http://x/broken.gpx".to_string(),
            reason: Degradation::NoDocument
        }
    );
}

#[test]
fn test_fetch_error_degrades() {
    let mut c = controller();
    c.set_track_source(Some("http://x/a.gpx".to_string()));
    let ticket = last_track(&c);

    let outcome = c.finish_load(&ticket, Err(OverlayError::fetch("http://x/a.gpx", "404")));
    match outcome {
        LoadOutcome::Degraded(Degradation::FetchFailed { message }) => {
            assert!(message.contains("404"));
        }
        other => panic!("Expected FetchFailed, got {other:?}"),
    }
    assert!(c.map().shown.is_empty());
}

#[test]
fn test_late_arrival_after_deadline_times_out() {
    let mut c = controller();
    c.set_track_source(Some("http://x/a.gpx".to_string()));
    let ticket = last_track(&c);
    c.fetcher_mut().now = Duration::from_secs(45);

    assert_eq!(
        c.finish_load(&ticket, Ok(document(trail()))),
        LoadOutcome::Degraded(Degradation::TimedOut)
    );
    assert!(c.annotations().is_empty());
}

#[test]
fn test_empty_document_populates_nothing() {
    let mut c = controller();
    c.set_track_source(Some("http://x/empty.gpx".to_string()));
    let ticket = last_track(&c);

    assert_eq!(
        c.finish_load(&ticket, Ok(document(Vec::new()))),
        LoadOutcome::Populated { count: 0 }
    );
    assert!(
        !c.map()
            .calls
            .iter()
            .any(|call| matches!(call, MapCall::Show(..) | MapCall::Add(_)))
    );
}

#[test]
fn test_framing_respects_animate_option() {
    init_logging();
    let opts = OverlayOptions {
        animate_framing: false,
        ..Default::default()
    };
    let mut c = OverlayController::new(RecordingMap::default(), ManualFetcher::default(), opts);
    c.set_track_source(Some("http://x/a.gpx".to_string()));
    let ticket = last_track(&c);
    c.finish_load(&ticket, Ok(document(trail())));

    assert!(matches!(c.map().calls.last(), Some(MapCall::Show(_, false))));
}

// ---- views ----

#[test]
fn test_view_accessories_follow_links() {
    let c = loaded(trail());
    let mut pool = ViewPool::new();
    let ids: Vec<AnnotationId> = c.annotations().ids().collect();

    let start = c.annotation_view(&mut pool, ids[0]).unwrap();
    let view = pool.get(start).unwrap();
    assert_eq!(view.reuse_identifier, "waypoint");
    assert!(view.can_show_callout);
    let slot = view.left_accessory.as_ref().unwrap();
    assert_eq!(slot.frame.width, 59.0);
    assert!(slot.image.is_none());
    assert!(view.right_accessory.is_none());

    let summit = c.annotation_view(&mut pool, ids[1]).unwrap();
    let view = pool.get(summit).unwrap();
    assert!(view.left_accessory.is_some());
    assert_eq!(view.right_accessory, Some(CalloutAccessory::DetailDisclosure));
}

#[test]
fn test_reused_view_drops_old_accessories() {
    let c = loaded(vec![
        Waypoint::new(1.0, 1.0, "Photo")
            .with_link("thumbnail", "http://x/t.jpg")
            .with_link("large", "http://x/l.jpg"),
        Waypoint::new(2.0, 2.0, "Plain"),
    ]);
    let mut pool = ViewPool::new();
    let ids: Vec<AnnotationId> = c.annotations().ids().collect();

    let view = c.annotation_view(&mut pool, ids[0]).unwrap();
    pool.recycle(view);
    let reused = c.annotation_view(&mut pool, ids[1]).unwrap();

    assert_eq!(reused, view);
    let view = pool.get(reused).unwrap();
    assert_eq!(view.annotation, Some(ids[1]));
    assert!(view.left_accessory.is_none());
    assert!(view.right_accessory.is_none());
}

#[test]
fn test_view_for_unknown_annotation() {
    let c = loaded(trail());
    let mut pool = ViewPool::new();
    let old = AnnotationId {
        generation: c.annotations().generation() - 1,
        index: 0,
    };
    assert!(c.annotation_view(&mut pool, old).is_none());
    assert!(pool.is_empty());
}

// ---- thumbnails ----

#[test]
fn test_selection_fetches_thumbnail_asynchronously() {
    let mut c = loaded(trail());
    let mut pool = ViewPool::new();
    let view = c.annotation_view(&mut pool, first_id(&c)).unwrap();

    let ticket_id = c.on_annotation_selected(&pool, view).unwrap();
    let ticket = c.fetcher().thumbnails[0].clone();
    assert_eq!(ticket.id, ticket_id);
    assert_eq!(ticket.url, "http://x/t.jpg");
    assert!(pool.get(view).unwrap().left_accessory.as_ref().unwrap().image.is_none());

    let outcome = c.finish_thumbnail(&mut pool, ticket.id, Ok(png_bytes(4, 3)));
    assert!(matches!(outcome, ThumbnailOutcome::Applied));
    let image = pool.get(view).unwrap().left_accessory.as_ref().unwrap().image.as_ref().unwrap();
    assert_eq!((image.width, image.height), (4, 3));

    // Already loaded: selecting again does not refetch
    assert!(c.on_annotation_selected(&pool, view).is_none());
    assert_eq!(c.fetcher().thumbnails.len(), 1);
}

#[test]
fn test_thumbnail_for_recycled_view_is_discarded() {
    let mut c = loaded(trail());
    let mut pool = ViewPool::new();
    let ids: Vec<AnnotationId> = c.annotations().ids().collect();
    let view = c.annotation_view(&mut pool, ids[0]).unwrap();
    c.on_annotation_selected(&pool, view).unwrap();
    let ticket = c.fetcher().thumbnails[0].clone();

    pool.recycle(view);
    let reused = c.annotation_view(&mut pool, ids[1]).unwrap();
    assert_eq!(reused, view);

    let outcome = c.finish_thumbnail(&mut pool, ticket.id, Ok(png_bytes(2, 2)));
    assert!(matches!(outcome, ThumbnailOutcome::Discarded));
    assert!(pool.get(view).unwrap().left_accessory.as_ref().unwrap().image.is_none());
}

#[test]
fn test_thumbnail_after_track_change_is_discarded() {
    let mut c = loaded(trail());
    let mut pool = ViewPool::new();
    let view = c.annotation_view(&mut pool, first_id(&c)).unwrap();
    c.on_annotation_selected(&pool, view).unwrap();
    let ticket = c.fetcher().thumbnails[0].clone();

    c.set_track_source(Some("http://x/other.gpx".to_string()));
    let outcome = c.finish_thumbnail(&mut pool, ticket.id, Ok(png_bytes(2, 2)));
    assert!(matches!(outcome, ThumbnailOutcome::Discarded));
}

#[test]
fn test_thumbnail_failures_leave_placeholder_empty() {
    let mut c = loaded(trail());
    let mut pool = ViewPool::new();
    let view = c.annotation_view(&mut pool, first_id(&c)).unwrap();

    c.on_annotation_selected(&pool, view).unwrap();
    let ticket = c.fetcher().thumbnails[0].clone();
    let outcome = c.finish_thumbnail(
        &mut pool,
        ticket.id,
        Err(OverlayError::fetch("http://x/t.jpg", "offline")),
    );
    assert!(matches!(outcome, ThumbnailOutcome::Failed(OverlayError::Fetch { .. })));

    // The placeholder is still empty, so the next selection retries
    c.on_annotation_selected(&pool, view).unwrap();
    let retry = c.fetcher().thumbnails[1].clone();
    c.fetcher_mut().now = retry.deadline + Duration::from_millis(1);
    let outcome = c.finish_thumbnail(&mut pool, retry.id, Ok(png_bytes(2, 2)));
    assert!(matches!(outcome, ThumbnailOutcome::Failed(OverlayError::TimedOut { .. })));
    assert!(pool.get(view).unwrap().left_accessory.as_ref().unwrap().image.is_none());
}

#[test]
fn test_repeated_selection_waits_for_in_flight_fetch() {
    let mut c = loaded(trail());
    let mut pool = ViewPool::new();
    let view = c.annotation_view(&mut pool, first_id(&c)).unwrap();

    let first = c.on_annotation_selected(&pool, view).unwrap();
    assert!(c.on_annotation_selected(&pool, view).is_none());
    assert_eq!(c.fetcher().thumbnails.len(), 1);

    // A rebound view is a new request even while the old one is out
    let id = first_id(&c);
    pool.recycle(view);
    let rebound = c.annotation_view(&mut pool, id).unwrap();
    assert_eq!(rebound, view);
    let second = c.on_annotation_selected(&pool, rebound).unwrap();
    assert_ne!(first, second);

    let outcome = c.finish_thumbnail(&mut pool, first, Ok(png_bytes(2, 2)));
    assert!(matches!(outcome, ThumbnailOutcome::Discarded));
    let outcome = c.finish_thumbnail(&mut pool, second, Ok(png_bytes(2, 2)));
    assert!(matches!(outcome, ThumbnailOutcome::Applied));
    assert!(c.pending_thumbnails().is_empty());
}

#[test]
fn test_overdue_thumbnails_expire() {
    let mut c = loaded(trail());
    let mut pool = ViewPool::new();
    let start = c.annotation_view(&mut pool, first_id(&c)).unwrap();
    let ticket = c.on_annotation_selected(&pool, start).unwrap();

    assert!(c.expire_overdue_thumbnails().is_empty());
    assert_eq!(c.pending_thumbnails().len(), 1);

    let deadline = c.pending_thumbnail(ticket).unwrap().deadline;
    c.fetcher_mut().now = deadline + Duration::from_millis(1);
    let expired = c.expire_overdue_thumbnails();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].0, ticket);
    assert!(matches!(
        expired[0].1,
        ThumbnailOutcome::Failed(OverlayError::TimedOut { timeout_ms: 30_000, .. })
    ));
    assert!(c.pending_thumbnails().is_empty());

    // The late answer changes nothing; the next selection retries
    let outcome = c.finish_thumbnail(&mut pool, ticket, Ok(png_bytes(2, 2)));
    assert!(matches!(outcome, ThumbnailOutcome::Discarded));
    assert!(pool.get(start).unwrap().left_accessory.as_ref().unwrap().image.is_none());
    assert!(c.on_annotation_selected(&pool, start).is_some());
}

#[test]
fn test_track_change_forgets_thumbnail_fetches() {
    let mut c = loaded(trail());
    let mut pool = ViewPool::new();
    let view = c.annotation_view(&mut pool, first_id(&c)).unwrap();
    c.on_annotation_selected(&pool, view).unwrap();
    assert_eq!(c.pending_thumbnails().len(), 1);

    c.set_track_source(None);
    assert!(c.pending_thumbnails().is_empty());
}

// ---- navigation ----

#[test]
fn test_callout_tap_navigates_to_image() {
    let c = loaded(trail());
    let mut pool = ViewPool::new();
    let ids: Vec<AnnotationId> = c.annotations().ids().collect();
    let summit = c.annotation_view(&mut pool, ids[1]).unwrap();

    assert_eq!(
        c.on_callout_accessory_tapped(&pool, summit),
        Some(ShowImage {
            route: "show-image".to_string(),
            image_url: "http://x/summit.jpg".to_string(),
            title: "Summit".to_string(),
        })
    );

    // No large image link: no navigation
    let start = c.annotation_view(&mut pool, ids[0]).unwrap();
    assert_eq!(c.on_callout_accessory_tapped(&pool, start), None);
}

// ---- events ----

#[test]
fn test_bus_event_sets_track_source() {
    let c = Rc::new(RefCell::new(controller()));
    let bus = TrackSourceBus::new();
    let subscription = OverlayController::subscribe(&c, &bus);

    bus.post(&TrackSourceEvent {
        url: "http://x/imported.gpx".to_string(),
    });
    assert_eq!(c.borrow().track_source(), Some("http://x/imported.gpx"));
    assert_eq!(c.borrow().fetcher().tracks.len(), 1);

    drop(subscription);
    assert_eq!(bus.subscriber_count(), 0);
    bus.post(&TrackSourceEvent {
        url: "http://x/ignored.gpx".to_string(),
    });
    assert_eq!(c.borrow().track_source(), Some("http://x/imported.gpx"));
}

#[test]
fn test_bus_event_while_controller_busy_is_dropped() {
    init_logging();
    let c = Rc::new(RefCell::new(controller()));
    let bus = TrackSourceBus::new();
    let _subscription = OverlayController::subscribe(&c, &bus);

    {
        let _busy = c.borrow_mut();
        assert_eq!(
            bus.post(&TrackSourceEvent {
                url: "http://x/reentrant.gpx".to_string(),
            }),
            1
        );
    }
    assert_eq!(c.borrow().track_source(), None);
    assert!(c.borrow().fetcher().tracks.is_empty());
}

#[test]
fn test_after_hook_runs_once_controller_is_released() {
    let c = Rc::new(RefCell::new(controller()));
    let bus = TrackSourceBus::new();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let hook = Rc::downgrade(&c);
    let sink = Rc::clone(&seen);
    let _subscription = OverlayController::subscribe_then(&c, &bus, move || {
        let c = hook.upgrade().unwrap();
        // Borrowing here would panic if the handler still held the controller
        let tracks = c.borrow().fetcher().tracks.len();
        sink.borrow_mut().push(tracks);
    });

    bus.post(&TrackSourceEvent {
        url: "http://x/a.gpx".to_string(),
    });
    bus.post(&TrackSourceEvent {
        url: "http://x/b.gpx".to_string(),
    });
    assert_eq!(*seen.borrow(), vec![1, 2]);
}

#[test]
fn test_bus_event_after_controller_dropped() {
    let c = Rc::new(RefCell::new(controller()));
    let bus = TrackSourceBus::new();
    let _subscription = OverlayController::subscribe(&c, &bus);

    drop(c);
    assert_eq!(
        bus.post(&TrackSourceEvent {
            url: "http://x/late.gpx".to_string(),
        }),
        1
    );
}
