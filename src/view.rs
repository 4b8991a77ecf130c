use std::collections::HashMap;

use serde::Serialize;

use crate::annotation::AnnotationId;
use crate::options::Size;

/// Index of a view in its [`ViewPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ViewId(pub usize);

/// A decoded callout thumbnail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Thumbnail {
    pub width: u32,
    pub height: u32,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

/// Left callout accessory: an image frame that starts out empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThumbnailSlot {
    pub frame: Size,
    pub image: Option<Thumbnail>,
}

impl ThumbnailSlot {
    pub fn empty(frame: Size) -> Self {
        Self { frame, image: None }
    }
}

/// Right callout accessory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CalloutAccessory {
    DetailDisclosure,
}

/// A pin view. Views are recycled between annotations; `binding` changes
/// every time the view is handed to a different annotation or returned to
/// the pool.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationView {
    pub id: ViewId,
    pub reuse_identifier: String,
    #[serde(serialize_with = "serialize_annotation_id")]
    pub annotation: Option<AnnotationId>,
    pub binding: u64,
    pub can_show_callout: bool,
    pub left_accessory: Option<ThumbnailSlot>,
    pub right_accessory: Option<CalloutAccessory>,
}

impl AnnotationView {
    fn new(id: ViewId, reuse_identifier: &str) -> Self {
        Self {
            id,
            reuse_identifier: reuse_identifier.to_string(),
            annotation: None,
            binding: 0,
            can_show_callout: false,
            left_accessory: None,
            right_accessory: None,
        }
    }

    /// Point the view at a new annotation, dropping any accessories.
    pub fn bind(&mut self, annotation: AnnotationId) {
        self.binding += 1;
        self.annotation = Some(annotation);
        self.left_accessory = None;
        self.right_accessory = None;
    }

    fn unbind(&mut self) {
        self.binding += 1;
        self.annotation = None;
        self.left_accessory = None;
        self.right_accessory = None;
    }
}

fn serialize_annotation_id<S: serde::Serializer>(
    id: &Option<AnnotationId>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match id {
        Some(id) => serializer.serialize_some(&id.to_string()),
        None => serializer.serialize_none(),
    }
}

/// Pin views plus per-identifier queues of views ready for reuse.
#[derive(Debug, Default)]
pub struct ViewPool {
    views: Vec<AnnotationView>,
    reusable: HashMap<String, Vec<ViewId>>,
}

impl ViewPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ViewId) -> Option<&AnnotationView> {
        self.views.get(id.0)
    }

    pub fn get_mut(&mut self, id: ViewId) -> Option<&mut AnnotationView> {
        self.views.get_mut(id.0)
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Take a queued view for `reuse_identifier`, or create a new one.
    pub fn dequeue_or_create(&mut self, reuse_identifier: &str) -> &mut AnnotationView {
        let reused = self
            .reusable
            .get_mut(reuse_identifier)
            .and_then(|queue| queue.pop());

        let id = match reused {
            Some(id) => id,
            None => {
                let id = ViewId(self.views.len());
                self.views.push(AnnotationView::new(id, reuse_identifier));
                id
            }
        };
        &mut self.views[id.0]
    }

    /// Return a view to its reuse queue. Returns false for unknown or
    /// already queued views.
    pub fn recycle(&mut self, id: ViewId) -> bool {
        let Some(view) = self.views.get_mut(id.0) else {
            return false;
        };
        let queue = self
            .reusable
            .entry(view.reuse_identifier.clone())
            .or_default();
        if queue.contains(&id) {
            return false;
        }
        view.unbind();
        queue.push(id);
        true
    }

    /// Return every bound view whose annotation fails `keep` to its reuse queue.
    pub fn recycle_unless(&mut self, keep: impl Fn(AnnotationId) -> bool) {
        let released: Vec<ViewId> = self
            .views
            .iter()
            .filter(|view| view.annotation.is_some_and(|id| !keep(id)))
            .map(|view| view.id)
            .collect();
        for id in released {
            self.recycle(id);
        }
    }
}
