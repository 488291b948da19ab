use std::sync::Arc;

use crate::backend::api::LinkEndpoint;
use crate::common::ids::{ItemId, LinkId};
use crate::scene::item::Highlight;

/// One straight piece of a link's polyline, between two anchor items.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkSegment {
    pub from: ItemId,
    pub to: ItemId,
}

/// How much a rendered segment is shortened at each end. The decluttered
/// variants trim space for the link label.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct SegmentTrim {
    pub at_from: f32,
    pub at_to: f32,
}

/// Visual object for one backend link: the ordered segment chain plus its
/// waypoint anchor items. `segments.len() == waypoints.len() + 1` always.
pub struct LinkObject {
    item: ItemId,
    pub link: LinkId,
    pub source: LinkEndpoint,
    target: LinkEndpoint,
    pub name: Arc<String>,
    source_item: ItemId,
    target_item: ItemId,
    segments: Vec<LinkSegment>,
    waypoints: Vec<ItemId>,
    // Pre-built (full, decluttered) trims for the outermost segments, so the
    // declutter toggle is a flag swap, not a rebuild.
    first_variants: (SegmentTrim, SegmentTrim),
    last_variants: (SegmentTrim, SegmentTrim),
    decluttered: bool,
    pub highlight: Highlight,
    disposed: bool,
}

impl LinkObject {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        item: ItemId,
        link: LinkId,
        source: LinkEndpoint,
        target: LinkEndpoint,
        name: Arc<String>,
        source_item: ItemId,
        target_item: ItemId,
        waypoints: Vec<ItemId>,
        declutter_length: f32,
    ) -> Self {
        let mut this = Self {
            item,
            link,
            source,
            target,
            name,
            source_item,
            target_item,
            segments: Vec::new(),
            waypoints,
            first_variants: (
                SegmentTrim::default(),
                SegmentTrim {
                    at_from: declutter_length,
                    at_to: 0.0,
                },
            ),
            last_variants: (
                SegmentTrim::default(),
                SegmentTrim {
                    at_from: 0.0,
                    at_to: declutter_length,
                },
            ),
            decluttered: false,
            highlight: Highlight::NONE,
            disposed: false,
        };
        this.rebuild_segments();
        this
    }

    pub fn item(&self) -> ItemId {
        self.item
    }

    pub fn target(&self) -> LinkEndpoint {
        self.target
    }

    pub fn source_item(&self) -> ItemId {
        self.source_item
    }

    pub fn target_item(&self) -> ItemId {
        self.target_item
    }

    pub fn segments(&self) -> &[LinkSegment] {
        &self.segments
    }

    pub fn waypoint_items(&self) -> &[ItemId] {
        &self.waypoints
    }

    pub fn is_decluttered(&self) -> bool {
        self.decluttered
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn dispose(&mut self) {
        self.disposed = true;
    }

    /// Trims currently in effect for the first and last segment.
    pub fn outer_trims(&self) -> (SegmentTrim, SegmentTrim) {
        if self.decluttered {
            (self.first_variants.1, self.last_variants.1)
        } else {
            (self.first_variants.0, self.last_variants.0)
        }
    }

    pub fn set_decluttered(&mut self, decluttered: bool) {
        self.decluttered = decluttered;
    }

    pub fn set_target(&mut self, target: LinkEndpoint, target_item: ItemId) {
        self.target = target;
        self.target_item = target_item;
        self.rebuild_segments();
    }

    pub fn insert_waypoint(&mut self, index: usize, item: ItemId) {
        let index = index.min(self.waypoints.len());
        self.waypoints.insert(index, item);
        self.rebuild_segments();
    }

    /// Returns false when the item was not part of this link.
    pub fn remove_waypoint_item(&mut self, item: ItemId) -> bool {
        let before = self.waypoints.len();
        self.waypoints.retain(|e| *e != item);
        if self.waypoints.len() == before {
            return false;
        }
        self.rebuild_segments();
        true
    }

    fn rebuild_segments(&mut self) {
        self.segments.clear();
        let mut from = self.source_item;
        for wp in &self.waypoints {
            self.segments.push(LinkSegment { from, to: *wp });
            from = *wp;
        }
        self.segments.push(LinkSegment {
            from,
            to: self.target_item,
        });
        debug_assert_eq!(self.segments.len(), self.waypoints.len() + 1);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::ids::{ItemIdGen, LinkId};

    fn new_link(waypoints: usize) -> (LinkObject, ItemIdGen) {
        let mut ids = ItemIdGen::new();
        let item = ids.next();
        let source_item = ids.next();
        let target_item = ids.next();
        let wps: Vec<ItemId> = (0..waypoints).map(|_| ids.next()).collect();
        let obj = LinkObject::new(
            item,
            LinkId::now_v7(),
            LinkEndpoint::Part(crate::common::ids::PartId::now_v7()),
            LinkEndpoint::Part(crate::common::ids::PartId::now_v7()),
            Arc::new("flow".to_owned()),
            source_item,
            target_item,
            wps,
            20.0,
        );
        (obj, ids)
    }

    #[test]
    fn test_segment_count_tracks_waypoints() {
        let (mut obj, mut ids) = new_link(0);
        assert_eq!(obj.segments().len(), 1);

        let a = ids.next();
        obj.insert_waypoint(0, a);
        assert_eq!(obj.segments().len(), 2);
        assert_eq!(obj.segments().len(), obj.waypoint_items().len() + 1);

        let b = ids.next();
        obj.insert_waypoint(1, b);
        assert_eq!(obj.segments().len(), 3);
        assert_eq!(obj.segments()[1], LinkSegment { from: a, to: b });

        assert!(obj.remove_waypoint_item(a));
        assert_eq!(obj.segments().len(), 2);
        assert_eq!(obj.segments().len(), obj.waypoint_items().len() + 1);
        assert!(!obj.remove_waypoint_item(a));
    }

    #[test]
    fn test_declutter_is_a_variant_swap() {
        let (mut obj, _) = new_link(2);
        let full = obj.outer_trims();
        assert_eq!(full.0, SegmentTrim::default());

        obj.set_decluttered(true);
        let trimmed = obj.outer_trims();
        assert_eq!(trimmed.0.at_from, 20.0);
        assert_eq!(trimmed.1.at_to, 20.0);
        // Segments themselves are untouched by the toggle.
        assert_eq!(obj.segments().len(), 3);

        obj.set_decluttered(false);
        assert_eq!(obj.outer_trims(), full);
    }

    #[test]
    fn test_retarget_rewires_last_segment() {
        let (mut obj, mut ids) = new_link(1);
        let new_target = ids.next();
        obj.set_target(
            LinkEndpoint::Part(crate::common::ids::PartId::now_v7()),
            new_target,
        );
        assert_eq!(obj.segments().last().unwrap().to, new_target);
        assert_eq!(obj.segments().len(), 2);
    }
}
