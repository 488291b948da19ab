use eframe::egui;
use std::sync::Arc;

use crate::backend::api::{LinkEndpoint, PortSide};
use crate::common::eref::ERef;
use crate::common::geometry;
use crate::common::ids::{ItemId, LinkId, PartId, PortId, WaypointId};

/// Closed classification of everything that can appear in a scene.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Part,
    ParentProxy,
    Link,
    Waypoint,
    IfxPort,
    SizeGrip,
    Marker,
}

impl ItemKind {
    /// Whether this kind can ever be selected, independent of the current
    /// interaction state.
    pub fn ever_selectable(self) -> bool {
        matches!(
            self,
            ItemKind::Part | ItemKind::ParentProxy | ItemKind::Waypoint | ItemKind::IfxPort
        )
    }

    pub fn multi_selectable(self) -> bool {
        matches!(self, ItemKind::Part | ItemKind::Waypoint)
    }

    /// Kinds a link-creation gesture may end at.
    pub fn link_endpoint(self) -> bool {
        matches!(self, ItemKind::Part | ItemKind::ParentProxy | ItemKind::IfxPort)
    }

    pub fn click_deletable(self) -> bool {
        matches!(self, ItemKind::Link | ItemKind::Waypoint)
    }
}

/// Per-item display emphasis. The layers are independent so that deletion-mode
/// hover never clobbers an existing selection highlight.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Highlight {
    pub selected: bool,
    pub pending_delete: bool,
    pub link_target: bool,
}

impl Highlight {
    pub const NONE: Self = Self {
        selected: false,
        pending_delete: false,
        link_target: false,
    };
}

/// Visual state of the target marker trailing the cursor during link
/// creation/retargeting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkerState {
    ValidTarget,
    InvalidTarget,
    AddWaypoint,
}

/// Everything the link machinery needs to know about an endpoint candidate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AnchorInfo {
    pub item: ItemId,
    pub kind: ItemKind,
    pub endpoint: Option<LinkEndpoint>,
    pub owner_part: Option<PartId>,
}

/// Pairwise endpoint capability check: each side must accept the other.
pub fn link_allowed_between(source: &AnchorInfo, target: &AnchorInfo) -> bool {
    if source.item == target.item {
        return false;
    }
    if !source.kind.link_endpoint() || !target.kind.link_endpoint() {
        return false;
    }
    // A part refuses a direct link with one of its own interface ports.
    let own_port = |a: &AnchorInfo, b: &AnchorInfo| {
        a.kind == ItemKind::Part
            && b.kind == ItemKind::IfxPort
            && a.owner_part.is_some()
            && a.owner_part == b.owner_part
    };
    !(own_port(source, target) || own_port(target, source))
}

pub const WAYPOINT_RADIUS: f32 = 5.0;

pub struct PartItem {
    id: ItemId,
    pub part: PartId,
    pub name: Arc<String>,
    rect: egui::Rect,
    pub run_role: bool,
    pub highlight: Highlight,
    disposed: bool,
}

impl PartItem {
    pub fn new(id: ItemId, part: PartId, name: Arc<String>, rect: egui::Rect) -> Self {
        Self {
            id,
            part,
            name,
            rect,
            run_role: false,
            highlight: Highlight::NONE,
            disposed: false,
        }
    }

    pub fn rect(&self) -> egui::Rect {
        self.rect
    }

    pub fn set_rect(&mut self, rect: egui::Rect) {
        self.rect = rect;
    }

    pub fn set_position(&mut self, position: egui::Pos2) {
        self.rect = egui::Rect::from_min_size(position, self.rect.size());
    }

    pub fn set_size(&mut self, size: egui::Vec2) {
        self.rect = egui::Rect::from_min_size(self.rect.min, size);
    }
}

/// Stand-in box for the parent actor inside its own sub-scene.
pub struct ParentProxyItem {
    id: ItemId,
    pub part: PartId,
    rect: egui::Rect,
    pub highlight: Highlight,
    disposed: bool,
}

impl ParentProxyItem {
    pub fn new(id: ItemId, part: PartId, rect: egui::Rect) -> Self {
        Self {
            id,
            part,
            rect,
            highlight: Highlight::NONE,
            disposed: false,
        }
    }

    pub fn rect(&self) -> egui::Rect {
        self.rect
    }

    pub fn set_position(&mut self, position: egui::Pos2) {
        self.rect = egui::Rect::from_min_size(position, self.rect.size());
    }
}

pub struct IfxPortItem {
    id: ItemId,
    pub port: PortId,
    pub owner: PartId,
    pub side: PortSide,
    pub row: i32,
    pub ifx_level: u8,
    rect: egui::Rect,
    pub highlight: Highlight,
    disposed: bool,
}

impl IfxPortItem {
    pub fn new(
        id: ItemId,
        port: PortId,
        owner: PartId,
        side: PortSide,
        row: i32,
        ifx_level: u8,
        rect: egui::Rect,
    ) -> Self {
        Self {
            id,
            port,
            owner,
            side,
            row,
            ifx_level,
            rect,
            highlight: Highlight::NONE,
            disposed: false,
        }
    }

    pub fn rect(&self) -> egui::Rect {
        self.rect
    }

    pub fn set_placement(&mut self, side: PortSide, row: i32, rect: egui::Rect) {
        self.side = side;
        self.row = row;
        self.rect = rect;
    }
}

/// A bend point on a link's polyline. Both a movable, selectable item and a
/// segment anchor.
pub struct WaypointItem {
    id: ItemId,
    pub waypoint: WaypointId,
    pub link: LinkId,
    position: egui::Pos2,
    pub decluttered: bool,
    pub highlight: Highlight,
    disposed: bool,
}

impl WaypointItem {
    pub fn new(id: ItemId, waypoint: WaypointId, link: LinkId, position: egui::Pos2) -> Self {
        Self {
            id,
            waypoint,
            link,
            position,
            decluttered: false,
            highlight: Highlight::NONE,
            disposed: false,
        }
    }

    pub fn position(&self) -> egui::Pos2 {
        self.position
    }

    pub fn set_position(&mut self, position: egui::Pos2) {
        self.position = position;
    }

    pub fn rect(&self) -> egui::Rect {
        egui::Rect::from_center_size(self.position, egui::Vec2::splat(2.0 * WAYPOINT_RADIUS))
    }
}

/// Resize handle attached to a selected part; claims exclusive input through
/// the object-interaction state while dragged.
pub struct SizeGripItem {
    id: ItemId,
    pub owner: ItemId,
    rect: egui::Rect,
    disposed: bool,
}

impl SizeGripItem {
    pub fn new(id: ItemId, owner: ItemId, rect: egui::Rect) -> Self {
        Self {
            id,
            owner,
            rect,
            disposed: false,
        }
    }

    pub fn rect(&self) -> egui::Rect {
        self.rect
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MarkerShape {
    Target { state: MarkerState },
    WaypointDot,
    Line { from: egui::Pos2, to: egui::Pos2 },
}

/// Transient visual aid owned by a link gesture. Never hit-tested as a
/// regular item, but a valid segment anchor.
pub struct MarkerItem {
    id: ItemId,
    pub shape: MarkerShape,
    rect: egui::Rect,
    disposed: bool,
}

impl MarkerItem {
    pub fn new(id: ItemId, shape: MarkerShape, rect: egui::Rect) -> Self {
        Self {
            id,
            shape,
            rect,
            disposed: false,
        }
    }

    pub fn rect(&self) -> egui::Rect {
        self.rect
    }

    pub fn move_to(&mut self, rect: egui::Rect, state: Option<MarkerState>) {
        self.rect = rect;
        if let (MarkerShape::Target { state: s }, Some(new)) = (&mut self.shape, state) {
            *s = new;
        }
    }

    pub fn set_line(&mut self, from: egui::Pos2, to: egui::Pos2) {
        self.shape = MarkerShape::Line { from, to };
        self.rect = egui::Rect::from_two_pos(from, to);
    }
}

#[derive(Clone, derive_more::From)]
pub enum AnyItem {
    Part(ERef<PartItem>),
    ParentProxy(ERef<ParentProxyItem>),
    Waypoint(ERef<WaypointItem>),
    IfxPort(ERef<IfxPortItem>),
    SizeGrip(ERef<SizeGripItem>),
    Marker(ERef<MarkerItem>),
}

impl AnyItem {
    pub fn id(&self) -> ItemId {
        match self {
            AnyItem::Part(e) => e.read().id,
            AnyItem::ParentProxy(e) => e.read().id,
            AnyItem::Waypoint(e) => e.read().id,
            AnyItem::IfxPort(e) => e.read().id,
            AnyItem::SizeGrip(e) => e.read().id,
            AnyItem::Marker(e) => e.read().id,
        }
    }

    pub fn kind(&self) -> ItemKind {
        match self {
            AnyItem::Part(..) => ItemKind::Part,
            AnyItem::ParentProxy(..) => ItemKind::ParentProxy,
            AnyItem::Waypoint(..) => ItemKind::Waypoint,
            AnyItem::IfxPort(..) => ItemKind::IfxPort,
            AnyItem::SizeGrip(..) => ItemKind::SizeGrip,
            AnyItem::Marker(..) => ItemKind::Marker,
        }
    }

    pub fn bounding_rect(&self) -> egui::Rect {
        match self {
            AnyItem::Part(e) => e.read().rect,
            AnyItem::ParentProxy(e) => e.read().rect,
            AnyItem::Waypoint(e) => e.read().rect(),
            AnyItem::IfxPort(e) => e.read().rect,
            AnyItem::SizeGrip(e) => e.read().rect,
            AnyItem::Marker(e) => e.read().rect,
        }
    }

    /// Scenario-space position used by move commands.
    pub fn position(&self) -> egui::Pos2 {
        match self {
            AnyItem::Waypoint(e) => e.read().position,
            other => other.bounding_rect().min,
        }
    }

    pub fn translate(&self, delta: egui::Vec2) {
        match self {
            AnyItem::Part(e) => {
                let mut w = e.write();
                w.rect = w.rect.translate(delta);
            }
            AnyItem::ParentProxy(e) => {
                let mut w = e.write();
                w.rect = w.rect.translate(delta);
            }
            AnyItem::Waypoint(e) => {
                let mut w = e.write();
                w.position += delta;
            }
            AnyItem::IfxPort(e) => {
                let mut w = e.write();
                w.rect = w.rect.translate(delta);
            }
            AnyItem::SizeGrip(e) => {
                let mut w = e.write();
                w.rect = w.rect.translate(delta);
            }
            AnyItem::Marker(e) => {
                let mut w = e.write();
                w.rect = w.rect.translate(delta);
            }
        }
    }

    pub fn is_disposed(&self) -> bool {
        match self {
            AnyItem::Part(e) => e.read().disposed,
            AnyItem::ParentProxy(e) => e.read().disposed,
            AnyItem::Waypoint(e) => e.read().disposed,
            AnyItem::IfxPort(e) => e.read().disposed,
            AnyItem::SizeGrip(e) => e.read().disposed,
            AnyItem::Marker(e) => e.read().disposed,
        }
    }

    pub fn dispose(&self) {
        match self {
            AnyItem::Part(e) => e.write().disposed = true,
            AnyItem::ParentProxy(e) => e.write().disposed = true,
            AnyItem::Waypoint(e) => e.write().disposed = true,
            AnyItem::IfxPort(e) => e.write().disposed = true,
            AnyItem::SizeGrip(e) => e.write().disposed = true,
            AnyItem::Marker(e) => e.write().disposed = true,
        }
    }

    pub fn highlight(&self) -> Highlight {
        match self {
            AnyItem::Part(e) => e.read().highlight,
            AnyItem::ParentProxy(e) => e.read().highlight,
            AnyItem::Waypoint(e) => e.read().highlight,
            AnyItem::IfxPort(e) => e.read().highlight,
            AnyItem::SizeGrip(..) | AnyItem::Marker(..) => Highlight::NONE,
        }
    }

    pub fn with_highlight(&self, f: impl FnOnce(&mut Highlight)) {
        match self {
            AnyItem::Part(e) => f(&mut e.write().highlight),
            AnyItem::ParentProxy(e) => f(&mut e.write().highlight),
            AnyItem::Waypoint(e) => f(&mut e.write().highlight),
            AnyItem::IfxPort(e) => f(&mut e.write().highlight),
            AnyItem::SizeGrip(..) | AnyItem::Marker(..) => {}
        }
    }

    /// `None` for kinds that cannot terminate a link segment.
    pub fn anchor_info(&self) -> Option<AnchorInfo> {
        match self {
            AnyItem::Part(e) => {
                let r = e.read();
                Some(AnchorInfo {
                    item: r.id,
                    kind: ItemKind::Part,
                    endpoint: Some(LinkEndpoint::Part(r.part)),
                    owner_part: Some(r.part),
                })
            }
            AnyItem::ParentProxy(e) => {
                let r = e.read();
                Some(AnchorInfo {
                    item: r.id,
                    kind: ItemKind::ParentProxy,
                    endpoint: Some(LinkEndpoint::Part(r.part)),
                    owner_part: Some(r.part),
                })
            }
            AnyItem::Waypoint(e) => {
                let r = e.read();
                Some(AnchorInfo {
                    item: r.id,
                    kind: ItemKind::Waypoint,
                    endpoint: None,
                    owner_part: None,
                })
            }
            AnyItem::IfxPort(e) => {
                let r = e.read();
                Some(AnchorInfo {
                    item: r.id,
                    kind: ItemKind::IfxPort,
                    endpoint: Some(LinkEndpoint::Port(r.port)),
                    owner_part: Some(r.owner),
                })
            }
            AnyItem::Marker(e) => {
                let r = e.read();
                Some(AnchorInfo {
                    item: r.id,
                    kind: ItemKind::Marker,
                    endpoint: None,
                    owner_part: None,
                })
            }
            AnyItem::SizeGrip(..) => None,
        }
    }

    /// Where a link attaching to this item meets its boundary.
    pub fn contact_point(
        &self,
        line: (egui::Pos2, egui::Pos2),
        other_end: egui::Pos2,
        mid_locked: bool,
    ) -> egui::Pos2 {
        match self {
            // Point-like anchors attach at their center.
            AnyItem::Waypoint(e) => e.read().position,
            other => geometry::contact_point(other.bounding_rect(), line, other_end, mid_locked),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn info(item: u64, kind: ItemKind, owner: Option<PartId>) -> AnchorInfo {
        AnchorInfo {
            item: ItemId::from_raw(item),
            kind,
            endpoint: None,
            owner_part: owner,
        }
    }

    #[test]
    fn test_self_link_is_rejected() {
        let a = info(1, ItemKind::Part, Some(PartId::now_v7()));
        assert!(!link_allowed_between(&a, &a));
    }

    #[test]
    fn test_part_to_own_port_is_rejected_both_ways() {
        let owner = PartId::now_v7();
        let part = info(1, ItemKind::Part, Some(owner));
        let own_port = info(2, ItemKind::IfxPort, Some(owner));
        let other_port = info(3, ItemKind::IfxPort, Some(PartId::now_v7()));
        assert!(!link_allowed_between(&part, &own_port));
        assert!(!link_allowed_between(&own_port, &part));
        assert!(link_allowed_between(&part, &other_port));
    }

    #[test]
    fn test_non_endpoint_kinds_are_rejected() {
        let part = info(1, ItemKind::Part, Some(PartId::now_v7()));
        let wp = info(2, ItemKind::Waypoint, None);
        assert!(!link_allowed_between(&part, &wp));
    }
}
