pub mod fsm;
pub mod item;
pub mod link;
pub mod selection;
pub mod tracker;

use eframe::egui;
use std::collections::HashMap;

use crate::backend::api::{LinkEndpoint, Notification, PortSide};
use crate::backend::worker::BackendHandle;
use crate::commands::ops::{
    CreateLinkCommand, MoveWaypointsCommand, PartsPositionsCommand, RemoveLinkCommand,
    RemoveWaypointCommand, ResizeFrameCommand, RetargetLinkCommand,
};
use crate::commands::{CommandStack, UndoableCommand, ViewportContext};
use crate::common::config::Settings;
use crate::common::eref::ERef;
use crate::common::geometry;
use crate::common::ids::{ItemId, ItemIdGen, LinkId, PartId, PortId, WaypointId};
use fsm::{CommandRequest, Effect, InputEvent, SceneProbe, SceneStateMachine, SceneState};
use item::{
    AnchorInfo, AnyItem, IfxPortItem, ItemKind, MarkerItem, MarkerShape, MarkerState,
    ParentProxyItem, PartItem, SizeGripItem, WaypointItem,
};
use link::LinkObject;
use selection::SelectionModel;
use tracker::{IfxPortTracker, TrackerTick};

const PORT_SIZE: f32 = 12.0;
const PORT_SPACING: f32 = 18.0;

/// Outbound events the embedding application wires to panels and menus.
#[derive(Clone, Debug, PartialEq)]
pub enum SceneNotice {
    SelectionChanged,
    PartItemAdded(PartId),
    NavigateToActor(PartId),
    OpenEditor(PartId),
    ShowChild(PartId),
    ShowIfxPort(PortId),
    FilterEvents(PartId),
}

/// Composition root for one visible sub-diagram: owns the items, the
/// selection, the link registry and the interaction state machine, and
/// mediates between backend notifications and item lifecycle.
///
/// The shared lookup maps are mutated only here, through the item-add and
/// item-remove choke points, so removal always cleans every map atomically.
pub struct Scene {
    actor: PartId,
    settings: Settings,
    ids: ItemIdGen,
    items: HashMap<ItemId, AnyItem>,
    order: Vec<ItemId>,
    part_items: HashMap<PartId, ItemId>,
    port_items: HashMap<PortId, ItemId>,
    waypoint_items: HashMap<WaypointId, ItemId>,
    links: HashMap<LinkId, LinkObject>,
    link_items: HashMap<ItemId, LinkId>,
    selection: SelectionModel,
    machine: SceneStateMachine,
    tracker: IfxPortTracker,
    transients: Vec<ItemId>,
    target_marker: Option<ItemId>,
    rubber_line: Option<ItemId>,
    rubber_band: Option<egui::Rect>,
    delete_cursor: Option<bool>,
    cursor: Option<egui::Pos2>,
    notices: Vec<SceneNotice>,
    proxy_item: ItemId,
}

/// Read-only view over the scene handed to the state machine.
struct SceneView<'a> {
    items: &'a HashMap<ItemId, AnyItem>,
    order: &'a [ItemId],
    links: &'a HashMap<LinkId, LinkObject>,
    link_items: &'a HashMap<ItemId, LinkId>,
    selection: &'a SelectionModel,
    hit_radius: f32,
}

macro_rules! scene_view {
    ($self:ident) => {
        SceneView {
            items: &$self.items,
            order: &$self.order,
            links: &$self.links,
            link_items: &$self.link_items,
            selection: &$self.selection,
            hit_radius: $self.settings.hit_radius,
        }
    };
}

impl SceneView<'_> {
    fn segment_point(&self, item: ItemId) -> Option<egui::Pos2> {
        let any = self.items.get(&item)?;
        Some(match any {
            AnyItem::Waypoint(e) => e.read().position(),
            other => other.bounding_rect().center(),
        })
    }
}

impl SceneProbe for SceneView<'_> {
    fn item_kind(&self, item: ItemId) -> Option<ItemKind> {
        if self.link_items.contains_key(&item) {
            return Some(ItemKind::Link);
        }
        self.items.get(&item).map(|e| e.kind())
    }

    fn item_rect(&self, item: ItemId) -> Option<egui::Rect> {
        if let Some(link) = self.link_items.get(&item) {
            let obj = self.links.get(link)?;
            let mut rect = egui::Rect::NOTHING;
            for segment in obj.segments() {
                if let Some(p) = self.segment_point(segment.from) {
                    rect.extend_with(p);
                }
                if let Some(p) = self.segment_point(segment.to) {
                    rect.extend_with(p);
                }
            }
            return Some(rect);
        }
        self.items.get(&item).map(|e| e.bounding_rect())
    }

    fn item_position(&self, item: ItemId) -> Option<egui::Pos2> {
        self.items.get(&item).map(|e| e.position())
    }

    fn item_at(&self, pos: egui::Pos2) -> Option<ItemId> {
        // Later items draw above earlier ones; transient markers never
        // intercept input.
        for item in self.order.iter().rev() {
            let Some(any) = self.items.get(item) else {
                continue;
            };
            if any.is_disposed() || any.kind() == ItemKind::Marker {
                continue;
            }
            if any.bounding_rect().contains(pos) {
                return Some(*item);
            }
        }
        for obj in self.links.values() {
            if obj.is_disposed() {
                continue;
            }
            for segment in obj.segments() {
                let (Some(a), Some(b)) = (
                    self.segment_point(segment.from),
                    self.segment_point(segment.to),
                ) else {
                    continue;
                };
                if geometry::dist_to_segment(pos, a, b) <= self.hit_radius {
                    return Some(obj.item());
                }
            }
        }
        None
    }

    fn items_contained_in(&self, rect: egui::Rect) -> Vec<ItemId> {
        self.order
            .iter()
            .filter(|e| {
                self.items.get(e).is_some_and(|any| {
                    !any.is_disposed()
                        && any.kind() != ItemKind::Marker
                        && rect.contains_rect(any.bounding_rect())
                })
            })
            .copied()
            .collect()
    }

    fn items_intersecting(&self, rect: egui::Rect) -> Vec<ItemId> {
        self.order
            .iter()
            .filter(|e| {
                self.items.get(e).is_some_and(|any| {
                    !any.is_disposed() && rect.intersects(any.bounding_rect())
                })
            })
            .copied()
            .collect()
    }

    fn anchor_info(&self, item: ItemId) -> Option<AnchorInfo> {
        self.items.get(&item).and_then(|e| e.anchor_info())
    }

    fn has_direct_link(&self, source: ItemId, target: ItemId) -> bool {
        let endpoint = |item: ItemId| {
            self.items
                .get(&item)
                .and_then(|e| e.anchor_info())
                .and_then(|a| a.endpoint)
        };
        let (Some(s), Some(t)) = (endpoint(source), endpoint(target)) else {
            return false;
        };
        self.links
            .values()
            .any(|l| !l.is_disposed() && l.source == s && l.target() == t)
    }

    fn is_disposed(&self, item: ItemId) -> bool {
        self.items.get(&item).is_none_or(|e| e.is_disposed())
    }

    fn selection(&self) -> Vec<ItemId> {
        self.selection.ids().to_vec()
    }

    fn part_of_item(&self, item: ItemId) -> Option<PartId> {
        match self.items.get(&item)? {
            AnyItem::Part(e) => Some(e.read().part),
            AnyItem::ParentProxy(e) => Some(e.read().part),
            _ => None,
        }
    }

    fn waypoint_of_item(&self, item: ItemId) -> Option<(LinkId, WaypointId)> {
        match self.items.get(&item)? {
            AnyItem::Waypoint(e) => {
                let r = e.read();
                Some((r.link, r.waypoint))
            }
            _ => None,
        }
    }

    fn link_of_item(&self, item: ItemId) -> Option<LinkId> {
        self.link_items.get(&item).copied()
    }
}

impl Scene {
    pub fn new(actor: PartId, actor_frame: egui::Rect, settings: Settings) -> Self {
        let mut ids = ItemIdGen::new();
        let proxy_id = ids.next();
        let proxy = ParentProxyItem::new(proxy_id, actor, actor_frame);
        let machine = SceneStateMachine::new((&settings).into());
        let mut items = HashMap::new();
        items.insert(proxy_id, AnyItem::from(ERef::new(proxy)));
        Self {
            actor,
            settings,
            ids,
            items,
            order: vec![proxy_id],
            part_items: HashMap::new(),
            port_items: HashMap::new(),
            waypoint_items: HashMap::new(),
            links: HashMap::new(),
            link_items: HashMap::new(),
            selection: SelectionModel::new(),
            machine,
            tracker: IfxPortTracker::new(),
            transients: Vec::new(),
            target_marker: None,
            rubber_line: None,
            rubber_band: None,
            delete_cursor: None,
            cursor: None,
            notices: Vec::new(),
            proxy_item: proxy_id,
        }
    }

    pub fn actor(&self) -> PartId {
        self.actor
    }

    pub fn state(&self) -> &SceneState {
        self.machine.state()
    }

    pub fn selection(&self) -> &SelectionModel {
        &self.selection
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The rubber-band rectangle to draw, if a band gesture is running.
    pub fn rubber_band(&self) -> Option<egui::Rect> {
        self.rubber_band
    }

    /// Cursor override while deletion mode is active: `Some(deletable)`.
    pub fn delete_cursor(&self) -> Option<bool> {
        self.delete_cursor
    }

    pub fn proxy_item(&self) -> ItemId {
        self.proxy_item
    }

    pub fn item(&self, item: ItemId) -> Option<&AnyItem> {
        self.items.get(&item)
    }

    pub fn child_part_item(&self, part: PartId) -> Option<ItemId> {
        self.part_items.get(&part).copied()
    }

    pub fn link_obj(&self, link: LinkId) -> Option<&LinkObject> {
        self.links.get(&link)
    }

    pub fn find_link_endpoint_item(&self, endpoint: LinkEndpoint) -> Option<ItemId> {
        match endpoint {
            LinkEndpoint::Part(part) if part == self.actor => Some(self.proxy_item),
            LinkEndpoint::Part(part) => self.part_items.get(&part).copied(),
            LinkEndpoint::Port(port) => self.port_items.get(&port).copied(),
        }
    }

    pub fn is_item_visible(&self, item: ItemId, viewport: egui::Rect) -> bool {
        self.items
            .get(&item)
            .is_some_and(|e| !e.is_disposed() && viewport.intersects(e.bounding_rect()))
    }

    /// The rendered polyline of a link: one point pair per segment, with
    /// boundary contact points on both anchors, the active declutter trims,
    /// and a perpendicular offset separating parallel links that share both
    /// endpoints.
    pub fn link_polyline(&self, link: LinkId) -> Option<Vec<(egui::Pos2, egui::Pos2)>> {
        let obj = self.links.get(&link)?;
        if obj.is_disposed() {
            return None;
        }
        let mid_locked = self.settings.mid_locked_contacts;

        // Lane among the parallel links joining the same two endpoints (in
        // either direction), in stable id order. The lane frame is anchored
        // to the canonical endpoint order so opposite-direction links land on
        // opposite sides.
        let pair = |x: LinkEndpoint, y: LinkEndpoint| if x <= y { (x, y) } else { (y, x) };
        let own_pair = pair(obj.source, obj.target());
        let mut siblings: Vec<LinkId> = self
            .links
            .iter()
            .filter(|(_, l)| !l.is_disposed() && pair(l.source, l.target()) == own_pair)
            .map(|(id, _)| *id)
            .collect();
        siblings.sort();
        let lane = siblings.iter().position(|e| *e == link).unwrap_or(0);
        let lanes = siblings.len();
        let lane_sign = if obj.source <= obj.target() { 1.0 } else { -1.0 };

        let (first_trim, last_trim) = obj.outer_trims();
        let segment_count = obj.segments().len();
        let mut polyline = Vec::with_capacity(segment_count);
        for (index, segment) in obj.segments().iter().enumerate() {
            let (from_item, to_item) =
                (self.items.get(&segment.from)?, self.items.get(&segment.to)?);
            if from_item.is_disposed() || to_item.is_disposed() {
                return None;
            }
            let line = geometry::natural_connection_line(
                from_item.bounding_rect(),
                to_item.bounding_rect(),
            );
            let mut a = from_item.contact_point(line, line.1, mid_locked);
            let mut b = to_item.contact_point(line, line.0, mid_locked);

            let offset = geometry::parallel_offset(
                a,
                b,
                lane,
                lanes,
                self.settings.parallel_link_spacing,
            ) * lane_sign;
            a += offset;
            b += offset;

            let trim = |from: egui::Pos2, to: egui::Pos2, by: f32| {
                let d = to - from;
                let len = d.length();
                if by <= 0.0 || len <= by {
                    from
                } else {
                    from + d * (by / len)
                }
            };
            if index == 0 {
                a = trim(a, b, first_trim.at_from);
            }
            if index == segment_count - 1 {
                b = trim(b, a, last_trim.at_to);
            }
            polyline.push((a, b));
        }
        Some(polyline)
    }

    pub fn drain_notices(&mut self) -> Vec<SceneNotice> {
        std::mem::take(&mut self.notices)
    }

    /// Feeds a raw input event through the state machine and applies the
    /// resulting effects. Returns whether the event was consumed.
    pub fn handle_input(
        &mut self,
        event: InputEvent,
        stack: &mut CommandStack,
        backend: &mut BackendHandle,
        viewport: ViewportContext,
    ) -> bool {
        if let InputEvent::MouseMove { pos, .. } = event {
            self.cursor = Some(pos);
        }
        let (consumed, effects) = {
            let view = scene_view!(self);
            self.machine.handle_event(event, &view)
        };
        self.apply_effects(effects, stack, backend, viewport);
        consumed
    }

    // ---- scene-level interaction requests -------------------------------

    pub fn start_link_creation(&mut self, source: ItemId) {
        let effects = {
            let view = scene_view!(self);
            self.machine.start_link_creation(source, &view)
        };
        self.apply_visual_effects(effects);
    }

    pub fn cancel_link_creation(&mut self) {
        let effects = self.machine.cancel_link_creation();
        self.apply_visual_effects(effects);
    }

    pub fn start_link_retargeting(&mut self, link: LinkId) {
        let Some(obj) = self.links.get(&link) else {
            log::warn!("retargeting requested for unknown link");
            return;
        };
        let (source_item, target_item) = (obj.source_item(), obj.target_item());
        let effects = {
            let view = scene_view!(self);
            self.machine
                .start_retargeting(link, source_item, target_item, &view)
        };
        self.apply_visual_effects(effects);
    }

    pub fn cancel_link_retargeting(&mut self) {
        let effects = self.machine.cancel_retargeting();
        self.apply_visual_effects(effects);
    }

    /// A size grip claims input. A transient grip item marks the interaction
    /// until [`Scene::end_resize`].
    pub fn begin_resize(&mut self, owner: ItemId) -> Option<ItemId> {
        let rect = self.items.get(&owner)?.bounding_rect();
        self.machine.start_obj_interaction();
        let grip_rect =
            egui::Rect::from_center_size(rect.max, egui::Vec2::splat(PORT_SIZE));
        let id = self.ids.next();
        self.insert_item(AnyItem::from(ERef::new(SizeGripItem::new(id, owner, grip_rect))));
        self.transients.push(id);
        Some(id)
    }

    pub fn end_resize(
        &mut self,
        part: PartId,
        old_frame: egui::Rect,
        new_frame: egui::Rect,
        stack: &mut CommandStack,
        backend: &mut BackendHandle,
        viewport: ViewportContext,
    ) {
        self.machine.end_obj_interaction();
        self.dispose_transients();
        stack.push(
            Box::new(ResizeFrameCommand::new(part, old_frame, new_frame)),
            viewport,
            backend,
        );
    }

    /// Selection request for a port whose item may not exist yet; retried a
    /// bounded number of times as ports appear.
    pub fn request_select_ifx_port(&mut self, port: PortId) {
        if let Some(item) = self.port_items.get(&port).copied() {
            self.set_selection(vec![item]);
            self.notices.push(SceneNotice::ShowIfxPort(port));
            return;
        }
        self.tracker
            .request(port, self.settings.ifx_tracker_max_retries);
    }

    pub fn request_navigate_to_actor(&mut self, actor: PartId) {
        self.notices.push(SceneNotice::NavigateToActor(actor));
    }

    pub fn request_open_editor(&mut self, part: PartId) {
        self.notices.push(SceneNotice::OpenEditor(part));
    }

    pub fn request_show_child(&mut self, part: PartId) {
        self.notices.push(SceneNotice::ShowChild(part));
    }

    pub fn request_filter_events(&mut self, part: PartId) {
        self.notices.push(SceneNotice::FilterEvents(part));
    }

    // ---- backend plumbing ------------------------------------------------

    /// Drains pending backend notifications, then retries any pending port
    /// selection.
    pub fn pump_notifications(&mut self, backend: &mut BackendHandle) {
        while let Some(n) = backend.poll_notification() {
            self.apply_notification(n);
        }
        self.tick_tracker();
    }

    /// Rolls local visual feedback back after a failed try-do, so the scene
    /// matches the untouched backend again.
    pub fn rollback_failed_command(&mut self, command: &dyn UndoableCommand) {
        if let Some(cmd) = command.as_any().downcast_ref::<PartsPositionsCommand>() {
            for (part, old, _) in cmd.moves() {
                if let Some(item) = self.part_items.get(part)
                    && let Some(AnyItem::Part(e)) = self.items.get(item)
                {
                    e.write().set_position(*old);
                }
            }
        }
        // Waypoint moves restore through the same path.
        if let Some(cmd) = command.as_any().downcast_ref::<MoveWaypointsCommand>() {
            for (waypoint, old, _) in cmd.moves() {
                if let Some(item) = self.waypoint_items.get(waypoint)
                    && let Some(AnyItem::Waypoint(e)) = self.items.get(item)
                {
                    e.write().set_position(*old);
                }
            }
        }
    }

    /// Applies one backend change notification. Safe to call between any two
    /// input events; any in-flight gesture referencing a removed item is
    /// cancelled before the item goes away.
    pub fn apply_notification(&mut self, notification: Notification) {
        match notification {
            Notification::PartAdded {
                part,
                parent,
                name,
                position,
                size,
            } => {
                if parent != self.actor || self.part_items.contains_key(&part) {
                    return;
                }
                let id = self.ids.next();
                let rect = egui::Rect::from_min_size(position, size);
                self.insert_item(AnyItem::from(ERef::new(PartItem::new(id, part, name, rect))));
                self.part_items.insert(part, id);
                self.notices.push(SceneNotice::PartItemAdded(part));
                self.content_changed();
            }
            Notification::PartRemoved { part } => {
                if let Some(item) = self.part_items.get(&part).copied() {
                    self.remove_item(item);
                    self.content_changed();
                }
            }
            Notification::PortAdded {
                port,
                part,
                side,
                row,
                ifx_level,
            } => {
                let Some(owner_item) = self.part_items.get(&part).copied() else {
                    return;
                };
                if self.port_items.contains_key(&port) {
                    return;
                }
                let owner_rect = self
                    .items
                    .get(&owner_item)
                    .map(|e| e.bounding_rect())
                    .unwrap_or(egui::Rect::ZERO);
                let id = self.ids.next();
                self.insert_item(AnyItem::from(ERef::new(IfxPortItem::new(
                    id,
                    port,
                    part,
                    side,
                    row,
                    ifx_level,
                    port_rect(owner_rect, side, row),
                ))));
                self.port_items.insert(port, id);
                self.content_changed();
                self.tick_tracker();
            }
            Notification::PortRemoved { port } => {
                if let Some(item) = self.port_items.get(&port).copied() {
                    self.remove_item(item);
                    self.content_changed();
                }
            }
            Notification::LinkAdded {
                link,
                source,
                target,
                name,
                waypoints,
            } => {
                if self.links.contains_key(&link) {
                    return;
                }
                let (Some(source_item), Some(target_item)) = (
                    self.find_link_endpoint_item(source),
                    self.find_link_endpoint_item(target),
                ) else {
                    // Not both endpoints visible in this sub-scene.
                    return;
                };
                let mut waypoint_items = Vec::with_capacity(waypoints.len());
                for (waypoint, position) in waypoints {
                    let id = self.ids.next();
                    self.insert_item(AnyItem::from(ERef::new(WaypointItem::new(
                        id, waypoint, link, position,
                    ))));
                    self.waypoint_items.insert(waypoint, id);
                    waypoint_items.push(id);
                }
                let link_item = self.ids.next();
                let obj = LinkObject::new(
                    link_item,
                    link,
                    source,
                    target,
                    name,
                    source_item,
                    target_item,
                    waypoint_items,
                    self.settings.declutter_length,
                );
                self.links.insert(link, obj);
                self.link_items.insert(link_item, link);
                self.content_changed();
            }
            Notification::LinkRemoved { link } => {
                self.remove_link(link);
                self.content_changed();
            }
            Notification::WaypointAdded {
                link,
                waypoint,
                index,
                position,
            } => {
                if !self.links.contains_key(&link) || self.waypoint_items.contains_key(&waypoint)
                {
                    return;
                }
                let id = self.ids.next();
                let mut item = WaypointItem::new(id, waypoint, link, position);
                item.decluttered = self.links[&link].is_decluttered();
                self.insert_item(AnyItem::from(ERef::new(item)));
                self.waypoint_items.insert(waypoint, id);
                if let Some(obj) = self.links.get_mut(&link) {
                    obj.insert_waypoint(index, id);
                }
                self.content_changed();
            }
            Notification::WaypointRemoved { link, waypoint } => {
                let Some(item) = self.waypoint_items.get(&waypoint).copied() else {
                    return;
                };
                if let Some(obj) = self.links.get_mut(&link) {
                    obj.remove_waypoint_item(item);
                }
                self.remove_item(item);
                self.content_changed();
            }
            Notification::NameChanged { part, name } => {
                if let Some(AnyItem::Part(e)) =
                    self.part_items.get(&part).and_then(|i| self.items.get(i))
                {
                    e.write().name = name;
                }
            }
            Notification::PositionChanged { part, position } => {
                if let Some(AnyItem::Part(e)) =
                    self.part_items.get(&part).and_then(|i| self.items.get(i))
                {
                    e.write().set_position(position);
                }
            }
            Notification::SizeChanged { part, size } => {
                if let Some(AnyItem::Part(e)) =
                    self.part_items.get(&part).and_then(|i| self.items.get(i))
                {
                    e.write().set_size(size);
                }
            }
            Notification::WaypointMoved { waypoint, position } => {
                if let Some(AnyItem::Waypoint(e)) = self
                    .waypoint_items
                    .get(&waypoint)
                    .and_then(|i| self.items.get(i))
                {
                    e.write().set_position(position);
                }
            }
            Notification::DeclutterChanged { link, declutter } => {
                if let Some(obj) = self.links.get_mut(&link) {
                    obj.set_decluttered(declutter);
                    for item in obj.waypoint_items().to_vec() {
                        if let Some(AnyItem::Waypoint(e)) = self.items.get(&item) {
                            e.write().decluttered = declutter;
                        }
                    }
                }
            }
            Notification::IfxLevelChanged { port, level } => {
                if let Some(AnyItem::IfxPort(e)) =
                    self.port_items.get(&port).and_then(|i| self.items.get(i))
                {
                    e.write().ifx_level = level;
                }
            }
            Notification::TargetChanged { link, target } => {
                let Some(target_item) = self.find_link_endpoint_item(target) else {
                    // The new endpoint lives in another sub-scene; the link
                    // no longer renders here.
                    self.remove_link(link);
                    self.content_changed();
                    return;
                };
                if let Some(obj) = self.links.get_mut(&link) {
                    obj.set_target(target, target_item);
                }
            }
            Notification::PortPlacementChanged { port, side, row } => {
                let owner_rect = match self
                    .port_items
                    .get(&port)
                    .and_then(|i| self.items.get(i))
                {
                    Some(AnyItem::IfxPort(e)) => self
                        .part_items
                        .get(&e.read().owner)
                        .and_then(|i| self.items.get(i))
                        .map(|o| o.bounding_rect()),
                    _ => None,
                };
                if let (Some(AnyItem::IfxPort(e)), Some(owner_rect)) = (
                    self.port_items.get(&port).and_then(|i| self.items.get(i)),
                    owner_rect,
                ) {
                    e.write()
                        .set_placement(side, row, port_rect(owner_rect, side, row));
                }
            }
        }
    }

    // ---- internals -------------------------------------------------------

    fn apply_effects(
        &mut self,
        effects: Vec<Effect>,
        stack: &mut CommandStack,
        backend: &mut BackendHandle,
        viewport: ViewportContext,
    ) {
        for effect in effects {
            match effect {
                Effect::PushCommand(request) => self.push_command(request, stack, backend, viewport),
                other => self.apply_one_visual(other),
            }
        }
    }

    fn apply_visual_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            if let Effect::PushCommand(request) = &effect {
                log::error!("command {:?} dropped outside input handling", request);
                continue;
            }
            self.apply_one_visual(effect);
        }
    }

    fn apply_one_visual(&mut self, effect: Effect) {
        match effect {
            Effect::ReplaceSelection(items) => self.set_selection(items),
            Effect::ExtendSelection(item) => {
                self.set_item_selected(item, true);
                self.selection.add(item);
                self.emit_selection_changed();
            }
            Effect::RemoveFromSelection(item) => {
                self.set_item_selected(item, false);
                self.selection.remove(item);
                self.emit_selection_changed();
            }
            Effect::ClearSelection => self.set_selection(Vec::new()),
            Effect::SetPendingDelete { item, on } => {
                if let Some(link) = self.link_items.get(&item) {
                    if let Some(obj) = self.links.get_mut(link) {
                        obj.highlight.pending_delete = on;
                    }
                } else if let Some(any) = self.items.get(&item) {
                    any.with_highlight(|h| h.pending_delete = on);
                }
            }
            Effect::SetLinkTargetHighlight { item, on } => {
                if let Some(any) = self.items.get(&item) {
                    any.with_highlight(|h| h.link_target = on);
                }
            }
            Effect::DeleteCursor(state) => self.delete_cursor = state,
            Effect::ShowTargetMarker { rect, state } => self.show_target_marker(rect, state),
            Effect::ShowRubberLine { from, to } => self.show_rubber_line(from, to),
            Effect::DropWaypointMarker { from, pos } => {
                let dot = self.ids.next();
                self.insert_item(AnyItem::from(ERef::new(MarkerItem::new(
                    dot,
                    MarkerShape::WaypointDot,
                    egui::Rect::from_center_size(pos, egui::Vec2::splat(PORT_SIZE)),
                ))));
                self.transients.push(dot);
                let line = self.ids.next();
                self.insert_item(AnyItem::from(ERef::new(MarkerItem::new(
                    line,
                    MarkerShape::Line { from, to: pos },
                    egui::Rect::from_two_pos(from, pos),
                ))));
                self.transients.push(line);
            }
            Effect::ShowRubberBand { rect } => self.rubber_band = Some(rect),
            Effect::HideRubberBand => self.rubber_band = None,
            Effect::DisposeTransients => self.dispose_transients(),
            Effect::TranslateSelection { delta } => {
                for item in self.selection.ids().to_vec() {
                    if let Some(any) = self.items.get(&item) {
                        any.translate(delta);
                    }
                }
            }
            Effect::PushCommand(..) => {}
        }
    }

    fn push_command(
        &mut self,
        request: CommandRequest,
        stack: &mut CommandStack,
        backend: &mut BackendHandle,
        viewport: ViewportContext,
    ) {
        let command: Box<dyn UndoableCommand> = match request {
            CommandRequest::MoveParts { moves } => Box::new(PartsPositionsCommand::new(moves)),
            CommandRequest::MoveWaypoints { moves } => Box::new(MoveWaypointsCommand::new(moves)),
            CommandRequest::CreateLink {
                source,
                target,
                waypoints,
            } => Box::new(CreateLinkCommand::new(source, target, waypoints)),
            CommandRequest::RetargetLink {
                link,
                old_target,
                new_target,
            } => Box::new(RetargetLinkCommand::new(link, old_target, new_target)),
            CommandRequest::RemoveLink(link) => Box::new(RemoveLinkCommand::new(link)),
            CommandRequest::RemoveWaypoint { link, waypoint } => {
                Box::new(RemoveWaypointCommand::new(link, waypoint))
            }
        };
        stack.push(command, viewport, backend);
    }

    fn show_target_marker(&mut self, rect: egui::Rect, state: MarkerState) {
        if let Some(AnyItem::Marker(e)) = self
            .target_marker
            .and_then(|id| self.items.get(&id))
        {
            e.write().move_to(rect, Some(state));
            return;
        }
        let id = self.ids.next();
        self.insert_item(AnyItem::from(ERef::new(MarkerItem::new(
            id,
            MarkerShape::Target { state },
            rect,
        ))));
        self.transients.push(id);
        self.target_marker = Some(id);
    }

    fn show_rubber_line(&mut self, from: egui::Pos2, to: egui::Pos2) {
        if let Some(AnyItem::Marker(e)) = self.rubber_line.and_then(|id| self.items.get(&id)) {
            e.write().set_line(from, to);
            return;
        }
        let id = self.ids.next();
        self.insert_item(AnyItem::from(ERef::new(MarkerItem::new(
            id,
            MarkerShape::Line { from, to },
            egui::Rect::from_two_pos(from, to),
        ))));
        self.transients.push(id);
        self.rubber_line = Some(id);
    }

    fn set_item_selected(&mut self, item: ItemId, on: bool) {
        if let Some(any) = self.items.get(&item) {
            any.with_highlight(|h| h.selected = on);
        }
    }

    fn set_selection(&mut self, items: Vec<ItemId>) {
        for item in self.selection.ids().to_vec() {
            self.set_item_selected(item, false);
        }
        let items: Vec<ItemId> = items
            .into_iter()
            .filter(|e| self.items.get(e).is_some_and(|a| !a.is_disposed()))
            .collect();
        for item in &items {
            self.set_item_selected(*item, true);
        }
        self.selection.set(items);
        self.emit_selection_changed();
    }

    fn emit_selection_changed(&mut self) {
        self.notices.push(SceneNotice::SelectionChanged);
        let view = scene_view!(self);
        self.machine.selection_changed(&view);
    }

    /// Item-add choke point.
    fn insert_item(&mut self, item: AnyItem) {
        let id = item.id();
        self.items.insert(id, item);
        self.order.push(id);
    }

    /// Item-remove choke point: disposal and every map stay in step, and the
    /// state machine drops any reference to the item.
    fn remove_item(&mut self, item: ItemId) {
        if let Some(any) = self.items.remove(&item) {
            any.dispose();
            match &any {
                AnyItem::Part(e) => {
                    self.part_items.remove(&e.read().part);
                }
                AnyItem::IfxPort(e) => {
                    self.port_items.remove(&e.read().port);
                }
                AnyItem::Waypoint(e) => {
                    self.waypoint_items.remove(&e.read().waypoint);
                }
                _ => {}
            }
        }
        self.order.retain(|e| *e != item);
        self.transients.retain(|e| *e != item);
        let effects = self.machine.invalidate_item(item);
        self.apply_visual_effects(effects);
        if self.selection.remove(item) {
            self.emit_selection_changed();
        }
    }

    fn remove_link(&mut self, link: LinkId) {
        let Some(mut obj) = self.links.remove(&link) else {
            return;
        };
        obj.dispose();
        self.link_items.remove(&obj.item());
        let effects = self.machine.invalidate_item(obj.item());
        self.apply_visual_effects(effects);
        for item in obj.waypoint_items().to_vec() {
            self.remove_item(item);
        }
    }

    fn dispose_transients(&mut self) {
        for item in std::mem::take(&mut self.transients) {
            if let Some(any) = self.items.remove(&item) {
                any.dispose();
            }
            self.order.retain(|e| *e != item);
        }
        self.target_marker = None;
        self.rubber_line = None;
    }

    fn content_changed(&mut self) {
        let effects = {
            let view = scene_view!(self);
            self.machine.scene_content_changed(self.cursor, &view)
        };
        self.apply_visual_effects(effects);
    }

    fn tick_tracker(&mut self) {
        let port_items = &self.port_items;
        match self.tracker.tick(|port| port_items.contains_key(&port)) {
            TrackerTick::Resolved(port) => {
                if let Some(item) = self.port_items.get(&port).copied() {
                    self.set_selection(vec![item]);
                    self.notices.push(SceneNotice::ShowIfxPort(port));
                }
            }
            TrackerTick::Idle | TrackerTick::Pending | TrackerTick::Exhausted(_) => {}
        }
    }
}

fn port_rect(owner: egui::Rect, side: PortSide, row: i32) -> egui::Rect {
    let y = owner.top() + 10.0 + row as f32 * PORT_SPACING;
    let x = match side {
        PortSide::Left => owner.left() - PORT_SIZE / 2.0,
        PortSide::Right => owner.right() - PORT_SIZE / 2.0,
    };
    egui::Rect::from_min_size(egui::Pos2::new(x, y), egui::Vec2::splat(PORT_SIZE))
}
