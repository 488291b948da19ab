use eframe::egui;

use crate::backend::api::LinkEndpoint;
use crate::common::config::Settings;
use crate::common::geometry;
use crate::common::ids::{ItemId, LinkId, PartId, WaypointId};
use crate::scene::item::{AnchorInfo, ItemKind, MarkerState, link_allowed_between};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ModifierKeys {
    pub alt: bool,
    pub command: bool, // mac_cmd || win_ctrl || linux_ctrl
    pub shift: bool,
}

impl ModifierKeys {
    pub const NONE: Self = Self {
        alt: false,
        command: false,
        shift: false,
    };
    pub const COMMAND: Self = Self {
        alt: false,
        command: true,
        shift: false,
    };
    pub const SHIFT: Self = Self {
        alt: false,
        command: false,
        shift: true,
    };

    pub fn from_egui(source: &egui::Modifiers) -> Self {
        Self {
            alt: source.alt,
            command: source.command,
            shift: source.shift,
        }
    }

    /// The quick-delete chord.
    pub fn is_delete_chord(&self) -> bool {
        self.command && self.shift
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Key {
    Escape,
    Control,
    Shift,
    Other,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum InputEvent {
    MouseDown {
        pos: egui::Pos2,
        button: MouseButton,
        modifiers: ModifierKeys,
    },
    MouseMove {
        pos: egui::Pos2,
        modifiers: ModifierKeys,
    },
    MouseUp {
        pos: egui::Pos2,
        button: MouseButton,
        modifiers: ModifierKeys,
    },
    KeyDown {
        key: Key,
        modifiers: ModifierKeys,
    },
    KeyUp {
        key: Key,
        modifiers: ModifierKeys,
    },
}

/// Scene-side queries the machine needs. A trait so transitions are testable
/// against a stub.
pub trait SceneProbe {
    fn item_kind(&self, item: ItemId) -> Option<ItemKind>;
    fn item_rect(&self, item: ItemId) -> Option<egui::Rect>;
    /// Scenario-space position used by move commands.
    fn item_position(&self, item: ItemId) -> Option<egui::Pos2>;
    /// Topmost interactive item under the cursor (transient markers excluded).
    fn item_at(&self, pos: egui::Pos2) -> Option<ItemId>;
    /// Items wholly inside `rect`, in encounter order.
    fn items_contained_in(&self, rect: egui::Rect) -> Vec<ItemId>;
    /// Items whose bounds intersect `rect`, in encounter order.
    fn items_intersecting(&self, rect: egui::Rect) -> Vec<ItemId>;
    fn anchor_info(&self, item: ItemId) -> Option<AnchorInfo>;
    /// Whether a link from `source`'s endpoint to `target`'s endpoint already
    /// exists.
    fn has_direct_link(&self, source: ItemId, target: ItemId) -> bool;
    fn is_disposed(&self, item: ItemId) -> bool;
    fn selection(&self) -> Vec<ItemId>;
    fn part_of_item(&self, item: ItemId) -> Option<PartId>;
    fn waypoint_of_item(&self, item: ItemId) -> Option<(LinkId, WaypointId)>;
    fn link_of_item(&self, item: ItemId) -> Option<LinkId>;
}

/// Undoable mutations the machine asks for; the scene turns these into
/// concrete commands on the stack.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandRequest {
    MoveParts {
        moves: Vec<(PartId, egui::Pos2, egui::Pos2)>,
    },
    MoveWaypoints {
        moves: Vec<(WaypointId, egui::Pos2, egui::Pos2)>,
    },
    CreateLink {
        source: LinkEndpoint,
        target: LinkEndpoint,
        waypoints: Vec<egui::Pos2>,
    },
    RetargetLink {
        link: LinkId,
        old_target: LinkEndpoint,
        new_target: LinkEndpoint,
    },
    RemoveLink(LinkId),
    RemoveWaypoint {
        link: LinkId,
        waypoint: WaypointId,
    },
}

/// Side effects of a transition, applied by the scene after the state has
/// settled.
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    ReplaceSelection(Vec<ItemId>),
    ExtendSelection(ItemId),
    RemoveFromSelection(ItemId),
    ClearSelection,
    SetPendingDelete { item: ItemId, on: bool },
    SetLinkTargetHighlight { item: ItemId, on: bool },
    /// `Some(deletable)` overrides the cursor in deletion mode, `None`
    /// restores it.
    DeleteCursor(Option<bool>),
    ShowTargetMarker { rect: egui::Rect, state: MarkerState },
    ShowRubberLine { from: egui::Pos2, to: egui::Pos2 },
    DropWaypointMarker { from: egui::Pos2, pos: egui::Pos2 },
    ShowRubberBand { rect: egui::Rect },
    HideRubberBand,
    DisposeTransients,
    TranslateSelection { delta: egui::Vec2 },
    PushCommand(CommandRequest),
}

/// In-progress link creation. Owns the transient aids by proxy: the effects
/// spawn/update them, `DisposeTransients` tears them down.
#[derive(Clone, Debug, PartialEq)]
pub struct LinkGesture {
    pub source: ItemId,
    pub source_endpoint: LinkEndpoint,
    /// Origin of the rubber line: the source anchor, or the last placed
    /// waypoint.
    pub line_from: egui::Pos2,
    pub waypoints: Vec<egui::Pos2>,
    pub hover: Option<ItemId>,
    pub marker: MarkerState,
    prev: Box<SceneState>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetargetGesture {
    pub link: LinkId,
    /// The link's logical origin; validity is checked against this, not the
    /// dragged line.
    pub source: ItemId,
    pub source_endpoint: LinkEndpoint,
    pub old_target: LinkEndpoint,
    pub line_from: egui::Pos2,
    pub hover: Option<ItemId>,
    pub marker: MarkerState,
    prev: Box<SceneState>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SceneState {
    Idle,
    ItemSelected {
        item: ItemId,
        press_modifiers: ModifierKeys,
    },
    ManyPartsSelected,
    ManyWaypointsSelected,
    RubberBand {
        origin: egui::Pos2,
        current: egui::Pos2,
        locked_kind: Option<ItemKind>,
    },
    DefaultSceneInteract {
        prev: Box<SceneState>,
    },
    MovingParts {
        saved: Vec<(ItemId, egui::Pos2)>,
        last: egui::Pos2,
        prev: Box<SceneState>,
    },
    MovingWaypoints {
        saved: Vec<(ItemId, egui::Pos2)>,
        last: egui::Pos2,
        prev: Box<SceneState>,
    },
    MovingProxy {
        saved: (ItemId, egui::Pos2),
        last: egui::Pos2,
        prev: Box<SceneState>,
    },
    ObjInteraction {
        prev: Box<SceneState>,
    },
    CreatingLink(LinkGesture),
    RetargetingLink(RetargetGesture),
    ClickDelete {
        prev: Box<SceneState>,
        candidate: Option<ItemId>,
    },
}

/// Which kinds the active state lets into the selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectableKinds {
    AnySelectable,
    Only(ItemKind),
    None,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum SelectDecision {
    Replace,
    Extend,
    Reject,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct PressTracking {
    pos: egui::Pos2,
    button: MouseButton,
    over: Option<ItemId>,
    modifiers: ModifierKeys,
    dragging: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FsmConfig {
    pub marker_half_extent: f32,
    pub drag_threshold: f32,
}

impl From<&Settings> for FsmConfig {
    fn from(s: &Settings) -> Self {
        Self {
            marker_half_extent: s.marker_half_extent,
            drag_threshold: s.drag_threshold,
        }
    }
}

/// The single owner of "what does a raw input event mean right now".
///
/// Exactly one [`SceneState`] is active; every transition consumes the old
/// state and produces the new one plus the effects the scene must apply.
/// Event dispatch is single-threaded and runs to completion, so transitions
/// are atomic with respect to input.
pub struct SceneStateMachine {
    state: SceneState,
    config: FsmConfig,
    press: Option<PressTracking>,
}

impl SceneStateMachine {
    pub fn new(config: FsmConfig) -> Self {
        Self {
            state: SceneState::Idle,
            config,
            press: None,
        }
    }

    pub fn state(&self) -> &SceneState {
        &self.state
    }

    pub fn selectable_kinds(&self) -> SelectableKinds {
        match &self.state {
            SceneState::Idle | SceneState::ItemSelected { .. } => SelectableKinds::AnySelectable,
            SceneState::ManyPartsSelected => SelectableKinds::Only(ItemKind::Part),
            SceneState::ManyWaypointsSelected => SelectableKinds::Only(ItemKind::Waypoint),
            SceneState::RubberBand { locked_kind, .. } => match locked_kind {
                Some(kind) => SelectableKinds::Only(*kind),
                None => SelectableKinds::AnySelectable,
            },
            SceneState::MovingParts { .. } => SelectableKinds::Only(ItemKind::Part),
            SceneState::MovingWaypoints { .. } => SelectableKinds::Only(ItemKind::Waypoint),
            SceneState::MovingProxy { .. } => SelectableKinds::Only(ItemKind::ParentProxy),
            SceneState::DefaultSceneInteract { .. }
            | SceneState::ObjInteraction { .. }
            | SceneState::CreatingLink(..)
            | SceneState::RetargetingLink(..)
            | SceneState::ClickDelete { .. } => SelectableKinds::None,
        }
    }

    /// Feeds one raw input event through the machine. Returns whether the
    /// event was consumed; a declined event falls through to default canvas
    /// handling (panning and the like).
    pub fn handle_event(
        &mut self,
        event: InputEvent,
        probe: &dyn SceneProbe,
    ) -> (bool, Vec<Effect>) {
        let mut drag_started = false;
        match event {
            InputEvent::MouseDown {
                pos,
                button,
                modifiers,
            } => {
                self.press = Some(PressTracking {
                    pos,
                    button,
                    over: probe.item_at(pos),
                    modifiers,
                    dragging: false,
                });
            }
            InputEvent::MouseMove { pos, .. } => {
                if let Some(p) = &mut self.press
                    && !p.dragging
                    && p.pos.distance(pos) >= self.config.drag_threshold
                {
                    p.dragging = true;
                    drag_started = true;
                }
            }
            _ => {}
        }
        let released = match event {
            InputEvent::MouseUp { .. } => self.press.take(),
            _ => None,
        };

        let mut effects = Vec::new();
        let state = std::mem::replace(&mut self.state, SceneState::Idle);
        let (next, consumed) = self.transition(
            state,
            event,
            drag_started,
            released,
            probe,
            &mut effects,
        );
        self.state = next;
        (consumed, effects)
    }

    fn transition(
        &mut self,
        state: SceneState,
        event: InputEvent,
        drag_started: bool,
        released: Option<PressTracking>,
        probe: &dyn SceneProbe,
        effects: &mut Vec<Effect>,
    ) -> (SceneState, bool) {
        match state {
            SceneState::Idle
            | SceneState::ItemSelected { .. }
            | SceneState::ManyPartsSelected
            | SceneState::ManyWaypointsSelected => {
                self.steady_transition(state, event, drag_started, released, probe, effects)
            }
            SceneState::RubberBand {
                origin,
                current,
                locked_kind,
            } => self.rubber_band_transition(origin, current, locked_kind, event, probe, effects),
            SceneState::DefaultSceneInteract { prev } => match event {
                InputEvent::MouseUp { .. } => (*prev, false),
                _ => (SceneState::DefaultSceneInteract { prev }, false),
            },
            SceneState::MovingParts { saved, last, prev } => {
                self.moving_transition(MovingKind::Parts, saved, last, prev, event, probe, effects)
            }
            SceneState::MovingWaypoints { saved, last, prev } => self.moving_transition(
                MovingKind::Waypoints,
                saved,
                last,
                prev,
                event,
                probe,
                effects,
            ),
            SceneState::MovingProxy { saved, last, prev } => self.moving_transition(
                MovingKind::Proxy,
                vec![saved],
                last,
                prev,
                event,
                probe,
                effects,
            ),
            SceneState::ObjInteraction { prev } => {
                // Hands off: an external widget owns input until it calls
                // end_interaction.
                (SceneState::ObjInteraction { prev }, false)
            }
            SceneState::CreatingLink(gesture) => {
                self.link_creation_transition(gesture, event, probe, effects)
            }
            SceneState::RetargetingLink(gesture) => {
                self.retargeting_transition(gesture, event, probe, effects)
            }
            SceneState::ClickDelete { prev, candidate } => {
                self.click_delete_transition(prev, candidate, event, probe, effects)
            }
        }
    }

    fn steady_transition(
        &mut self,
        state: SceneState,
        event: InputEvent,
        drag_started: bool,
        released: Option<PressTracking>,
        probe: &dyn SceneProbe,
        effects: &mut Vec<Effect>,
    ) -> (SceneState, bool) {
        match event {
            InputEvent::KeyDown { modifiers, .. } if modifiers.is_delete_chord() => {
                return self.try_enter_click_delete(state, probe, effects);
            }
            InputEvent::MouseDown {
                pos,
                button: MouseButton::Left,
                modifiers,
            } => {
                if modifiers == ModifierKeys::SHIFT {
                    effects.push(Effect::ShowRubberBand {
                        rect: egui::Rect::from_two_pos(pos, pos),
                    });
                    return (
                        SceneState::RubberBand {
                            origin: pos,
                            current: pos,
                            locked_kind: None,
                        },
                        true,
                    );
                }
                let over = self.press.as_ref().and_then(|p| p.over);
                let next = match state {
                    SceneState::ItemSelected { item, .. } => SceneState::ItemSelected {
                        item,
                        press_modifiers: modifiers,
                    },
                    other => other,
                };
                // A press over an item is claimed (it may become an item
                // drag); a press over empty canvas stays with the canvas.
                return (next, over.is_some());
            }
            InputEvent::MouseMove { pos, .. } if drag_started => {
                let Some(press) = self.press else {
                    return (state, false);
                };
                if press.button != MouseButton::Left {
                    return (state, false);
                }
                let selection = probe.selection();
                let over_selected = press
                    .over
                    .is_some_and(|o| selection.contains(&o) && !probe.is_disposed(o));
                if !over_selected {
                    return (SceneState::DefaultSceneInteract { prev: Box::new(state) }, false);
                }
                let kind = press.over.and_then(|o| probe.item_kind(o));
                let moving_kind = match kind {
                    Some(ItemKind::Part) => MovingKind::Parts,
                    Some(ItemKind::Waypoint) => MovingKind::Waypoints,
                    Some(ItemKind::ParentProxy) => MovingKind::Proxy,
                    _ => {
                        return (
                            SceneState::DefaultSceneInteract { prev: Box::new(state) },
                            false,
                        );
                    }
                };
                let saved: Vec<(ItemId, egui::Pos2)> = selection
                    .iter()
                    .filter(|e| probe.item_kind(**e) == Some(moving_kind.item_kind()))
                    .filter_map(|e| probe.item_position(*e).map(|p| (*e, p)))
                    .collect();
                if saved.is_empty() {
                    return (state, false);
                }
                effects.push(Effect::TranslateSelection {
                    delta: pos - press.pos,
                });
                let prev = Box::new(state);
                let next = match moving_kind {
                    MovingKind::Parts => SceneState::MovingParts {
                        saved,
                        last: pos,
                        prev,
                    },
                    MovingKind::Waypoints => SceneState::MovingWaypoints {
                        saved,
                        last: pos,
                        prev,
                    },
                    MovingKind::Proxy => SceneState::MovingProxy {
                        saved: saved[0],
                        last: pos,
                        prev,
                    },
                };
                return (next, true);
            }
            InputEvent::MouseUp {
                button: MouseButton::Left,
                ..
            } => {
                let Some(press) = released else {
                    return (state, false);
                };
                if press.dragging {
                    return (state, false);
                }
                let press_modifiers = press.modifiers;
                let Some(over) = press.over else {
                    effects.push(Effect::ClearSelection);
                    return (state, true);
                };
                match self.check_item_selectable(over, press_modifiers, probe) {
                    SelectDecision::Replace => {
                        effects.push(Effect::ReplaceSelection(vec![over]));
                    }
                    SelectDecision::Extend => {
                        if probe.selection().contains(&over) {
                            effects.push(Effect::RemoveFromSelection(over));
                        } else {
                            effects.push(Effect::ExtendSelection(over));
                        }
                    }
                    SelectDecision::Reject => {
                        log::debug!("click on {} rejected by selection gate", over);
                    }
                }
                return (state, true);
            }
            _ => {}
        }
        (state, false)
    }

    /// The selection gate: decides whether a click replaces, extends or is
    /// rejected, and is also what locks the rubber-band kind.
    fn check_item_selectable(
        &self,
        item: ItemId,
        modifiers: ModifierKeys,
        probe: &dyn SceneProbe,
    ) -> SelectDecision {
        let Some(kind) = probe.item_kind(item) else {
            return SelectDecision::Reject;
        };
        if !kind.ever_selectable() || probe.is_disposed(item) {
            return SelectDecision::Reject;
        }
        if modifiers == ModifierKeys::NONE {
            return SelectDecision::Replace;
        }
        if modifiers == ModifierKeys::COMMAND {
            let selection = probe.selection();
            if selection.is_empty() {
                return SelectDecision::Replace;
            }
            let same_kind = selection
                .iter()
                .all(|e| probe.item_kind(*e) == Some(kind));
            if same_kind && kind.multi_selectable() {
                return SelectDecision::Extend;
            }
            return SelectDecision::Reject;
        }
        SelectDecision::Reject
    }

    fn rubber_band_transition(
        &mut self,
        origin: egui::Pos2,
        _current: egui::Pos2,
        mut locked_kind: Option<ItemKind>,
        event: InputEvent,
        probe: &dyn SceneProbe,
        effects: &mut Vec<Effect>,
    ) -> (SceneState, bool) {
        match event {
            InputEvent::MouseMove { pos, .. } => {
                let rect = egui::Rect::from_two_pos(origin, pos);
                if locked_kind.is_none() {
                    // First accepted item decides the kind for the whole
                    // gesture.
                    locked_kind = probe
                        .items_contained_in(rect)
                        .into_iter()
                        .filter(|e| !probe.is_disposed(*e))
                        .filter_map(|e| probe.item_kind(e))
                        .find(|k| k.ever_selectable() && k.multi_selectable());
                }
                effects.push(Effect::ShowRubberBand { rect });
                (
                    SceneState::RubberBand {
                        origin,
                        current: pos,
                        locked_kind,
                    },
                    true,
                )
            }
            InputEvent::MouseUp { pos, .. } => {
                effects.push(Effect::HideRubberBand);
                let rect = egui::Rect::from_two_pos(origin, pos);
                let accepted: Vec<ItemId> = match locked_kind {
                    Some(kind) => probe
                        .items_contained_in(rect)
                        .into_iter()
                        .filter(|e| !probe.is_disposed(*e))
                        .filter(|e| probe.item_kind(*e) == Some(kind))
                        .collect(),
                    None => Vec::new(),
                };
                // The gesture classifies its own result by size and locked
                // kind; the selection-changed round trip then re-confirms it.
                let next = match accepted.as_slice() {
                    [] => {
                        effects.push(Effect::ClearSelection);
                        SceneState::Idle
                    }
                    [single] => {
                        let item = *single;
                        effects.push(Effect::ReplaceSelection(accepted));
                        SceneState::ItemSelected {
                            item,
                            press_modifiers: ModifierKeys::NONE,
                        }
                    }
                    _ => {
                        effects.push(Effect::ReplaceSelection(accepted));
                        match locked_kind {
                            Some(ItemKind::Waypoint) => SceneState::ManyWaypointsSelected,
                            _ => SceneState::ManyPartsSelected,
                        }
                    }
                };
                (next, true)
            }
            InputEvent::KeyDown {
                key: Key::Escape, ..
            } => {
                effects.push(Effect::HideRubberBand);
                (
                    self.classify_selection(probe).unwrap_or(SceneState::Idle),
                    true,
                )
            }
            _ => (
                SceneState::RubberBand {
                    origin,
                    current: _current,
                    locked_kind,
                },
                true,
            ),
        }
    }

    fn moving_transition(
        &mut self,
        kind: MovingKind,
        saved: Vec<(ItemId, egui::Pos2)>,
        last: egui::Pos2,
        prev: Box<SceneState>,
        event: InputEvent,
        probe: &dyn SceneProbe,
        effects: &mut Vec<Effect>,
    ) -> (SceneState, bool) {
        match event {
            InputEvent::MouseMove { pos, .. } => {
                effects.push(Effect::TranslateSelection { delta: pos - last });
                (kind.state(saved, pos, prev), true)
            }
            InputEvent::MouseUp { .. } => {
                let request = match kind {
                    MovingKind::Parts | MovingKind::Proxy => CommandRequest::MoveParts {
                        moves: saved
                            .iter()
                            .filter(|(item, _)| !probe.is_disposed(*item))
                            .filter_map(|(item, old)| {
                                let part = probe.part_of_item(*item)?;
                                let new = probe.item_position(*item).unwrap_or(*old);
                                Some((part, *old, new))
                            })
                            .collect(),
                    },
                    MovingKind::Waypoints => CommandRequest::MoveWaypoints {
                        moves: saved
                            .iter()
                            .filter(|(item, _)| !probe.is_disposed(*item))
                            .filter_map(|(item, old)| {
                                let (_, waypoint) = probe.waypoint_of_item(*item)?;
                                let new = probe.item_position(*item).unwrap_or(*old);
                                Some((waypoint, *old, new))
                            })
                            .collect(),
                    },
                };
                let nonempty = match &request {
                    CommandRequest::MoveParts { moves } => !moves.is_empty(),
                    CommandRequest::MoveWaypoints { moves } => !moves.is_empty(),
                    _ => false,
                };
                if nonempty {
                    effects.push(Effect::PushCommand(request));
                }
                (*prev, true)
            }
            _ => (kind.state(saved, last, prev), true),
        }
    }

    fn link_creation_transition(
        &mut self,
        mut gesture: LinkGesture,
        event: InputEvent,
        probe: &dyn SceneProbe,
        effects: &mut Vec<Effect>,
    ) -> (SceneState, bool) {
        match event {
            InputEvent::MouseMove { pos, .. } => {
                self.update_link_target(&mut gesture, pos, probe, effects);
                (SceneState::CreatingLink(gesture), true)
            }
            InputEvent::MouseDown {
                button: MouseButton::Right,
                ..
            } => (SceneState::CreatingLink(gesture), true),
            InputEvent::MouseUp {
                button: MouseButton::Right,
                ..
            }
            | InputEvent::KeyDown {
                key: Key::Escape, ..
            } => (self.abort_gesture(gesture.hover, *gesture.prev, effects), true),
            InputEvent::MouseDown {
                pos,
                button: MouseButton::Left,
                ..
            } => {
                match (gesture.marker, gesture.hover) {
                    (MarkerState::ValidTarget, Some(target)) => {
                        let target_endpoint = probe
                            .anchor_info(target)
                            .and_then(|a| a.endpoint);
                        let Some(target_endpoint) = target_endpoint else {
                            return (SceneState::CreatingLink(gesture), true);
                        };
                        effects.push(Effect::SetLinkTargetHighlight {
                            item: target,
                            on: false,
                        });
                        effects.push(Effect::PushCommand(CommandRequest::CreateLink {
                            source: gesture.source_endpoint,
                            target: target_endpoint,
                            waypoints: gesture.waypoints.clone(),
                        }));
                        effects.push(Effect::DisposeTransients);
                        (*gesture.prev, true)
                    }
                    (MarkerState::AddWaypoint, _) => {
                        // Blank canvas: drop a bend point and start the next
                        // segment from it.
                        effects.push(Effect::DropWaypointMarker {
                            from: gesture.line_from,
                            pos,
                        });
                        gesture.waypoints.push(pos);
                        gesture.line_from = pos;
                        (SceneState::CreatingLink(gesture), true)
                    }
                    // A press on an invalid target only eats the event.
                    _ => (SceneState::CreatingLink(gesture), true),
                }
            }
            _ => (SceneState::CreatingLink(gesture), true),
        }
    }

    fn update_link_target(
        &self,
        gesture: &mut LinkGesture,
        pos: egui::Pos2,
        probe: &dyn SceneProbe,
        effects: &mut Vec<Effect>,
    ) {
        if let Some(old) = gesture.hover.take() {
            effects.push(Effect::SetLinkTargetHighlight {
                item: old,
                on: false,
            });
        }
        let marker_rect = egui::Rect::from_center_size(
            pos,
            egui::Vec2::splat(2.0 * self.config.marker_half_extent),
        );
        let candidate = self.pick_link_target(marker_rect, probe);
        gesture.marker = match candidate {
            Some(target) => {
                if self.is_valid_link_connection(gesture.source, target, probe) {
                    gesture.hover = Some(target);
                    effects.push(Effect::SetLinkTargetHighlight {
                        item: target,
                        on: true,
                    });
                    MarkerState::ValidTarget
                } else {
                    MarkerState::InvalidTarget
                }
            }
            None => MarkerState::AddWaypoint,
        };
        effects.push(Effect::ShowTargetMarker {
            rect: marker_rect,
            state: gesture.marker,
        });
        effects.push(Effect::ShowRubberLine {
            from: gesture.line_from,
            to: pos,
        });
    }

    /// Largest rectangular overlap with the marker wins; a later candidate
    /// replaces the best only with strictly greater area, so the first
    /// encountered wins ties.
    fn pick_link_target(&self, marker_rect: egui::Rect, probe: &dyn SceneProbe) -> Option<ItemId> {
        let mut best: Option<(ItemId, f32)> = None;
        for candidate in probe.items_intersecting(marker_rect) {
            let Some(kind) = probe.item_kind(candidate) else {
                continue;
            };
            if !kind.link_endpoint() || probe.is_disposed(candidate) {
                continue;
            }
            let Some(rect) = probe.item_rect(candidate) else {
                continue;
            };
            let area = geometry::overlap_area(rect, marker_rect);
            if area <= 0.0 {
                continue;
            }
            if best.is_none_or(|(_, best_area)| area > best_area) {
                best = Some((candidate, area));
            }
        }
        best.map(|(item, _)| item)
    }

    fn is_valid_link_connection(
        &self,
        source: ItemId,
        target: ItemId,
        probe: &dyn SceneProbe,
    ) -> bool {
        if source == target {
            return false;
        }
        let (Some(s), Some(t)) = (probe.anchor_info(source), probe.anchor_info(target)) else {
            return false;
        };
        if !link_allowed_between(&s, &t) {
            return false;
        }
        if probe.has_direct_link(source, target) {
            return false;
        }
        true
    }

    fn retargeting_transition(
        &mut self,
        mut gesture: RetargetGesture,
        event: InputEvent,
        probe: &dyn SceneProbe,
        effects: &mut Vec<Effect>,
    ) -> (SceneState, bool) {
        match event {
            InputEvent::MouseMove { pos, .. } => {
                if let Some(old) = gesture.hover.take() {
                    effects.push(Effect::SetLinkTargetHighlight {
                        item: old,
                        on: false,
                    });
                }
                let marker_rect = egui::Rect::from_center_size(
                    pos,
                    egui::Vec2::splat(2.0 * self.config.marker_half_extent),
                );
                let candidate = self.pick_link_target(marker_rect, probe);
                gesture.marker = match candidate {
                    // Validity is judged against the link's original source.
                    Some(target)
                        if self.is_valid_link_connection(gesture.source, target, probe) =>
                    {
                        gesture.hover = Some(target);
                        effects.push(Effect::SetLinkTargetHighlight {
                            item: target,
                            on: true,
                        });
                        MarkerState::ValidTarget
                    }
                    _ => MarkerState::InvalidTarget,
                };
                effects.push(Effect::ShowTargetMarker {
                    rect: marker_rect,
                    state: gesture.marker,
                });
                effects.push(Effect::ShowRubberLine {
                    from: gesture.line_from,
                    to: pos,
                });
                (SceneState::RetargetingLink(gesture), true)
            }
            InputEvent::MouseDown {
                button: MouseButton::Right,
                ..
            } => (SceneState::RetargetingLink(gesture), true),
            InputEvent::MouseUp {
                button: MouseButton::Right,
                ..
            }
            | InputEvent::KeyDown {
                key: Key::Escape, ..
            } => (self.abort_gesture(gesture.hover, *gesture.prev, effects), true),
            InputEvent::MouseDown {
                button: MouseButton::Left,
                ..
            } => match (gesture.marker, gesture.hover) {
                (MarkerState::ValidTarget, Some(target)) => {
                    let Some(new_target) =
                        probe.anchor_info(target).and_then(|a| a.endpoint)
                    else {
                        return (SceneState::RetargetingLink(gesture), true);
                    };
                    effects.push(Effect::SetLinkTargetHighlight {
                        item: target,
                        on: false,
                    });
                    effects.push(Effect::PushCommand(CommandRequest::RetargetLink {
                        link: gesture.link,
                        old_target: gesture.old_target,
                        new_target,
                    }));
                    effects.push(Effect::DisposeTransients);
                    (*gesture.prev, true)
                }
                _ => {
                    // Single-shot: anything but a valid target abandons the
                    // retarget.
                    log::warn!("link retargeting abandoned on invalid target");
                    (self.abort_gesture(gesture.hover, *gesture.prev, effects), true)
                }
            },
            _ => (SceneState::RetargetingLink(gesture), true),
        }
    }

    fn abort_gesture(
        &self,
        hover: Option<ItemId>,
        prev: SceneState,
        effects: &mut Vec<Effect>,
    ) -> SceneState {
        if let Some(item) = hover {
            effects.push(Effect::SetLinkTargetHighlight { item, on: false });
        }
        effects.push(Effect::DisposeTransients);
        prev
    }

    fn click_delete_transition(
        &mut self,
        prev: Box<SceneState>,
        candidate: Option<ItemId>,
        event: InputEvent,
        probe: &dyn SceneProbe,
        effects: &mut Vec<Effect>,
    ) -> (SceneState, bool) {
        match event {
            InputEvent::MouseMove { pos, .. } => {
                let candidate =
                    self.refresh_delete_candidate(candidate, Some(pos), probe, effects);
                (SceneState::ClickDelete { prev, candidate }, true)
            }
            InputEvent::MouseDown {
                button: MouseButton::Left,
                pos,
                ..
            } => {
                if let Some(item) = candidate.filter(|c| {
                    probe.item_at(pos) == Some(*c) && !probe.is_disposed(*c)
                }) {
                    // Fire and forget: the item disappears through the normal
                    // removal path once the backend confirms.
                    match probe.item_kind(item) {
                        Some(ItemKind::Link) => {
                            if let Some(link) = probe.link_of_item(item) {
                                effects.push(Effect::PushCommand(CommandRequest::RemoveLink(link)));
                            }
                        }
                        Some(ItemKind::Waypoint) => {
                            if let Some((link, waypoint)) = probe.waypoint_of_item(item) {
                                effects.push(Effect::PushCommand(
                                    CommandRequest::RemoveWaypoint { link, waypoint },
                                ));
                            }
                        }
                        _ => {}
                    }
                }
                (SceneState::ClickDelete { prev, candidate }, true)
            }
            InputEvent::KeyUp { modifiers, .. } if !modifiers.is_delete_chord() => {
                if let Some(item) = candidate {
                    effects.push(Effect::SetPendingDelete { item, on: false });
                }
                effects.push(Effect::DeleteCursor(None));
                (*prev, true)
            }
            _ => (SceneState::ClickDelete { prev, candidate }, true),
        }
    }

    fn refresh_delete_candidate(
        &self,
        previous: Option<ItemId>,
        cursor: Option<egui::Pos2>,
        probe: &dyn SceneProbe,
        effects: &mut Vec<Effect>,
    ) -> Option<ItemId> {
        let found = cursor
            .and_then(|pos| probe.item_at(pos))
            .filter(|e| !probe.is_disposed(*e))
            .filter(|e| probe.item_kind(*e).is_some_and(|k| k.click_deletable()));
        if previous != found {
            if let Some(old) = previous {
                effects.push(Effect::SetPendingDelete {
                    item: old,
                    on: false,
                });
            }
            if let Some(new) = found {
                effects.push(Effect::SetPendingDelete {
                    item: new,
                    on: true,
                });
            }
        }
        effects.push(Effect::DeleteCursor(Some(found.is_some())));
        found
    }

    fn try_enter_click_delete(
        &self,
        state: SceneState,
        probe: &dyn SceneProbe,
        effects: &mut Vec<Effect>,
    ) -> (SceneState, bool) {
        // A selected waypoint would fight the pending-delete highlight, so
        // the mode is refused outright.
        let waypoint_selected = probe
            .selection()
            .iter()
            .any(|e| probe.item_kind(*e) == Some(ItemKind::Waypoint));
        if waypoint_selected {
            log::warn!("quick-delete refused while a waypoint is selected");
            return (state, false);
        }
        effects.push(Effect::DeleteCursor(Some(false)));
        (
            SceneState::ClickDelete {
                prev: Box::new(state),
                candidate: None,
            },
            true,
        )
    }

    /// `None` means the selection contents are invalid (heterogeneous or of a
    /// kind that cannot be multi-selected) and the caller must ignore the
    /// change.
    fn classify_selection(&self, probe: &dyn SceneProbe) -> Option<SceneState> {
        let selection = probe.selection();
        match selection.as_slice() {
            [] => Some(SceneState::Idle),
            [single] => Some(SceneState::ItemSelected {
                item: *single,
                press_modifiers: ModifierKeys::NONE,
            }),
            [first, rest @ ..] => {
                let kind = probe.item_kind(*first);
                if rest.iter().any(|e| probe.item_kind(*e) != kind) {
                    log::warn!("heterogeneous multi-selection rejected");
                    return None;
                }
                match kind {
                    Some(ItemKind::Part) => Some(SceneState::ManyPartsSelected),
                    Some(ItemKind::Waypoint) => Some(SceneState::ManyWaypointsSelected),
                    _ => {
                        log::warn!("multi-selection of non-multi-selectable kind rejected");
                        None
                    }
                }
            }
        }
    }

    /// Scene-level call: the selection set has been updated and fully
    /// processed; reclassify the steady states.
    pub fn selection_changed(&mut self, probe: &dyn SceneProbe) {
        match &self.state {
            SceneState::Idle => {
                if probe.selection().len() > 1 {
                    log::error!("selection grew past one item directly from idle");
                    return;
                }
                if let Some(next) = self.classify_selection(probe) {
                    self.state = next;
                }
            }
            SceneState::ItemSelected { .. }
            | SceneState::ManyPartsSelected
            | SceneState::ManyWaypointsSelected => {
                if let Some(next) = self.classify_selection(probe) {
                    self.state = next;
                }
            }
            _ => {
                log::debug!("selection change ignored by the active interaction");
            }
        }
    }

    /// Scene-level call: begin a link-creation gesture from `source`.
    pub fn start_link_creation(
        &mut self,
        source: ItemId,
        probe: &dyn SceneProbe,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        if !matches!(self.state, SceneState::ItemSelected { .. }) {
            log::warn!("link creation requested outside single selection; ignored");
            return effects;
        }
        let Some(source_endpoint) = probe.anchor_info(source).and_then(|a| a.endpoint) else {
            log::warn!("link creation from a non-anchor item; ignored");
            return effects;
        };
        if probe.is_disposed(source) {
            return effects;
        }
        let line_from = probe
            .item_rect(source)
            .map(|r| r.center())
            .unwrap_or_default();
        effects.push(Effect::ShowTargetMarker {
            rect: egui::Rect::from_center_size(
                line_from,
                egui::Vec2::splat(2.0 * self.config.marker_half_extent),
            ),
            state: MarkerState::AddWaypoint,
        });
        effects.push(Effect::ShowRubberLine {
            from: line_from,
            to: line_from,
        });
        let prev = Box::new(std::mem::replace(&mut self.state, SceneState::Idle));
        self.state = SceneState::CreatingLink(LinkGesture {
            source,
            source_endpoint,
            line_from,
            waypoints: Vec::new(),
            hover: None,
            marker: MarkerState::AddWaypoint,
            prev,
        });
        effects
    }

    pub fn cancel_link_creation(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        let state = std::mem::replace(&mut self.state, SceneState::Idle);
        self.state = match state {
            SceneState::CreatingLink(gesture) => {
                self.abort_gesture(gesture.hover, *gesture.prev, &mut effects)
            }
            other => {
                log::debug!("no link creation to cancel");
                other
            }
        };
        effects
    }

    /// Scene-level call: begin retargeting `link`, whose current endpoints
    /// are the items `source` and `old_target`.
    pub fn start_retargeting(
        &mut self,
        link: LinkId,
        source: ItemId,
        old_target: ItemId,
        probe: &dyn SceneProbe,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        if !matches!(self.state, SceneState::ItemSelected { .. }) {
            log::warn!("link retargeting requested outside single selection; ignored");
            return effects;
        }
        let (Some(source_anchor), Some(target_anchor)) =
            (probe.anchor_info(source), probe.anchor_info(old_target))
        else {
            log::warn!("link retargeting with non-anchor endpoints; ignored");
            return effects;
        };
        let (Some(source_endpoint), Some(old_target_endpoint)) =
            (source_anchor.endpoint, target_anchor.endpoint)
        else {
            log::warn!("link retargeting with transient endpoints; ignored");
            return effects;
        };
        let line_from = probe
            .item_rect(source)
            .map(|r| r.center())
            .unwrap_or_default();
        effects.push(Effect::ShowTargetMarker {
            rect: egui::Rect::from_center_size(
                line_from,
                egui::Vec2::splat(2.0 * self.config.marker_half_extent),
            ),
            state: MarkerState::InvalidTarget,
        });
        effects.push(Effect::ShowRubberLine {
            from: line_from,
            to: line_from,
        });
        let prev = Box::new(std::mem::replace(&mut self.state, SceneState::Idle));
        self.state = SceneState::RetargetingLink(RetargetGesture {
            link,
            source,
            source_endpoint,
            old_target: old_target_endpoint,
            line_from,
            hover: None,
            marker: MarkerState::InvalidTarget,
            prev,
        });
        effects
    }

    pub fn cancel_retargeting(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        let state = std::mem::replace(&mut self.state, SceneState::Idle);
        self.state = match state {
            SceneState::RetargetingLink(gesture) => {
                self.abort_gesture(gesture.hover, *gesture.prev, &mut effects)
            }
            other => {
                log::debug!("no retargeting to cancel");
                other
            }
        };
        effects
    }

    /// An external widget (a size grip, an embedded editor) claims exclusive
    /// input until `end_obj_interaction`.
    pub fn start_obj_interaction(&mut self) {
        match &self.state {
            SceneState::ItemSelected { .. }
            | SceneState::ManyPartsSelected
            | SceneState::ManyWaypointsSelected => {
                let prev = Box::new(std::mem::replace(&mut self.state, SceneState::Idle));
                self.state = SceneState::ObjInteraction { prev };
            }
            _ => log::warn!("object interaction requested in an unsupported state; ignored"),
        }
    }

    pub fn end_obj_interaction(&mut self) {
        let state = std::mem::replace(&mut self.state, SceneState::Idle);
        self.state = match state {
            SceneState::ObjInteraction { prev } => *prev,
            other => other,
        };
    }

    /// Scene contents changed under the cursor (items appeared or vanished);
    /// deletion mode re-resolves its candidate.
    pub fn scene_content_changed(
        &mut self,
        cursor: Option<egui::Pos2>,
        probe: &dyn SceneProbe,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        let state = std::mem::replace(&mut self.state, SceneState::Idle);
        self.state = match state {
            SceneState::ClickDelete { prev, candidate } => {
                let candidate = self.refresh_delete_candidate(
                    candidate.filter(|e| !probe.is_disposed(*e)),
                    cursor,
                    probe,
                    &mut effects,
                );
                SceneState::ClickDelete { prev, candidate }
            }
            other => other,
        };
        effects
    }

    /// An item is gone (backend removal racing the gesture); every state
    /// referencing it must let go.
    pub fn invalidate_item(&mut self, item: ItemId) -> Vec<Effect> {
        let mut effects = Vec::new();
        let state = std::mem::replace(&mut self.state, SceneState::Idle);
        self.state = match state {
            SceneState::CreatingLink(gesture)
                if gesture.source == item || gesture.hover == Some(item) =>
            {
                log::debug!("link creation cancelled: participant {} vanished", item);
                self.abort_gesture(
                    gesture.hover.filter(|h| *h != item),
                    *gesture.prev,
                    &mut effects,
                )
            }
            SceneState::RetargetingLink(gesture)
                if gesture.source == item || gesture.hover == Some(item) =>
            {
                log::debug!("link retargeting cancelled: participant {} vanished", item);
                self.abort_gesture(
                    gesture.hover.filter(|h| *h != item),
                    *gesture.prev,
                    &mut effects,
                )
            }
            SceneState::MovingParts {
                mut saved,
                last,
                prev,
            } => {
                saved.retain(|(e, _)| *e != item);
                if saved.is_empty() {
                    *prev
                } else {
                    SceneState::MovingParts { saved, last, prev }
                }
            }
            SceneState::MovingWaypoints {
                mut saved,
                last,
                prev,
            } => {
                saved.retain(|(e, _)| *e != item);
                if saved.is_empty() {
                    *prev
                } else {
                    SceneState::MovingWaypoints { saved, last, prev }
                }
            }
            SceneState::MovingProxy { saved, last, prev } => {
                if saved.0 == item {
                    *prev
                } else {
                    SceneState::MovingProxy { saved, last, prev }
                }
            }
            SceneState::ClickDelete { prev, candidate } => SceneState::ClickDelete {
                prev,
                candidate: candidate.filter(|e| *e != item),
            },
            other => other,
        };
        effects
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum MovingKind {
    Parts,
    Waypoints,
    Proxy,
}

impl MovingKind {
    fn item_kind(self) -> ItemKind {
        match self {
            MovingKind::Parts => ItemKind::Part,
            MovingKind::Waypoints => ItemKind::Waypoint,
            MovingKind::Proxy => ItemKind::ParentProxy,
        }
    }

    fn state(
        self,
        saved: Vec<(ItemId, egui::Pos2)>,
        last: egui::Pos2,
        prev: Box<SceneState>,
    ) -> SceneState {
        match self {
            MovingKind::Parts => SceneState::MovingParts { saved, last, prev },
            MovingKind::Waypoints => SceneState::MovingWaypoints { saved, last, prev },
            MovingKind::Proxy => SceneState::MovingProxy {
                saved: saved[0],
                last,
                prev,
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::{HashMap, HashSet};

    #[derive(Default)]
    struct StubProbe {
        order: Vec<ItemId>,
        kinds: HashMap<ItemId, ItemKind>,
        rects: HashMap<ItemId, egui::Rect>,
        positions: HashMap<ItemId, egui::Pos2>,
        anchors: HashMap<ItemId, AnchorInfo>,
        parts: HashMap<ItemId, PartId>,
        waypoints: HashMap<ItemId, (LinkId, WaypointId)>,
        links: HashMap<ItemId, LinkId>,
        direct: HashSet<(ItemId, ItemId)>,
        disposed: HashSet<ItemId>,
        selection: Vec<ItemId>,
    }

    impl StubProbe {
        fn add_part(&mut self, raw: u64, rect: egui::Rect) -> ItemId {
            let item = ItemId::from_raw(raw);
            let part = PartId::now_v7();
            self.order.push(item);
            self.kinds.insert(item, ItemKind::Part);
            self.rects.insert(item, rect);
            self.positions.insert(item, rect.min);
            self.parts.insert(item, part);
            self.anchors.insert(
                item,
                AnchorInfo {
                    item,
                    kind: ItemKind::Part,
                    endpoint: Some(LinkEndpoint::Part(part)),
                    owner_part: Some(part),
                },
            );
            item
        }

        fn add_port(&mut self, raw: u64, owner: ItemId, rect: egui::Rect) -> ItemId {
            let item = ItemId::from_raw(raw);
            let port = crate::common::ids::PortId::now_v7();
            let owner_part = self.parts.get(&owner).copied();
            self.order.push(item);
            self.kinds.insert(item, ItemKind::IfxPort);
            self.rects.insert(item, rect);
            self.positions.insert(item, rect.min);
            self.anchors.insert(
                item,
                AnchorInfo {
                    item,
                    kind: ItemKind::IfxPort,
                    endpoint: Some(LinkEndpoint::Port(port)),
                    owner_part,
                },
            );
            item
        }

        fn add_waypoint(&mut self, raw: u64, pos: egui::Pos2) -> ItemId {
            let item = ItemId::from_raw(raw);
            self.order.push(item);
            self.kinds.insert(item, ItemKind::Waypoint);
            self.rects
                .insert(item, egui::Rect::from_center_size(pos, egui::Vec2::splat(10.0)));
            self.positions.insert(item, pos);
            self.waypoints
                .insert(item, (LinkId::now_v7(), WaypointId::now_v7()));
            self.anchors.insert(
                item,
                AnchorInfo {
                    item,
                    kind: ItemKind::Waypoint,
                    endpoint: None,
                    owner_part: None,
                },
            );
            item
        }

        fn add_link_item(&mut self, raw: u64, rect: egui::Rect) -> (ItemId, LinkId) {
            let item = ItemId::from_raw(raw);
            let link = LinkId::now_v7();
            self.order.push(item);
            self.kinds.insert(item, ItemKind::Link);
            self.rects.insert(item, rect);
            self.links.insert(item, link);
            (item, link)
        }
    }

    impl SceneProbe for StubProbe {
        fn item_kind(&self, item: ItemId) -> Option<ItemKind> {
            self.kinds.get(&item).copied()
        }
        fn item_rect(&self, item: ItemId) -> Option<egui::Rect> {
            self.rects.get(&item).copied()
        }
        fn item_position(&self, item: ItemId) -> Option<egui::Pos2> {
            self.positions.get(&item).copied()
        }
        fn item_at(&self, pos: egui::Pos2) -> Option<ItemId> {
            self.order
                .iter()
                .find(|e| {
                    !self.disposed.contains(e)
                        && self.rects.get(e).is_some_and(|r| r.contains(pos))
                })
                .copied()
        }
        fn items_contained_in(&self, rect: egui::Rect) -> Vec<ItemId> {
            self.order
                .iter()
                .filter(|e| self.rects.get(e).is_some_and(|r| rect.contains_rect(*r)))
                .copied()
                .collect()
        }
        fn items_intersecting(&self, rect: egui::Rect) -> Vec<ItemId> {
            self.order
                .iter()
                .filter(|e| self.rects.get(e).is_some_and(|r| rect.intersects(*r)))
                .copied()
                .collect()
        }
        fn anchor_info(&self, item: ItemId) -> Option<AnchorInfo> {
            self.anchors.get(&item).copied()
        }
        fn has_direct_link(&self, source: ItemId, target: ItemId) -> bool {
            self.direct.contains(&(source, target))
        }
        fn is_disposed(&self, item: ItemId) -> bool {
            self.disposed.contains(&item)
        }
        fn selection(&self) -> Vec<ItemId> {
            self.selection.clone()
        }
        fn part_of_item(&self, item: ItemId) -> Option<PartId> {
            self.parts.get(&item).copied()
        }
        fn waypoint_of_item(&self, item: ItemId) -> Option<(LinkId, WaypointId)> {
            self.waypoints.get(&item).copied()
        }
        fn link_of_item(&self, item: ItemId) -> Option<LinkId> {
            self.links.get(&item).copied()
        }
    }

    fn machine() -> SceneStateMachine {
        SceneStateMachine::new(FsmConfig {
            marker_half_extent: 8.0,
            drag_threshold: 3.0,
        })
    }

    fn apply(stub: &mut StubProbe, fsm: &mut SceneStateMachine, effects: &[Effect]) {
        let mut selection_dirty = false;
        for e in effects {
            match e {
                Effect::ReplaceSelection(items) => {
                    stub.selection = items.clone();
                    selection_dirty = true;
                }
                Effect::ExtendSelection(item) => {
                    stub.selection.push(*item);
                    selection_dirty = true;
                }
                Effect::RemoveFromSelection(item) => {
                    stub.selection.retain(|e| e != item);
                    selection_dirty = true;
                }
                Effect::ClearSelection => {
                    stub.selection.clear();
                    selection_dirty = true;
                }
                Effect::TranslateSelection { delta } => {
                    for item in stub.selection.clone() {
                        if let Some(p) = stub.positions.get_mut(&item) {
                            *p += *delta;
                        }
                        if let Some(r) = stub.rects.get_mut(&item) {
                            *r = r.translate(*delta);
                        }
                    }
                }
                _ => {}
            }
        }
        if selection_dirty {
            fsm.selection_changed(stub);
        }
    }

    fn pushed_commands(effects: &[Effect]) -> Vec<CommandRequest> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::PushCommand(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    fn down(pos: egui::Pos2) -> InputEvent {
        InputEvent::MouseDown {
            pos,
            button: MouseButton::Left,
            modifiers: ModifierKeys::NONE,
        }
    }

    fn up(pos: egui::Pos2) -> InputEvent {
        InputEvent::MouseUp {
            pos,
            button: MouseButton::Left,
            modifiers: ModifierKeys::NONE,
        }
    }

    fn mv(pos: egui::Pos2) -> InputEvent {
        InputEvent::MouseMove {
            pos,
            modifiers: ModifierKeys::NONE,
        }
    }

    fn click(
        stub: &mut StubProbe,
        fsm: &mut SceneStateMachine,
        pos: egui::Pos2,
    ) -> Vec<Effect> {
        let (_, mut effects) = fsm.handle_event(down(pos), stub);
        let (_, more) = fsm.handle_event(up(pos), stub);
        effects.extend(more);
        let out = effects.clone();
        apply(stub, fsm, &effects);
        out
    }

    fn select_item(stub: &mut StubProbe, fsm: &mut SceneStateMachine, item: ItemId) {
        stub.selection = vec![item];
        fsm.selection_changed(stub);
    }

    fn pos(x: f32, y: f32) -> egui::Pos2 {
        egui::Pos2::new(x, y)
    }

    fn rect(x: f32, y: f32, w: f32, h: f32) -> egui::Rect {
        egui::Rect::from_min_size(pos(x, y), egui::Vec2::new(w, h))
    }

    #[test]
    fn test_click_selects_part_and_enters_item_selected() {
        let mut stub = StubProbe::default();
        let part = stub.add_part(1, rect(0.0, 0.0, 100.0, 60.0));
        let mut fsm = machine();

        let effects = click(&mut stub, &mut fsm, pos(10.0, 10.0));
        assert!(effects.contains(&Effect::ReplaceSelection(vec![part])));
        assert!(matches!(
            fsm.state(),
            SceneState::ItemSelected { item, .. } if *item == part
        ));
    }

    #[test]
    fn test_click_on_blank_clears_selection_back_to_idle() {
        let mut stub = StubProbe::default();
        let part = stub.add_part(1, rect(0.0, 0.0, 100.0, 60.0));
        let mut fsm = machine();
        select_item(&mut stub, &mut fsm, part);

        let effects = click(&mut stub, &mut fsm, pos(500.0, 500.0));
        assert!(effects.contains(&Effect::ClearSelection));
        assert!(matches!(fsm.state(), SceneState::Idle));
    }

    #[test]
    fn test_drag_selected_part_pushes_positions_command() {
        let mut stub = StubProbe::default();
        let part = stub.add_part(1, rect(0.0, 0.0, 100.0, 60.0));
        let part_id = stub.parts[&part];
        let mut fsm = machine();
        select_item(&mut stub, &mut fsm, part);

        let (_, effects) = fsm.handle_event(down(pos(10.0, 10.0)), &stub);
        apply(&mut stub, &mut fsm, &effects);
        let (consumed, effects) = fsm.handle_event(mv(pos(20.0, 15.0)), &stub);
        assert!(consumed);
        assert!(matches!(fsm.state(), SceneState::MovingParts { .. }));
        apply(&mut stub, &mut fsm, &effects);

        let (_, effects) = fsm.handle_event(up(pos(20.0, 15.0)), &stub);
        let commands = pushed_commands(&effects);
        assert_eq!(
            commands,
            vec![CommandRequest::MoveParts {
                moves: vec![(part_id, pos(0.0, 0.0), pos(10.0, 5.0))],
            }]
        );
        assert!(matches!(fsm.state(), SceneState::ItemSelected { .. }));
    }

    #[test]
    fn test_drag_from_unselected_item_pans_the_canvas() {
        let mut stub = StubProbe::default();
        let a = stub.add_part(1, rect(0.0, 0.0, 50.0, 50.0));
        let _b = stub.add_part(2, rect(100.0, 0.0, 50.0, 50.0));
        let mut fsm = machine();
        select_item(&mut stub, &mut fsm, a);

        fsm.handle_event(down(pos(110.0, 10.0)), &stub);
        let (consumed, _) = fsm.handle_event(mv(pos(130.0, 10.0)), &stub);
        assert!(!consumed);
        assert!(matches!(fsm.state(), SceneState::DefaultSceneInteract { .. }));

        let (consumed, _) = fsm.handle_event(up(pos(130.0, 10.0)), &stub);
        assert!(!consumed);
        assert!(matches!(fsm.state(), SceneState::ItemSelected { .. }));
    }

    #[test]
    fn test_extend_click_only_accepts_same_kind() {
        let mut stub = StubProbe::default();
        let a = stub.add_part(1, rect(0.0, 0.0, 50.0, 50.0));
        let b = stub.add_part(2, rect(100.0, 0.0, 50.0, 50.0));
        let w = stub.add_waypoint(3, pos(200.0, 200.0));
        let mut fsm = machine();
        select_item(&mut stub, &mut fsm, a);

        let extend = |pos2| InputEvent::MouseDown {
            pos: pos2,
            button: MouseButton::Left,
            modifiers: ModifierKeys::COMMAND,
        };
        let extend_up = |pos2| InputEvent::MouseUp {
            pos: pos2,
            button: MouseButton::Left,
            modifiers: ModifierKeys::COMMAND,
        };

        let (_, mut effects) = fsm.handle_event(extend(pos(110.0, 10.0)), &stub);
        let (_, more) = fsm.handle_event(extend_up(pos(110.0, 10.0)), &stub);
        effects.extend(more);
        assert!(effects.contains(&Effect::ExtendSelection(b)));
        apply(&mut stub, &mut fsm, &effects);
        assert!(matches!(fsm.state(), SceneState::ManyPartsSelected));

        // A waypoint cannot join a selection of parts.
        let (_, mut effects) = fsm.handle_event(extend(pos(200.0, 200.0)), &stub);
        let (_, more) = fsm.handle_event(extend_up(pos(200.0, 200.0)), &stub);
        effects.extend(more);
        assert!(!effects.iter().any(|e| matches!(
            e,
            Effect::ExtendSelection(i) if *i == w
        )));
        assert!(matches!(fsm.state(), SceneState::ManyPartsSelected));
    }

    #[test]
    fn test_rubber_band_locks_kind_on_first_hit() {
        let mut stub = StubProbe::default();
        let p1 = stub.add_part(1, rect(0.0, 0.0, 10.0, 10.0));
        let _w = stub.add_waypoint(2, pos(25.0, 25.0));
        let p2 = stub.add_part(3, rect(40.0, 40.0, 10.0, 10.0));
        let mut fsm = machine();

        let shift_down = InputEvent::MouseDown {
            pos: pos(-5.0, -5.0),
            button: MouseButton::Left,
            modifiers: ModifierKeys::SHIFT,
        };
        let (consumed, _) = fsm.handle_event(shift_down, &stub);
        assert!(consumed);
        assert!(matches!(fsm.state(), SceneState::RubberBand { .. }));

        // Covers p1 first: the gesture locks onto parts.
        fsm.handle_event(mv(pos(15.0, 15.0)), &stub);
        assert!(matches!(
            fsm.state(),
            SceneState::RubberBand { locked_kind: Some(ItemKind::Part), .. }
        ));

        // Growing over the waypoint must not admit it.
        fsm.handle_event(mv(pos(60.0, 60.0)), &stub);
        let (_, effects) = fsm.handle_event(up(pos(60.0, 60.0)), &stub);
        assert!(effects.contains(&Effect::ReplaceSelection(vec![p1, p2])));
        apply(&mut stub, &mut fsm, &effects);
        assert!(matches!(fsm.state(), SceneState::ManyPartsSelected));
    }

    #[test]
    fn test_rubber_band_first_hit_waypoint_excludes_parts() {
        let mut stub = StubProbe::default();
        let w = stub.add_waypoint(1, pos(5.0, 5.0));
        let _p = stub.add_part(2, rect(30.0, 30.0, 10.0, 10.0));
        let mut fsm = machine();

        fsm.handle_event(
            InputEvent::MouseDown {
                pos: pos(-5.0, -5.0),
                button: MouseButton::Left,
                modifiers: ModifierKeys::SHIFT,
            },
            &stub,
        );
        fsm.handle_event(mv(pos(15.0, 15.0)), &stub);
        fsm.handle_event(mv(pos(60.0, 60.0)), &stub);
        let (_, effects) = fsm.handle_event(up(pos(60.0, 60.0)), &stub);
        assert!(effects.contains(&Effect::ReplaceSelection(vec![w])));
    }

    #[test]
    fn test_link_creation_to_port_with_no_waypoints() {
        let mut stub = StubProbe::default();
        let a = stub.add_part(1, rect(0.0, 0.0, 50.0, 50.0));
        let b = stub.add_part(2, rect(200.0, 0.0, 50.0, 50.0));
        let port = stub.add_port(3, b, rect(195.0, 20.0, 10.0, 10.0));
        let source_endpoint = stub.anchors[&a].endpoint.unwrap();
        let port_endpoint = stub.anchors[&port].endpoint.unwrap();
        let mut fsm = machine();
        select_item(&mut stub, &mut fsm, a);

        let effects = fsm.start_link_creation(a, &stub);
        assert!(matches!(fsm.state(), SceneState::CreatingLink(..)));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::ShowTargetMarker { .. })));

        // Hover just left of the part body: the port overlaps the marker more
        // than the part does and wins the target pick.
        let (_, effects) = fsm.handle_event(mv(pos(196.0, 25.0)), &stub);
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::ShowTargetMarker { state: MarkerState::ValidTarget, .. }
        )));
        assert!(effects.contains(&Effect::SetLinkTargetHighlight { item: port, on: true }));

        let (_, effects) = fsm.handle_event(down(pos(196.0, 25.0)), &stub);
        let commands = pushed_commands(&effects);
        assert_eq!(
            commands,
            vec![CommandRequest::CreateLink {
                source: source_endpoint,
                target: port_endpoint,
                waypoints: vec![],
            }]
        );
        assert!(effects.contains(&Effect::DisposeTransients));
        assert!(matches!(fsm.state(), SceneState::ItemSelected { .. }));
    }

    #[test]
    fn test_link_creation_collects_waypoints_in_order() {
        let mut stub = StubProbe::default();
        let a = stub.add_part(1, rect(0.0, 0.0, 50.0, 50.0));
        let b = stub.add_part(2, rect(400.0, 0.0, 50.0, 50.0));
        let target_endpoint = stub.anchors[&b].endpoint.unwrap();
        let mut fsm = machine();
        select_item(&mut stub, &mut fsm, a);
        fsm.start_link_creation(a, &stub);

        let p1 = pos(100.0, 200.0);
        let p2 = pos(250.0, 200.0);

        fsm.handle_event(mv(p1), &stub);
        let (_, effects) = fsm.handle_event(down(p1), &stub);
        // The first blank click drops a waypoint whose segment starts at the
        // original anchor.
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::DropWaypointMarker { from, pos }
                if *from == rect(0.0, 0.0, 50.0, 50.0).center() && *pos == p1
        )));

        fsm.handle_event(mv(p2), &stub);
        fsm.handle_event(down(p2), &stub);

        fsm.handle_event(mv(pos(410.0, 25.0)), &stub);
        let (_, effects) = fsm.handle_event(down(pos(410.0, 25.0)), &stub);
        let commands = pushed_commands(&effects);
        assert_eq!(commands.len(), 1);
        match &commands[0] {
            CommandRequest::CreateLink { target, waypoints, .. } => {
                assert_eq!(*target, target_endpoint);
                assert_eq!(waypoints, &vec![p1, p2]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_link_shows_invalid_target_and_press_does_nothing() {
        let mut stub = StubProbe::default();
        let a = stub.add_part(1, rect(0.0, 0.0, 50.0, 50.0));
        let b = stub.add_part(2, rect(200.0, 0.0, 50.0, 50.0));
        stub.direct.insert((a, b));
        let mut fsm = machine();
        select_item(&mut stub, &mut fsm, a);
        fsm.start_link_creation(a, &stub);

        let (_, effects) = fsm.handle_event(mv(pos(210.0, 25.0)), &stub);
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::ShowTargetMarker { state: MarkerState::InvalidTarget, .. }
        )));

        let (consumed, effects) = fsm.handle_event(down(pos(210.0, 25.0)), &stub);
        assert!(consumed);
        assert!(pushed_commands(&effects).is_empty());
        assert!(matches!(fsm.state(), SceneState::CreatingLink(..)));
    }

    #[test]
    fn test_escape_cancels_link_creation_and_restores_state() {
        let mut stub = StubProbe::default();
        let a = stub.add_part(1, rect(0.0, 0.0, 50.0, 50.0));
        let mut fsm = machine();
        select_item(&mut stub, &mut fsm, a);
        fsm.start_link_creation(a, &stub);
        fsm.handle_event(mv(pos(100.0, 100.0)), &stub);
        fsm.handle_event(down(pos(100.0, 100.0)), &stub);

        let (_, effects) = fsm.handle_event(
            InputEvent::KeyDown {
                key: Key::Escape,
                modifiers: ModifierKeys::NONE,
            },
            &stub,
        );
        assert!(effects.contains(&Effect::DisposeTransients));
        assert!(pushed_commands(&effects).is_empty());
        assert!(matches!(
            fsm.state(),
            SceneState::ItemSelected { item, .. } if *item == a
        ));
    }

    #[test]
    fn test_removing_gesture_source_cancels_link_creation() {
        let mut stub = StubProbe::default();
        let a = stub.add_part(1, rect(0.0, 0.0, 50.0, 50.0));
        let mut fsm = machine();
        select_item(&mut stub, &mut fsm, a);
        fsm.start_link_creation(a, &stub);

        let effects = fsm.invalidate_item(a);
        assert!(effects.contains(&Effect::DisposeTransients));
        assert!(!matches!(fsm.state(), SceneState::CreatingLink(..)));
    }

    #[test]
    fn test_retargeting_validates_against_original_source() {
        let mut stub = StubProbe::default();
        let a = stub.add_part(1, rect(0.0, 0.0, 50.0, 50.0));
        let b = stub.add_part(2, rect(200.0, 0.0, 50.0, 50.0));
        let c = stub.add_part(3, rect(400.0, 0.0, 50.0, 50.0));
        let old_target = stub.anchors[&b].endpoint.unwrap();
        let new_target = stub.anchors[&c].endpoint.unwrap();
        let (_, link) = stub.add_link_item(4, egui::Rect::NOTHING);
        let mut fsm = machine();
        select_item(&mut stub, &mut fsm, a);

        fsm.start_retargeting(link, a, b, &stub);
        assert!(matches!(fsm.state(), SceneState::RetargetingLink(..)));

        // Hovering the original source is a self-connection: invalid.
        let (_, effects) = fsm.handle_event(mv(pos(25.0, 25.0)), &stub);
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::ShowTargetMarker { state: MarkerState::InvalidTarget, .. }
        )));

        let (_, effects) = fsm.handle_event(mv(pos(410.0, 25.0)), &stub);
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::ShowTargetMarker { state: MarkerState::ValidTarget, .. }
        )));

        let (_, effects) = fsm.handle_event(down(pos(410.0, 25.0)), &stub);
        assert_eq!(
            pushed_commands(&effects),
            vec![CommandRequest::RetargetLink {
                link,
                old_target,
                new_target,
            }]
        );
        assert!(matches!(fsm.state(), SceneState::ItemSelected { .. }));
    }

    #[test]
    fn test_retargeting_abandoned_on_blank_press() {
        let mut stub = StubProbe::default();
        let a = stub.add_part(1, rect(0.0, 0.0, 50.0, 50.0));
        let b = stub.add_part(2, rect(200.0, 0.0, 50.0, 50.0));
        let (_, link) = stub.add_link_item(3, egui::Rect::NOTHING);
        let mut fsm = machine();
        select_item(&mut stub, &mut fsm, a);
        fsm.start_retargeting(link, a, b, &stub);

        fsm.handle_event(mv(pos(600.0, 600.0)), &stub);
        let (_, effects) = fsm.handle_event(down(pos(600.0, 600.0)), &stub);
        assert!(pushed_commands(&effects).is_empty());
        assert!(effects.contains(&Effect::DisposeTransients));
        assert!(matches!(fsm.state(), SceneState::ItemSelected { .. }));
    }

    #[test]
    fn test_click_delete_refused_while_waypoint_selected() {
        let mut stub = StubProbe::default();
        let w = stub.add_waypoint(1, pos(10.0, 10.0));
        let mut fsm = machine();
        select_item(&mut stub, &mut fsm, w);
        let before = fsm.state().clone();

        let (consumed, effects) = fsm.handle_event(
            InputEvent::KeyDown {
                key: Key::Control,
                modifiers: ModifierKeys {
                    alt: false,
                    command: true,
                    shift: true,
                },
            },
            &stub,
        );
        assert!(!consumed);
        assert!(effects.is_empty());
        assert_eq!(*fsm.state(), before);
    }

    #[test]
    fn test_click_delete_highlights_and_removes_link() {
        let mut stub = StubProbe::default();
        let (link_item, link) = stub.add_link_item(1, rect(0.0, 0.0, 100.0, 10.0));
        let mut fsm = machine();

        let chord = ModifierKeys {
            alt: false,
            command: true,
            shift: true,
        };
        let (consumed, effects) = fsm.handle_event(
            InputEvent::KeyDown {
                key: Key::Shift,
                modifiers: chord,
            },
            &stub,
        );
        assert!(consumed);
        assert!(effects.contains(&Effect::DeleteCursor(Some(false))));
        assert!(matches!(fsm.state(), SceneState::ClickDelete { .. }));

        let (_, effects) = fsm.handle_event(
            InputEvent::MouseMove {
                pos: pos(50.0, 5.0),
                modifiers: chord,
            },
            &stub,
        );
        assert!(effects.contains(&Effect::SetPendingDelete { item: link_item, on: true }));
        assert!(effects.contains(&Effect::DeleteCursor(Some(true))));

        let (_, effects) = fsm.handle_event(
            InputEvent::MouseDown {
                pos: pos(50.0, 5.0),
                button: MouseButton::Left,
                modifiers: chord,
            },
            &stub,
        );
        assert_eq!(
            pushed_commands(&effects),
            vec![CommandRequest::RemoveLink(link)]
        );

        let (_, effects) = fsm.handle_event(
            InputEvent::KeyUp {
                key: Key::Shift,
                modifiers: ModifierKeys::NONE,
            },
            &stub,
        );
        assert!(effects.contains(&Effect::DeleteCursor(None)));
        assert!(matches!(fsm.state(), SceneState::Idle));
    }

    #[test]
    fn test_emptied_multi_selection_returns_to_idle() {
        let mut stub = StubProbe::default();
        let a = stub.add_part(1, rect(0.0, 0.0, 10.0, 10.0));
        let b = stub.add_part(2, rect(20.0, 0.0, 10.0, 10.0));
        let mut fsm = machine();
        stub.selection = vec![a];
        fsm.selection_changed(&stub);
        stub.selection = vec![a, b];
        fsm.selection_changed(&stub);
        assert!(matches!(fsm.state(), SceneState::ManyPartsSelected));

        stub.selection.clear();
        fsm.selection_changed(&stub);
        assert!(matches!(fsm.state(), SceneState::Idle));
    }

    #[test]
    fn test_heterogeneous_multi_selection_is_ignored() {
        let mut stub = StubProbe::default();
        let a = stub.add_part(1, rect(0.0, 0.0, 10.0, 10.0));
        let w = stub.add_waypoint(2, pos(50.0, 50.0));
        let mut fsm = machine();
        stub.selection = vec![a];
        fsm.selection_changed(&stub);
        stub.selection = vec![a, w];
        fsm.selection_changed(&stub);
        // Logged and ignored: the state sticks with the last valid one.
        assert!(matches!(
            fsm.state(),
            SceneState::ItemSelected { item, .. } if *item == a
        ));
    }

    #[test]
    fn test_selectable_kinds_match_selection_contents() {
        let mut stub = StubProbe::default();
        let a = stub.add_part(1, rect(0.0, 0.0, 10.0, 10.0));
        let b = stub.add_part(2, rect(20.0, 0.0, 10.0, 10.0));
        let mut fsm = machine();

        assert_eq!(fsm.selectable_kinds(), SelectableKinds::AnySelectable);

        stub.selection = vec![a];
        fsm.selection_changed(&stub);
        stub.selection = vec![a, b];
        fsm.selection_changed(&stub);
        assert_eq!(fsm.selectable_kinds(), SelectableKinds::Only(ItemKind::Part));
        assert!(stub
            .selection
            .iter()
            .all(|e| stub.item_kind(*e) == Some(ItemKind::Part)));
    }

    #[test]
    fn test_moving_waypoints_pushes_waypoint_moves() {
        let mut stub = StubProbe::default();
        let w1 = stub.add_waypoint(1, pos(10.0, 10.0));
        let w2 = stub.add_waypoint(2, pos(40.0, 10.0));
        let id1 = stub.waypoints[&w1].1;
        let id2 = stub.waypoints[&w2].1;
        let mut fsm = machine();
        stub.selection = vec![w1];
        fsm.selection_changed(&stub);
        stub.selection = vec![w1, w2];
        fsm.selection_changed(&stub);
        assert!(matches!(fsm.state(), SceneState::ManyWaypointsSelected));

        let (_, effects) = fsm.handle_event(down(pos(10.0, 10.0)), &stub);
        apply(&mut stub, &mut fsm, &effects);
        let (_, effects) = fsm.handle_event(mv(pos(10.0, 30.0)), &stub);
        assert!(matches!(fsm.state(), SceneState::MovingWaypoints { .. }));
        apply(&mut stub, &mut fsm, &effects);

        let (_, effects) = fsm.handle_event(up(pos(10.0, 30.0)), &stub);
        assert_eq!(
            pushed_commands(&effects),
            vec![CommandRequest::MoveWaypoints {
                moves: vec![
                    (id1, pos(10.0, 10.0), pos(10.0, 30.0)),
                    (id2, pos(40.0, 10.0), pos(40.0, 30.0)),
                ],
            }]
        );
        assert!(matches!(fsm.state(), SceneState::ManyWaypointsSelected));
    }
}
