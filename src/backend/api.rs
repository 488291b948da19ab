use eframe::egui;
use std::sync::Arc;

use crate::common::ids::{LinkId, PartId, PortId, WaypointId};

pub type RequestId = u64;

/// Which side of its owning part an interface port sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PortSide {
    Left,
    Right,
}

/// A backend object a link may terminate at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LinkEndpoint {
    Part(PartId),
    Port(PortId),
}

/// One mutation of the scenario model. Every request is answered with a
/// [`RestoreInfo`] sufficient to reverse it.
#[derive(Clone, Debug, PartialEq)]
pub enum BackendRequest {
    CreateChildPart {
        parent: PartId,
        name: String,
        position: egui::Pos2,
    },
    RemoveChildPart {
        part: PartId,
    },
    RestoreChildPart {
        info: PartRestoration,
    },
    SetPositions {
        moves: Vec<(PartId, egui::Pos2)>,
    },
    SetFrame {
        part: PartId,
        position: egui::Pos2,
        size: egui::Vec2,
    },
    SetName {
        part: PartId,
        name: String,
    },
    SetDetailLevel {
        part: PartId,
        level: u8,
    },
    SetRunRole {
        part: PartId,
        enabled: bool,
    },
    SetIfxLevel {
        port: PortId,
        level: u8,
    },
    RestoreIfxLevel {
        info: IfxLevelRestoration,
    },
    SetPortPlacement {
        port: PortId,
        side: PortSide,
        row: i32,
    },
    CreateLink {
        source: LinkEndpoint,
        target: LinkEndpoint,
        waypoints: Vec<egui::Pos2>,
    },
    RemoveLink {
        link: LinkId,
    },
    RestoreOutgoingLink {
        info: LinkRestoration,
    },
    RetargetLink {
        link: LinkId,
        target: LinkEndpoint,
    },
    RestoreRetargetedLink {
        info: RetargetRestoration,
    },
    RenameLink {
        link: LinkId,
        name: String,
    },
    SetLinkDeclutter {
        link: LinkId,
        declutter: bool,
    },
    AddWaypoint {
        link: LinkId,
        index: usize,
        position: egui::Pos2,
    },
    RemoveWaypoint {
        link: LinkId,
        waypoint: WaypointId,
    },
    RemoveAllWaypoints {
        link: LinkId,
    },
    RestoreWaypoints {
        infos: Vec<WaypointRestoration>,
    },
    MoveWaypoints {
        moves: Vec<(WaypointId, egui::Pos2)>,
    },
    ReparentParts {
        parts: Vec<PartId>,
        new_parent: PartId,
    },
    RestoreReparent {
        info: ReparentRestoration,
    },
    PasteParts {
        parent: PartId,
        parts: Vec<PartRestoration>,
    },
    RemoveParts {
        parts: Vec<PartId>,
    },
    RestoreParts {
        infos: Vec<PartRestoration>,
    },
}

/// Full state of one part, as needed to bring it back after removal.
#[derive(Clone, Debug, PartialEq)]
pub struct PartRestoration {
    pub part: PartId,
    pub parent: PartId,
    pub name: String,
    pub position: egui::Pos2,
    pub size: egui::Vec2,
    pub detail_level: u8,
    pub run_role: bool,
    pub ports: Vec<PortRestoration>,
    /// Links severed by the removal, in both directions.
    pub links: Vec<LinkRestoration>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PortRestoration {
    pub port: PortId,
    pub side: PortSide,
    pub row: i32,
    pub ifx_level: u8,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LinkRestoration {
    pub link: LinkId,
    pub source: LinkEndpoint,
    pub target: LinkEndpoint,
    pub name: String,
    pub declutter: bool,
    pub waypoints: Vec<(WaypointId, egui::Pos2)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetargetRestoration {
    pub link: LinkId,
    pub previous_target: LinkEndpoint,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WaypointRestoration {
    pub link: LinkId,
    pub waypoint: WaypointId,
    pub index: usize,
    pub position: egui::Pos2,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IfxLevelRestoration {
    pub port: PortId,
    pub level: u8,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReparentRestoration {
    /// Old parent per moved part.
    pub moves: Vec<(PartId, PartId)>,
    /// Links broken because they would have crossed the reparent boundary.
    pub severed: Vec<LinkRestoration>,
}

/// What a successful request hands back for later reversal.
#[derive(Clone, Debug, PartialEq)]
pub enum RestoreInfo {
    None,
    Part(PartRestoration),
    Parts(Vec<PartRestoration>),
    Positions(Vec<(PartId, egui::Pos2)>),
    Frame {
        part: PartId,
        position: egui::Pos2,
        size: egui::Vec2,
    },
    Name {
        previous: String,
    },
    DetailLevel {
        previous: u8,
    },
    RunRole {
        previous: bool,
    },
    IfxLevel(IfxLevelRestoration),
    PortPlacement {
        port: PortId,
        side: PortSide,
        row: i32,
    },
    Link(LinkRestoration),
    Retarget(RetargetRestoration),
    Declutter {
        previous: bool,
    },
    Waypoint(WaypointRestoration),
    Waypoints(Vec<WaypointRestoration>),
    WaypointPositions(Vec<(WaypointId, egui::Pos2)>),
    Reparent(ReparentRestoration),
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("unknown part {0}")]
    UnknownPart(PartId),
    #[error("unknown link {0}")]
    UnknownLink(LinkId),
    #[error("unknown waypoint {0}")]
    UnknownWaypoint(WaypointId),
    #[error("unknown port {0}")]
    UnknownPort(PortId),
    #[error("link rejected: {0}")]
    LinkRejected(String),
    #[error("backend worker is gone")]
    Unavailable,
    #[error("{0}")]
    Other(String),
}

/// Change notifications emitted by the scenario model. These arrive on their
/// own channel and may interleave arbitrarily with input handling.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    PartAdded {
        part: PartId,
        parent: PartId,
        name: Arc<String>,
        position: egui::Pos2,
        size: egui::Vec2,
    },
    PartRemoved {
        part: PartId,
    },
    PortAdded {
        port: PortId,
        part: PartId,
        side: PortSide,
        row: i32,
        ifx_level: u8,
    },
    PortRemoved {
        port: PortId,
    },
    LinkAdded {
        link: LinkId,
        source: LinkEndpoint,
        target: LinkEndpoint,
        name: Arc<String>,
        waypoints: Vec<(WaypointId, egui::Pos2)>,
    },
    LinkRemoved {
        link: LinkId,
    },
    WaypointAdded {
        link: LinkId,
        waypoint: WaypointId,
        index: usize,
        position: egui::Pos2,
    },
    WaypointRemoved {
        link: LinkId,
        waypoint: WaypointId,
    },
    NameChanged {
        part: PartId,
        name: Arc<String>,
    },
    PositionChanged {
        part: PartId,
        position: egui::Pos2,
    },
    SizeChanged {
        part: PartId,
        size: egui::Vec2,
    },
    WaypointMoved {
        waypoint: WaypointId,
        position: egui::Pos2,
    },
    DeclutterChanged {
        link: LinkId,
        declutter: bool,
    },
    IfxLevelChanged {
        port: PortId,
        level: u8,
    },
    TargetChanged {
        link: LinkId,
        target: LinkEndpoint,
    },
    PortPlacementChanged {
        port: PortId,
        side: PortSide,
        row: i32,
    },
}

/// The scenario model as seen from the worker thread. Implementations live in
/// the embedding application; the crate only ships an in-memory one for tests.
pub trait ScenarioApi: Send {
    fn execute(&mut self, request: BackendRequest) -> Result<RestoreInfo, BackendError>;

    /// Notifications produced since the last call, in order.
    fn drain_notifications(&mut self) -> Vec<Notification>;
}
