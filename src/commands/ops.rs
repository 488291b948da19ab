//! The concrete undoable commands. Each one stores exactly the state needed
//! to reverse itself: the "before" values it was built with plus the
//! restoration info absorbed from the backend on first success.

use eframe::egui;

use super::{UndoableCommand, ViewportContext};
use crate::backend::api::{
    BackendRequest, IfxLevelRestoration, LinkEndpoint, LinkRestoration, PartRestoration,
    PortSide, ReparentRestoration, RestoreInfo, RetargetRestoration, WaypointRestoration,
};
use crate::common::ids::{LinkId, PartId, PortId, WaypointId};

macro_rules! command_plumbing {
    () => {
        fn viewport(&self) -> Option<&ViewportContext> {
            self.viewport.as_ref()
        }
        fn set_viewport(&mut self, viewport: ViewportContext) {
            self.viewport = Some(viewport);
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    };
}

pub struct AddPartCommand {
    parent: PartId,
    name: String,
    position: egui::Pos2,
    restore: Option<PartRestoration>,
    viewport: Option<ViewportContext>,
}

impl AddPartCommand {
    pub fn new(parent: PartId, name: String, position: egui::Pos2) -> Self {
        Self {
            parent,
            name,
            position,
            restore: None,
            viewport: None,
        }
    }

    /// The created part's identity, once known.
    pub fn created_part(&self) -> Option<PartId> {
        self.restore.as_ref().map(|r| r.part)
    }
}

impl UndoableCommand for AddPartCommand {
    fn forward_request(&self) -> BackendRequest {
        match &self.restore {
            // Redo brings the same part back instead of minting a new one.
            Some(info) => BackendRequest::RestoreChildPart { info: info.clone() },
            None => BackendRequest::CreateChildPart {
                parent: self.parent,
                name: self.name.clone(),
                position: self.position,
            },
        }
    }

    fn inverse_request(&self) -> BackendRequest {
        let Some(info) = &self.restore else {
            unreachable!("inverse requested before first execution");
        };
        BackendRequest::RemoveChildPart { part: info.part }
    }

    fn absorb_restore(&mut self, info: RestoreInfo) {
        if let RestoreInfo::Part(info) = info {
            self.restore = Some(info);
        }
    }

    fn redo_description(&self) -> String {
        format!("Add part \"{}\"", self.name)
    }

    fn undo_description(&self) -> String {
        format!("Remove added part \"{}\"", self.name)
    }

    command_plumbing!();
}

pub struct RemovePartCommand {
    part: PartId,
    name: String,
    restore: Option<PartRestoration>,
    viewport: Option<ViewportContext>,
}

impl RemovePartCommand {
    pub fn new(part: PartId, name: String) -> Self {
        Self {
            part,
            name,
            restore: None,
            viewport: None,
        }
    }
}

impl UndoableCommand for RemovePartCommand {
    fn forward_request(&self) -> BackendRequest {
        BackendRequest::RemoveChildPart { part: self.part }
    }

    fn inverse_request(&self) -> BackendRequest {
        let Some(info) = &self.restore else {
            unreachable!("inverse requested before first execution");
        };
        BackendRequest::RestoreChildPart { info: info.clone() }
    }

    fn absorb_restore(&mut self, info: RestoreInfo) {
        if let RestoreInfo::Part(info) = info {
            self.restore = Some(info);
        }
    }

    fn redo_description(&self) -> String {
        format!("Remove part \"{}\"", self.name)
    }

    fn undo_description(&self) -> String {
        format!("Restore part \"{}\"", self.name)
    }

    command_plumbing!();
}

pub struct RenamePartCommand {
    part: PartId,
    old_name: String,
    new_name: String,
    viewport: Option<ViewportContext>,
}

impl RenamePartCommand {
    pub fn new(part: PartId, old_name: String, new_name: String) -> Self {
        Self {
            part,
            old_name,
            new_name,
            viewport: None,
        }
    }
}

impl UndoableCommand for RenamePartCommand {
    fn forward_request(&self) -> BackendRequest {
        BackendRequest::SetName {
            part: self.part,
            name: self.new_name.clone(),
        }
    }

    fn inverse_request(&self) -> BackendRequest {
        BackendRequest::SetName {
            part: self.part,
            name: self.old_name.clone(),
        }
    }

    fn absorb_restore(&mut self, _info: RestoreInfo) {}

    fn redo_description(&self) -> String {
        format!("Rename part to \"{}\"", self.new_name)
    }

    fn undo_description(&self) -> String {
        format!("Rename part back to \"{}\"", self.old_name)
    }

    command_plumbing!();
}

/// Position change for any number of parts, as produced by a move gesture.
pub struct PartsPositionsCommand {
    moves: Vec<(PartId, egui::Pos2, egui::Pos2)>,
    viewport: Option<ViewportContext>,
}

impl PartsPositionsCommand {
    pub fn new(moves: Vec<(PartId, egui::Pos2, egui::Pos2)>) -> Self {
        Self {
            moves,
            viewport: None,
        }
    }

    pub fn moves(&self) -> &[(PartId, egui::Pos2, egui::Pos2)] {
        &self.moves
    }
}

impl UndoableCommand for PartsPositionsCommand {
    fn forward_request(&self) -> BackendRequest {
        BackendRequest::SetPositions {
            moves: self.moves.iter().map(|(p, _, new)| (*p, *new)).collect(),
        }
    }

    fn inverse_request(&self) -> BackendRequest {
        BackendRequest::SetPositions {
            moves: self.moves.iter().map(|(p, old, _)| (*p, *old)).collect(),
        }
    }

    fn absorb_restore(&mut self, _info: RestoreInfo) {}

    fn redo_description(&self) -> String {
        format!("Move {} parts", self.moves.len())
    }

    fn undo_description(&self) -> String {
        format!("Move {} parts back", self.moves.len())
    }

    command_plumbing!();
}

pub struct ResizeFrameCommand {
    part: PartId,
    old_frame: egui::Rect,
    new_frame: egui::Rect,
    viewport: Option<ViewportContext>,
}

impl ResizeFrameCommand {
    pub fn new(part: PartId, old_frame: egui::Rect, new_frame: egui::Rect) -> Self {
        Self {
            part,
            old_frame,
            new_frame,
            viewport: None,
        }
    }
}

impl UndoableCommand for ResizeFrameCommand {
    fn forward_request(&self) -> BackendRequest {
        BackendRequest::SetFrame {
            part: self.part,
            position: self.new_frame.min,
            size: self.new_frame.size(),
        }
    }

    fn inverse_request(&self) -> BackendRequest {
        BackendRequest::SetFrame {
            part: self.part,
            position: self.old_frame.min,
            size: self.old_frame.size(),
        }
    }

    fn absorb_restore(&mut self, _info: RestoreInfo) {}

    fn redo_description(&self) -> String {
        "Resize part frame".to_owned()
    }

    fn undo_description(&self) -> String {
        "Restore part frame".to_owned()
    }

    command_plumbing!();
}

pub struct DetailLevelCommand {
    part: PartId,
    old_level: u8,
    new_level: u8,
    viewport: Option<ViewportContext>,
}

impl DetailLevelCommand {
    pub fn new(part: PartId, old_level: u8, new_level: u8) -> Self {
        Self {
            part,
            old_level,
            new_level,
            viewport: None,
        }
    }
}

impl UndoableCommand for DetailLevelCommand {
    fn forward_request(&self) -> BackendRequest {
        BackendRequest::SetDetailLevel {
            part: self.part,
            level: self.new_level,
        }
    }

    fn inverse_request(&self) -> BackendRequest {
        BackendRequest::SetDetailLevel {
            part: self.part,
            level: self.old_level,
        }
    }

    fn absorb_restore(&mut self, _info: RestoreInfo) {}

    fn redo_description(&self) -> String {
        format!("Set detail level {}", self.new_level)
    }

    fn undo_description(&self) -> String {
        format!("Set detail level back to {}", self.old_level)
    }

    command_plumbing!();
}

pub struct ToggleRunRoleCommand {
    part: PartId,
    enabled: bool,
    viewport: Option<ViewportContext>,
}

impl ToggleRunRoleCommand {
    pub fn new(part: PartId, enabled: bool) -> Self {
        Self {
            part,
            enabled,
            viewport: None,
        }
    }
}

impl UndoableCommand for ToggleRunRoleCommand {
    fn forward_request(&self) -> BackendRequest {
        BackendRequest::SetRunRole {
            part: self.part,
            enabled: self.enabled,
        }
    }

    fn inverse_request(&self) -> BackendRequest {
        BackendRequest::SetRunRole {
            part: self.part,
            enabled: !self.enabled,
        }
    }

    fn absorb_restore(&mut self, _info: RestoreInfo) {}

    fn redo_description(&self) -> String {
        format!(
            "{} run role",
            if self.enabled { "Enable" } else { "Disable" }
        )
    }

    fn undo_description(&self) -> String {
        format!(
            "{} run role",
            if self.enabled { "Disable" } else { "Enable" }
        )
    }

    command_plumbing!();
}

pub struct IfxLevelCommand {
    port: PortId,
    new_level: u8,
    restore: Option<IfxLevelRestoration>,
    viewport: Option<ViewportContext>,
}

impl IfxLevelCommand {
    pub fn new(port: PortId, new_level: u8) -> Self {
        Self {
            port,
            new_level,
            restore: None,
            viewport: None,
        }
    }
}

impl UndoableCommand for IfxLevelCommand {
    fn forward_request(&self) -> BackendRequest {
        BackendRequest::SetIfxLevel {
            port: self.port,
            level: self.new_level,
        }
    }

    fn inverse_request(&self) -> BackendRequest {
        let Some(info) = &self.restore else {
            unreachable!("inverse requested before first execution");
        };
        BackendRequest::RestoreIfxLevel { info: info.clone() }
    }

    fn absorb_restore(&mut self, info: RestoreInfo) {
        if let RestoreInfo::IfxLevel(info) = info {
            // The undo reply reports the undone level; keep the original.
            if self.restore.is_none() {
                self.restore = Some(info);
            }
        }
    }

    fn redo_description(&self) -> String {
        format!("Set interface level {}", self.new_level)
    }

    fn undo_description(&self) -> String {
        "Restore interface level".to_owned()
    }

    command_plumbing!();
}

/// Switches a port to another side and/or moves it vertically.
pub struct MoveIfxPortCommand {
    port: PortId,
    old_placement: (PortSide, i32),
    new_placement: (PortSide, i32),
    viewport: Option<ViewportContext>,
}

impl MoveIfxPortCommand {
    pub fn new(port: PortId, old_placement: (PortSide, i32), new_placement: (PortSide, i32)) -> Self {
        Self {
            port,
            old_placement,
            new_placement,
            viewport: None,
        }
    }
}

impl UndoableCommand for MoveIfxPortCommand {
    fn forward_request(&self) -> BackendRequest {
        BackendRequest::SetPortPlacement {
            port: self.port,
            side: self.new_placement.0,
            row: self.new_placement.1,
        }
    }

    fn inverse_request(&self) -> BackendRequest {
        BackendRequest::SetPortPlacement {
            port: self.port,
            side: self.old_placement.0,
            row: self.old_placement.1,
        }
    }

    fn absorb_restore(&mut self, _info: RestoreInfo) {}

    fn redo_description(&self) -> String {
        "Move interface port".to_owned()
    }

    fn undo_description(&self) -> String {
        "Move interface port back".to_owned()
    }

    command_plumbing!();
}

pub struct CreateLinkCommand {
    source: LinkEndpoint,
    target: LinkEndpoint,
    waypoints: Vec<egui::Pos2>,
    restore: Option<LinkRestoration>,
    viewport: Option<ViewportContext>,
}

impl CreateLinkCommand {
    pub fn new(source: LinkEndpoint, target: LinkEndpoint, waypoints: Vec<egui::Pos2>) -> Self {
        Self {
            source,
            target,
            waypoints,
            restore: None,
            viewport: None,
        }
    }

    pub fn created_link(&self) -> Option<LinkId> {
        self.restore.as_ref().map(|r| r.link)
    }
}

impl UndoableCommand for CreateLinkCommand {
    fn forward_request(&self) -> BackendRequest {
        match &self.restore {
            Some(info) => BackendRequest::RestoreOutgoingLink { info: info.clone() },
            None => BackendRequest::CreateLink {
                source: self.source,
                target: self.target,
                waypoints: self.waypoints.clone(),
            },
        }
    }

    fn inverse_request(&self) -> BackendRequest {
        let Some(info) = &self.restore else {
            unreachable!("inverse requested before first execution");
        };
        BackendRequest::RemoveLink { link: info.link }
    }

    fn absorb_restore(&mut self, info: RestoreInfo) {
        if let RestoreInfo::Link(info) = info {
            self.restore = Some(info);
        }
    }

    fn redo_description(&self) -> String {
        format!("Create link with {} waypoints", self.waypoints.len())
    }

    fn undo_description(&self) -> String {
        "Remove created link".to_owned()
    }

    command_plumbing!();
}

pub struct RemoveLinkCommand {
    link: LinkId,
    restore: Option<LinkRestoration>,
    viewport: Option<ViewportContext>,
}

impl RemoveLinkCommand {
    pub fn new(link: LinkId) -> Self {
        Self {
            link,
            restore: None,
            viewport: None,
        }
    }
}

impl UndoableCommand for RemoveLinkCommand {
    fn forward_request(&self) -> BackendRequest {
        BackendRequest::RemoveLink { link: self.link }
    }

    fn inverse_request(&self) -> BackendRequest {
        let Some(info) = &self.restore else {
            unreachable!("inverse requested before first execution");
        };
        BackendRequest::RestoreOutgoingLink { info: info.clone() }
    }

    fn absorb_restore(&mut self, info: RestoreInfo) {
        if let RestoreInfo::Link(info) = info {
            self.restore = Some(info);
        }
    }

    fn redo_description(&self) -> String {
        "Remove link".to_owned()
    }

    fn undo_description(&self) -> String {
        "Restore link".to_owned()
    }

    command_plumbing!();
}

pub struct RetargetLinkCommand {
    link: LinkId,
    old_target: LinkEndpoint,
    new_target: LinkEndpoint,
    viewport: Option<ViewportContext>,
}

impl RetargetLinkCommand {
    pub fn new(link: LinkId, old_target: LinkEndpoint, new_target: LinkEndpoint) -> Self {
        Self {
            link,
            old_target,
            new_target,
            viewport: None,
        }
    }

    pub fn link(&self) -> LinkId {
        self.link
    }
}

impl UndoableCommand for RetargetLinkCommand {
    fn forward_request(&self) -> BackendRequest {
        BackendRequest::RetargetLink {
            link: self.link,
            target: self.new_target,
        }
    }

    fn inverse_request(&self) -> BackendRequest {
        BackendRequest::RestoreRetargetedLink {
            info: RetargetRestoration {
                link: self.link,
                previous_target: self.old_target,
            },
        }
    }

    fn absorb_restore(&mut self, _info: RestoreInfo) {}

    fn redo_description(&self) -> String {
        "Retarget link".to_owned()
    }

    fn undo_description(&self) -> String {
        "Restore link target".to_owned()
    }

    command_plumbing!();
}

pub struct RenameLinkCommand {
    link: LinkId,
    old_name: String,
    new_name: String,
    viewport: Option<ViewportContext>,
}

impl RenameLinkCommand {
    pub fn new(link: LinkId, old_name: String, new_name: String) -> Self {
        Self {
            link,
            old_name,
            new_name,
            viewport: None,
        }
    }
}

impl UndoableCommand for RenameLinkCommand {
    fn forward_request(&self) -> BackendRequest {
        BackendRequest::RenameLink {
            link: self.link,
            name: self.new_name.clone(),
        }
    }

    fn inverse_request(&self) -> BackendRequest {
        BackendRequest::RenameLink {
            link: self.link,
            name: self.old_name.clone(),
        }
    }

    fn absorb_restore(&mut self, _info: RestoreInfo) {}

    fn redo_description(&self) -> String {
        format!("Rename link to \"{}\"", self.new_name)
    }

    fn undo_description(&self) -> String {
        format!("Rename link back to \"{}\"", self.old_name)
    }

    command_plumbing!();
}

pub struct DeclutterLinkCommand {
    link: LinkId,
    declutter: bool,
    viewport: Option<ViewportContext>,
}

impl DeclutterLinkCommand {
    pub fn new(link: LinkId, declutter: bool) -> Self {
        Self {
            link,
            declutter,
            viewport: None,
        }
    }
}

impl UndoableCommand for DeclutterLinkCommand {
    fn forward_request(&self) -> BackendRequest {
        BackendRequest::SetLinkDeclutter {
            link: self.link,
            declutter: self.declutter,
        }
    }

    fn inverse_request(&self) -> BackendRequest {
        BackendRequest::SetLinkDeclutter {
            link: self.link,
            declutter: !self.declutter,
        }
    }

    fn absorb_restore(&mut self, _info: RestoreInfo) {}

    fn redo_description(&self) -> String {
        format!(
            "{} link declutter",
            if self.declutter { "Enable" } else { "Disable" }
        )
    }

    fn undo_description(&self) -> String {
        format!(
            "{} link declutter",
            if self.declutter { "Disable" } else { "Enable" }
        )
    }

    command_plumbing!();
}

pub struct AddWaypointCommand {
    link: LinkId,
    index: usize,
    position: egui::Pos2,
    restore: Option<WaypointRestoration>,
    viewport: Option<ViewportContext>,
}

impl AddWaypointCommand {
    pub fn new(link: LinkId, index: usize, position: egui::Pos2) -> Self {
        Self {
            link,
            index,
            position,
            restore: None,
            viewport: None,
        }
    }
}

impl UndoableCommand for AddWaypointCommand {
    fn forward_request(&self) -> BackendRequest {
        match &self.restore {
            Some(info) => BackendRequest::RestoreWaypoints {
                infos: vec![info.clone()],
            },
            None => BackendRequest::AddWaypoint {
                link: self.link,
                index: self.index,
                position: self.position,
            },
        }
    }

    fn inverse_request(&self) -> BackendRequest {
        let Some(info) = &self.restore else {
            unreachable!("inverse requested before first execution");
        };
        BackendRequest::RemoveWaypoint {
            link: self.link,
            waypoint: info.waypoint,
        }
    }

    fn absorb_restore(&mut self, info: RestoreInfo) {
        match info {
            RestoreInfo::Waypoint(info) => self.restore = Some(info),
            RestoreInfo::Waypoints(mut infos) => self.restore = infos.pop(),
            _ => {}
        }
    }

    fn redo_description(&self) -> String {
        "Add waypoint".to_owned()
    }

    fn undo_description(&self) -> String {
        "Remove added waypoint".to_owned()
    }

    command_plumbing!();
}

pub struct RemoveWaypointCommand {
    link: LinkId,
    waypoint: WaypointId,
    restore: Option<WaypointRestoration>,
    viewport: Option<ViewportContext>,
}

impl RemoveWaypointCommand {
    pub fn new(link: LinkId, waypoint: WaypointId) -> Self {
        Self {
            link,
            waypoint,
            restore: None,
            viewport: None,
        }
    }
}

impl UndoableCommand for RemoveWaypointCommand {
    fn forward_request(&self) -> BackendRequest {
        BackendRequest::RemoveWaypoint {
            link: self.link,
            waypoint: self.waypoint,
        }
    }

    fn inverse_request(&self) -> BackendRequest {
        let Some(info) = &self.restore else {
            unreachable!("inverse requested before first execution");
        };
        BackendRequest::RestoreWaypoints {
            infos: vec![info.clone()],
        }
    }

    fn absorb_restore(&mut self, info: RestoreInfo) {
        if let RestoreInfo::Waypoint(info) = info {
            self.restore = Some(info);
        }
    }

    fn redo_description(&self) -> String {
        "Remove waypoint".to_owned()
    }

    fn undo_description(&self) -> String {
        "Restore waypoint".to_owned()
    }

    command_plumbing!();
}

/// Clears a link's polyline in one step; undo brings every bend point back
/// at its old index.
pub struct RemoveAllWaypointsCommand {
    link: LinkId,
    restore: Vec<WaypointRestoration>,
    viewport: Option<ViewportContext>,
}

impl RemoveAllWaypointsCommand {
    pub fn new(link: LinkId) -> Self {
        Self {
            link,
            restore: Vec::new(),
            viewport: None,
        }
    }
}

impl UndoableCommand for RemoveAllWaypointsCommand {
    fn forward_request(&self) -> BackendRequest {
        BackendRequest::RemoveAllWaypoints { link: self.link }
    }

    fn inverse_request(&self) -> BackendRequest {
        BackendRequest::RestoreWaypoints {
            infos: self.restore.clone(),
        }
    }

    fn absorb_restore(&mut self, info: RestoreInfo) {
        if let RestoreInfo::Waypoints(infos) = info
            && !infos.is_empty()
        {
            self.restore = infos;
        }
    }

    fn redo_description(&self) -> String {
        "Remove all waypoints".to_owned()
    }

    fn undo_description(&self) -> String {
        format!("Restore {} waypoints", self.restore.len())
    }

    command_plumbing!();
}

pub struct MoveWaypointsCommand {
    moves: Vec<(WaypointId, egui::Pos2, egui::Pos2)>,
    viewport: Option<ViewportContext>,
}

impl MoveWaypointsCommand {
    pub fn new(moves: Vec<(WaypointId, egui::Pos2, egui::Pos2)>) -> Self {
        Self {
            moves,
            viewport: None,
        }
    }

    pub fn moves(&self) -> &[(WaypointId, egui::Pos2, egui::Pos2)] {
        &self.moves
    }
}

impl UndoableCommand for MoveWaypointsCommand {
    fn forward_request(&self) -> BackendRequest {
        BackendRequest::MoveWaypoints {
            moves: self.moves.iter().map(|(w, _, new)| (*w, *new)).collect(),
        }
    }

    fn inverse_request(&self) -> BackendRequest {
        BackendRequest::MoveWaypoints {
            moves: self.moves.iter().map(|(w, old, _)| (*w, *old)).collect(),
        }
    }

    fn absorb_restore(&mut self, _info: RestoreInfo) {}

    fn redo_description(&self) -> String {
        format!("Move {} waypoints", self.moves.len())
    }

    fn undo_description(&self) -> String {
        format!("Move {} waypoints back", self.moves.len())
    }

    command_plumbing!();
}

/// Moves parts under a new parent. Links that would cross the reparent
/// boundary are broken by the backend; undo restores them with the old
/// parentage.
pub struct ReparentPartsCommand {
    parts: Vec<PartId>,
    new_parent: PartId,
    restore: Option<ReparentRestoration>,
    viewport: Option<ViewportContext>,
}

impl ReparentPartsCommand {
    pub fn new(parts: Vec<PartId>, new_parent: PartId) -> Self {
        Self {
            parts,
            new_parent,
            restore: None,
            viewport: None,
        }
    }
}

impl UndoableCommand for ReparentPartsCommand {
    fn forward_request(&self) -> BackendRequest {
        BackendRequest::ReparentParts {
            parts: self.parts.clone(),
            new_parent: self.new_parent,
        }
    }

    fn inverse_request(&self) -> BackendRequest {
        let Some(info) = &self.restore else {
            unreachable!("inverse requested before first execution");
        };
        BackendRequest::RestoreReparent { info: info.clone() }
    }

    fn absorb_restore(&mut self, info: RestoreInfo) {
        if let RestoreInfo::Reparent(info) = info
            && self.restore.is_none()
        {
            self.restore = Some(info);
        }
    }

    fn redo_description(&self) -> String {
        format!("Reparent {} parts", self.parts.len())
    }

    fn undo_description(&self) -> String {
        format!("Restore parentage of {} parts", self.parts.len())
    }

    command_plumbing!();
}

/// Removal of parts into the clipboard. One restoration record per part, so
/// undo and redo apply uniformly regardless of how many were cut.
pub struct CutPartsCommand {
    parts: Vec<PartId>,
    restore: Vec<PartRestoration>,
    viewport: Option<ViewportContext>,
}

impl CutPartsCommand {
    pub fn new(parts: Vec<PartId>) -> Self {
        Self {
            parts,
            restore: Vec::new(),
            viewport: None,
        }
    }

    /// Clipboard payload captured by the cut.
    pub fn records(&self) -> &[PartRestoration] {
        &self.restore
    }
}

impl UndoableCommand for CutPartsCommand {
    fn forward_request(&self) -> BackendRequest {
        BackendRequest::RemoveParts {
            parts: self.parts.clone(),
        }
    }

    fn inverse_request(&self) -> BackendRequest {
        BackendRequest::RestoreParts {
            infos: self.restore.clone(),
        }
    }

    fn absorb_restore(&mut self, info: RestoreInfo) {
        if let RestoreInfo::Parts(infos) = info
            && !infos.is_empty()
        {
            self.restore = infos;
        }
    }

    fn redo_description(&self) -> String {
        format!("Cut {} parts", self.parts.len())
    }

    fn undo_description(&self) -> String {
        format!("Restore {} cut parts", self.parts.len())
    }

    command_plumbing!();
}

pub struct PastePartsCommand {
    parent: PartId,
    parts: Vec<PartRestoration>,
    restore: Vec<PartRestoration>,
    viewport: Option<ViewportContext>,
}

impl PastePartsCommand {
    pub fn new(parent: PartId, parts: Vec<PartRestoration>) -> Self {
        Self {
            parent,
            parts,
            restore: Vec::new(),
            viewport: None,
        }
    }
}

impl UndoableCommand for PastePartsCommand {
    fn forward_request(&self) -> BackendRequest {
        match self.restore.is_empty() {
            false => BackendRequest::RestoreParts {
                infos: self.restore.clone(),
            },
            true => BackendRequest::PasteParts {
                parent: self.parent,
                parts: self.parts.clone(),
            },
        }
    }

    fn inverse_request(&self) -> BackendRequest {
        BackendRequest::RemoveParts {
            parts: self.restore.iter().map(|e| e.part).collect(),
        }
    }

    fn absorb_restore(&mut self, info: RestoreInfo) {
        if let RestoreInfo::Parts(infos) = info
            && !infos.is_empty()
        {
            self.restore = infos;
        }
    }

    fn redo_description(&self) -> String {
        format!("Paste {} parts", self.parts.len())
    }

    fn undo_description(&self) -> String {
        format!("Remove {} pasted parts", self.parts.len())
    }

    command_plumbing!();
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::api::{LinkEndpoint, ScenarioApi};
    use crate::backend::testing::SharedScenario;
    use crate::backend::worker::BackendHandle;
    use crate::commands::{CommandStack, ViewportContext};
    use crate::common::config::Settings;

    struct Fixture {
        stack: CommandStack,
        backend: BackendHandle,
        scenario: SharedScenario,
        root: PartId,
    }

    fn fixture() -> Fixture {
        let (scenario, root) = SharedScenario::with_root();
        let backend = BackendHandle::spawn(scenario.clone());
        let stack = CommandStack::new(&Settings::default());
        Fixture {
            stack,
            backend,
            scenario,
            root,
        }
    }

    impl Fixture {
        fn viewport(&self) -> ViewportContext {
            ViewportContext {
                actor: self.root,
                center: egui::Pos2::ZERO,
                zoom: 1.0,
            }
        }

        fn settle(&mut self) {
            let (request, result) = self.backend.wait_reply().expect("backend reply");
            self.stack.on_reply(request, result);
        }

        /// Undo immediately followed by redo must restore the model
        /// bit-for-bit in both directions.
        fn round_trip(&mut self, command: Box<dyn UndoableCommand>) {
            let vp = self.viewport();
            let before = self.scenario.dump();
            assert!(self.stack.push(command, vp, &mut self.backend));
            self.settle();
            let after = self.scenario.dump();
            assert_ne!(before, after, "command had no effect");

            assert!(self.stack.undo(vp, &mut self.backend));
            self.settle();
            assert_eq!(self.scenario.dump(), before, "undo did not restore");

            assert!(self.stack.redo(vp, &mut self.backend));
            self.settle();
            assert_eq!(self.scenario.dump(), after, "redo did not replay");
        }
    }

    #[test]
    fn test_add_part_round_trip() {
        let mut f = fixture();
        let root = f.root;
        f.round_trip(Box::new(AddPartCommand::new(
            root,
            "pump".to_owned(),
            egui::Pos2::new(10.0, 20.0),
        )));
    }

    #[test]
    fn test_remove_part_round_trip_restores_links() {
        let mut f = fixture();
        let (a, b) = {
            let mut s = f.scenario.lock();
            let a = s.seed_part(f.root, "a", egui::Pos2::ZERO);
            let b = s.seed_part(f.root, "b", egui::Pos2::new(200.0, 0.0));
            s.execute(BackendRequest::CreateLink {
                source: LinkEndpoint::Part(a),
                target: LinkEndpoint::Part(b),
                waypoints: vec![egui::Pos2::new(100.0, 50.0)],
            })
            .unwrap();
            (a, b)
        };
        let _ = b;
        f.round_trip(Box::new(RemovePartCommand::new(a, "a".to_owned())));
    }

    #[test]
    fn test_positions_round_trip() {
        let mut f = fixture();
        let part = f.scenario.lock().seed_part(f.root, "a", egui::Pos2::ZERO);
        f.round_trip(Box::new(PartsPositionsCommand::new(vec![(
            part,
            egui::Pos2::ZERO,
            egui::Pos2::new(10.0, 5.0),
        )])));
    }

    #[test]
    fn test_rename_round_trip() {
        let mut f = fixture();
        let part = f.scenario.lock().seed_part(f.root, "a", egui::Pos2::ZERO);
        f.round_trip(Box::new(RenamePartCommand::new(
            part,
            "a".to_owned(),
            "b".to_owned(),
        )));
    }

    #[test]
    fn test_resize_frame_round_trip() {
        let mut f = fixture();
        let part = f.scenario.lock().seed_part(f.root, "a", egui::Pos2::ZERO);
        f.round_trip(Box::new(ResizeFrameCommand::new(
            part,
            egui::Rect::from_min_size(egui::Pos2::ZERO, egui::Vec2::new(120.0, 80.0)),
            egui::Rect::from_min_size(egui::Pos2::new(5.0, 5.0), egui::Vec2::new(200.0, 100.0)),
        )));
    }

    #[test]
    fn test_detail_level_round_trip() {
        let mut f = fixture();
        let part = f.scenario.lock().seed_part(f.root, "a", egui::Pos2::ZERO);
        f.round_trip(Box::new(DetailLevelCommand::new(part, 0, 2)));
    }

    #[test]
    fn test_run_role_round_trip() {
        let mut f = fixture();
        let part = f.scenario.lock().seed_part(f.root, "a", egui::Pos2::ZERO);
        f.round_trip(Box::new(ToggleRunRoleCommand::new(part, true)));
    }

    #[test]
    fn test_ifx_level_round_trip() {
        let mut f = fixture();
        let port = {
            let mut s = f.scenario.lock();
            let part = s.seed_part(f.root, "a", egui::Pos2::ZERO);
            s.seed_port(part, PortSide::Left, 0)
        };
        f.round_trip(Box::new(IfxLevelCommand::new(port, 3)));
    }

    #[test]
    fn test_port_placement_round_trip() {
        let mut f = fixture();
        let port = {
            let mut s = f.scenario.lock();
            let part = s.seed_part(f.root, "a", egui::Pos2::ZERO);
            s.seed_port(part, PortSide::Left, 0)
        };
        f.round_trip(Box::new(MoveIfxPortCommand::new(
            port,
            (PortSide::Left, 0),
            (PortSide::Right, 2),
        )));
    }

    #[test]
    fn test_create_link_round_trip() {
        let mut f = fixture();
        let (a, b) = {
            let mut s = f.scenario.lock();
            (
                s.seed_part(f.root, "a", egui::Pos2::ZERO),
                s.seed_part(f.root, "b", egui::Pos2::new(300.0, 0.0)),
            )
        };
        f.round_trip(Box::new(CreateLinkCommand::new(
            LinkEndpoint::Part(a),
            LinkEndpoint::Part(b),
            vec![egui::Pos2::new(150.0, 100.0), egui::Pos2::new(250.0, 100.0)],
        )));
    }

    #[test]
    fn test_retarget_link_round_trip() {
        let mut f = fixture();
        let (link, b, c) = {
            let mut s = f.scenario.lock();
            let a = s.seed_part(f.root, "a", egui::Pos2::ZERO);
            let b = s.seed_part(f.root, "b", egui::Pos2::new(300.0, 0.0));
            let c = s.seed_part(f.root, "c", egui::Pos2::new(300.0, 300.0));
            let info = s
                .execute(BackendRequest::CreateLink {
                    source: LinkEndpoint::Part(a),
                    target: LinkEndpoint::Part(b),
                    waypoints: vec![],
                })
                .unwrap();
            let RestoreInfo::Link(info) = info else {
                panic!("unexpected restore info");
            };
            (info.link, b, c)
        };
        let _ = b;
        f.round_trip(Box::new(RetargetLinkCommand::new(
            link,
            LinkEndpoint::Part(b),
            LinkEndpoint::Part(c),
        )));
    }

    #[test]
    fn test_declutter_round_trip() {
        let mut f = fixture();
        let link = {
            let mut s = f.scenario.lock();
            let a = s.seed_part(f.root, "a", egui::Pos2::ZERO);
            let b = s.seed_part(f.root, "b", egui::Pos2::new(300.0, 0.0));
            let RestoreInfo::Link(info) = s
                .execute(BackendRequest::CreateLink {
                    source: LinkEndpoint::Part(a),
                    target: LinkEndpoint::Part(b),
                    waypoints: vec![],
                })
                .unwrap()
            else {
                panic!("unexpected restore info");
            };
            info.link
        };
        f.round_trip(Box::new(DeclutterLinkCommand::new(link, true)));
    }

    #[test]
    fn test_waypoint_commands_round_trip() {
        let mut f = fixture();
        let (link, wp) = {
            let mut s = f.scenario.lock();
            let a = s.seed_part(f.root, "a", egui::Pos2::ZERO);
            let b = s.seed_part(f.root, "b", egui::Pos2::new(300.0, 0.0));
            let RestoreInfo::Link(info) = s
                .execute(BackendRequest::CreateLink {
                    source: LinkEndpoint::Part(a),
                    target: LinkEndpoint::Part(b),
                    waypoints: vec![egui::Pos2::new(100.0, 40.0), egui::Pos2::new(200.0, 40.0)],
                })
                .unwrap()
            else {
                panic!("unexpected restore info");
            };
            (info.link, info.waypoints[0].0)
        };

        f.round_trip(Box::new(AddWaypointCommand::new(
            link,
            1,
            egui::Pos2::new(150.0, 80.0),
        )));
        f.round_trip(Box::new(RemoveWaypointCommand::new(link, wp)));
        f.round_trip(Box::new(MoveWaypointsCommand::new(vec![(
            wp,
            egui::Pos2::new(100.0, 40.0),
            egui::Pos2::new(100.0, 90.0),
        )])));
        f.round_trip(Box::new(RemoveAllWaypointsCommand::new(link)));
    }

    #[test]
    fn test_reparent_round_trip_severs_crossing_links() {
        let mut f = fixture();
        let (a, c) = {
            let mut s = f.scenario.lock();
            let a = s.seed_part(f.root, "a", egui::Pos2::ZERO);
            let b = s.seed_part(f.root, "b", egui::Pos2::new(300.0, 0.0));
            let c = s.seed_part(f.root, "c", egui::Pos2::new(0.0, 300.0));
            s.execute(BackendRequest::CreateLink {
                source: LinkEndpoint::Part(a),
                target: LinkEndpoint::Part(b),
                waypoints: vec![],
            })
            .unwrap();
            (a, c)
        };
        f.round_trip(Box::new(ReparentPartsCommand::new(vec![a], c)));
    }

    #[test]
    fn test_cut_and_paste_round_trips() {
        let mut f = fixture();
        let (a, b) = {
            let mut s = f.scenario.lock();
            (
                s.seed_part(f.root, "a", egui::Pos2::ZERO),
                s.seed_part(f.root, "b", egui::Pos2::new(300.0, 0.0)),
            )
        };

        let vp = f.viewport();
        let before_cut = f.scenario.dump();
        f.stack.push(
            Box::new(CutPartsCommand::new(vec![a, b])),
            vp,
            &mut f.backend,
        );
        f.settle();
        let records = f
            .stack
            .find_previous::<CutPartsCommand>()
            .expect("cut on the stack")
            .records()
            .to_vec();
        assert_eq!(records.len(), 2);

        assert!(f.stack.undo(vp, &mut f.backend));
        f.settle();
        assert_eq!(f.scenario.dump(), before_cut);

        // Paste the clipboard records back under the root with fresh ids.
        let mut pasted = records;
        for record in &mut pasted {
            record.part = PartId::now_v7();
            record.position += egui::Vec2::new(20.0, 20.0);
            record.links.clear();
        }
        f.round_trip(Box::new(PastePartsCommand::new(f.root, pasted)));
    }

    #[test]
    fn test_rename_link_round_trip() {
        let mut f = fixture();
        let link = {
            let mut s = f.scenario.lock();
            let a = s.seed_part(f.root, "a", egui::Pos2::ZERO);
            let b = s.seed_part(f.root, "b", egui::Pos2::new(300.0, 0.0));
            let RestoreInfo::Link(info) = s
                .execute(BackendRequest::CreateLink {
                    source: LinkEndpoint::Part(a),
                    target: LinkEndpoint::Part(b),
                    waypoints: vec![],
                })
                .unwrap()
            else {
                panic!("unexpected restore info");
            };
            info.link
        };
        f.round_trip(Box::new(RenameLinkCommand::new(
            link,
            String::new(),
            "flow".to_owned(),
        )));
    }
}
