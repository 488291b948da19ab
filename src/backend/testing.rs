//! In-memory [`ScenarioApi`] used by the crate's own tests.

use eframe::egui;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::api::*;
use crate::common::ids::{LinkId, PartId, PortId, WaypointId};

#[derive(Clone, Debug)]
struct MemPart {
    parent: PartId,
    name: String,
    position: egui::Pos2,
    size: egui::Vec2,
    detail_level: u8,
    run_role: bool,
    ports: Vec<PortRestoration>,
}

#[derive(Clone, Debug)]
struct MemLink {
    source: LinkEndpoint,
    target: LinkEndpoint,
    name: String,
    declutter: bool,
    waypoints: Vec<(WaypointId, egui::Pos2)>,
}

pub struct MemoryScenario {
    parts: HashMap<PartId, MemPart>,
    links: HashMap<LinkId, MemLink>,
    notifications: Vec<Notification>,
    /// When set, the next `execute` fails with this error instead.
    pub fail_next: Option<BackendError>,
}

impl MemoryScenario {
    pub fn with_root() -> (Self, PartId) {
        let root = PartId::now_v7();
        let mut parts = HashMap::new();
        parts.insert(
            root,
            MemPart {
                parent: root,
                name: "root".to_owned(),
                position: egui::Pos2::ZERO,
                size: egui::Vec2::new(800.0, 600.0),
                detail_level: 0,
                run_role: false,
                ports: Vec::new(),
            },
        );
        (
            Self {
                parts,
                links: HashMap::new(),
                notifications: Vec::new(),
                fail_next: None,
            },
            root,
        )
    }

    pub fn seed_part(&mut self, parent: PartId, name: &str, position: egui::Pos2) -> PartId {
        let part = PartId::now_v7();
        self.parts.insert(
            part,
            MemPart {
                parent,
                name: name.to_owned(),
                position,
                size: egui::Vec2::new(120.0, 80.0),
                detail_level: 0,
                run_role: false,
                ports: Vec::new(),
            },
        );
        self.note_part_added(part);
        part
    }

    pub fn seed_port(&mut self, part: PartId, side: PortSide, row: i32) -> PortId {
        let port = PortId::now_v7();
        self.parts.get_mut(&part).unwrap().ports.push(PortRestoration {
            port,
            side,
            row,
            ifx_level: 0,
        });
        self.notifications.push(Notification::PortAdded {
            port,
            part,
            side,
            row,
            ifx_level: 0,
        });
        port
    }

    /// Canonical text dump of the whole model, for equality assertions.
    pub fn dump(&self) -> String {
        let mut parts: Vec<_> = self.parts.iter().collect();
        parts.sort_by_key(|(id, _)| **id);
        let mut links: Vec<_> = self.links.iter().collect();
        links.sort_by_key(|(id, _)| **id);
        format!("{:?}\n{:?}", parts, links)
    }

    fn note_part_added(&mut self, part: PartId) {
        let p = &self.parts[&part];
        self.notifications.push(Notification::PartAdded {
            part,
            parent: p.parent,
            name: Arc::new(p.name.clone()),
            position: p.position,
            size: p.size,
        });
        for port in p.ports.clone() {
            self.notifications.push(Notification::PortAdded {
                port: port.port,
                part,
                side: port.side,
                row: port.row,
                ifx_level: port.ifx_level,
            });
        }
    }

    fn note_link_added(&mut self, link: LinkId) {
        let l = &self.links[&link];
        self.notifications.push(Notification::LinkAdded {
            link,
            source: l.source,
            target: l.target,
            name: Arc::new(l.name.clone()),
            waypoints: l.waypoints.clone(),
        });
    }

    fn part_restoration(&self, part: PartId, links: Vec<LinkRestoration>) -> PartRestoration {
        let p = &self.parts[&part];
        PartRestoration {
            part,
            parent: p.parent,
            name: p.name.clone(),
            position: p.position,
            size: p.size,
            detail_level: p.detail_level,
            run_role: p.run_role,
            ports: p.ports.clone(),
            links,
        }
    }

    fn link_restoration(&self, link: LinkId) -> LinkRestoration {
        let l = &self.links[&link];
        LinkRestoration {
            link,
            source: l.source,
            target: l.target,
            name: l.name.clone(),
            declutter: l.declutter,
            waypoints: l.waypoints.clone(),
        }
    }

    fn endpoint_part(&self, endpoint: LinkEndpoint) -> Option<PartId> {
        match endpoint {
            LinkEndpoint::Part(p) => Some(p),
            LinkEndpoint::Port(port) => self
                .parts
                .iter()
                .find(|(_, p)| p.ports.iter().any(|e| e.port == port))
                .map(|(id, _)| *id),
        }
    }

    fn find_port(&mut self, port: PortId) -> Option<&mut PortRestoration> {
        self.parts
            .values_mut()
            .flat_map(|p| p.ports.iter_mut())
            .find(|e| e.port == port)
    }

    fn remove_links_touching(&mut self, part: PartId) -> Vec<LinkRestoration> {
        let ports: Vec<PortId> = self.parts[&part].ports.iter().map(|e| e.port).collect();
        let touches = |e: LinkEndpoint| match e {
            LinkEndpoint::Part(p) => p == part,
            LinkEndpoint::Port(p) => ports.contains(&p),
        };
        let doomed: Vec<LinkId> = self
            .links
            .iter()
            .filter(|(_, l)| touches(l.source) || touches(l.target))
            .map(|(id, _)| *id)
            .collect();
        let mut restorations = Vec::new();
        for link in doomed {
            restorations.push(self.link_restoration(link));
            self.links.remove(&link);
            self.notifications.push(Notification::LinkRemoved { link });
        }
        restorations
    }

    fn insert_link(&mut self, info: &LinkRestoration) {
        self.links.insert(
            info.link,
            MemLink {
                source: info.source,
                target: info.target,
                name: info.name.clone(),
                declutter: info.declutter,
                waypoints: info.waypoints.clone(),
            },
        );
        self.note_link_added(info.link);
    }

    fn insert_part(&mut self, info: &PartRestoration) {
        self.parts.insert(
            info.part,
            MemPart {
                parent: info.parent,
                name: info.name.clone(),
                position: info.position,
                size: info.size,
                detail_level: info.detail_level,
                run_role: info.run_role,
                ports: info.ports.clone(),
            },
        );
        self.note_part_added(info.part);
        for link in info.links.clone() {
            self.insert_link(&link);
        }
    }
}

impl ScenarioApi for MemoryScenario {
    fn execute(&mut self, request: BackendRequest) -> Result<RestoreInfo, BackendError> {
        if let Some(err) = self.fail_next.take() {
            return Err(err);
        }

        match request {
            BackendRequest::CreateChildPart { parent, name, position } => {
                if !self.parts.contains_key(&parent) {
                    return Err(BackendError::UnknownPart(parent));
                }
                let part = PartId::now_v7();
                self.parts.insert(
                    part,
                    MemPart {
                        parent,
                        name,
                        position,
                        size: egui::Vec2::new(120.0, 80.0),
                        detail_level: 0,
                        run_role: false,
                        ports: Vec::new(),
                    },
                );
                self.note_part_added(part);
                Ok(RestoreInfo::Part(self.part_restoration(part, Vec::new())))
            }
            BackendRequest::RemoveChildPart { part } => {
                if !self.parts.contains_key(&part) {
                    return Err(BackendError::UnknownPart(part));
                }
                let links = self.remove_links_touching(part);
                let restoration = self.part_restoration(part, links);
                self.parts.remove(&part);
                self.notifications.push(Notification::PartRemoved { part });
                Ok(RestoreInfo::Part(restoration))
            }
            BackendRequest::RestoreChildPart { info } => {
                self.insert_part(&info);
                Ok(RestoreInfo::Part(info))
            }
            BackendRequest::SetPositions { moves } => {
                let mut previous = Vec::with_capacity(moves.len());
                for (part, position) in moves {
                    let p = self
                        .parts
                        .get_mut(&part)
                        .ok_or(BackendError::UnknownPart(part))?;
                    previous.push((part, p.position));
                    p.position = position;
                    self.notifications
                        .push(Notification::PositionChanged { part, position });
                }
                Ok(RestoreInfo::Positions(previous))
            }
            BackendRequest::SetFrame { part, position, size } => {
                let p = self
                    .parts
                    .get_mut(&part)
                    .ok_or(BackendError::UnknownPart(part))?;
                let previous = (p.position, p.size);
                p.position = position;
                p.size = size;
                self.notifications
                    .push(Notification::PositionChanged { part, position });
                self.notifications.push(Notification::SizeChanged { part, size });
                Ok(RestoreInfo::Frame {
                    part,
                    position: previous.0,
                    size: previous.1,
                })
            }
            BackendRequest::SetName { part, name } => {
                let p = self
                    .parts
                    .get_mut(&part)
                    .ok_or(BackendError::UnknownPart(part))?;
                let previous = std::mem::replace(&mut p.name, name.clone());
                self.notifications.push(Notification::NameChanged {
                    part,
                    name: Arc::new(name),
                });
                Ok(RestoreInfo::Name { previous })
            }
            BackendRequest::SetDetailLevel { part, level } => {
                let p = self
                    .parts
                    .get_mut(&part)
                    .ok_or(BackendError::UnknownPart(part))?;
                let previous = std::mem::replace(&mut p.detail_level, level);
                Ok(RestoreInfo::DetailLevel { previous })
            }
            BackendRequest::SetRunRole { part, enabled } => {
                let p = self
                    .parts
                    .get_mut(&part)
                    .ok_or(BackendError::UnknownPart(part))?;
                let previous = std::mem::replace(&mut p.run_role, enabled);
                Ok(RestoreInfo::RunRole { previous })
            }
            BackendRequest::SetIfxLevel { port, level } => {
                let entry = self.find_port(port).ok_or(BackendError::UnknownPort(port))?;
                let previous = std::mem::replace(&mut entry.ifx_level, level);
                self.notifications
                    .push(Notification::IfxLevelChanged { port, level });
                Ok(RestoreInfo::IfxLevel(IfxLevelRestoration {
                    port,
                    level: previous,
                }))
            }
            BackendRequest::RestoreIfxLevel { info } => {
                let entry = self
                    .find_port(info.port)
                    .ok_or(BackendError::UnknownPort(info.port))?;
                let previous = std::mem::replace(&mut entry.ifx_level, info.level);
                self.notifications.push(Notification::IfxLevelChanged {
                    port: info.port,
                    level: info.level,
                });
                Ok(RestoreInfo::IfxLevel(IfxLevelRestoration {
                    port: info.port,
                    level: previous,
                }))
            }
            BackendRequest::SetPortPlacement { port, side, row } => {
                let entry = self.find_port(port).ok_or(BackendError::UnknownPort(port))?;
                let previous = (entry.side, entry.row);
                entry.side = side;
                entry.row = row;
                self.notifications
                    .push(Notification::PortPlacementChanged { port, side, row });
                Ok(RestoreInfo::PortPlacement {
                    port,
                    side: previous.0,
                    row: previous.1,
                })
            }
            BackendRequest::CreateLink { source, target, waypoints } => {
                if self.endpoint_part(source).is_none() {
                    return Err(BackendError::LinkRejected("unknown source".to_owned()));
                }
                if self.endpoint_part(target).is_none() {
                    return Err(BackendError::LinkRejected("unknown target".to_owned()));
                }
                if self
                    .links
                    .values()
                    .any(|l| l.source == source && l.target == target)
                {
                    return Err(BackendError::LinkRejected("duplicate link".to_owned()));
                }
                let link = LinkId::now_v7();
                self.links.insert(
                    link,
                    MemLink {
                        source,
                        target,
                        name: String::new(),
                        declutter: false,
                        waypoints: waypoints
                            .into_iter()
                            .map(|p| (WaypointId::now_v7(), p))
                            .collect(),
                    },
                );
                self.note_link_added(link);
                Ok(RestoreInfo::Link(self.link_restoration(link)))
            }
            BackendRequest::RemoveLink { link } => {
                if !self.links.contains_key(&link) {
                    return Err(BackendError::UnknownLink(link));
                }
                let restoration = self.link_restoration(link);
                self.links.remove(&link);
                self.notifications.push(Notification::LinkRemoved { link });
                Ok(RestoreInfo::Link(restoration))
            }
            BackendRequest::RestoreOutgoingLink { info } => {
                self.insert_link(&info);
                Ok(RestoreInfo::Link(info))
            }
            BackendRequest::RetargetLink { link, target } => {
                let l = self
                    .links
                    .get_mut(&link)
                    .ok_or(BackendError::UnknownLink(link))?;
                let previous_target = std::mem::replace(&mut l.target, target);
                self.notifications
                    .push(Notification::TargetChanged { link, target });
                Ok(RestoreInfo::Retarget(RetargetRestoration {
                    link,
                    previous_target,
                }))
            }
            BackendRequest::RestoreRetargetedLink { info } => {
                let l = self
                    .links
                    .get_mut(&info.link)
                    .ok_or(BackendError::UnknownLink(info.link))?;
                let previous_target = std::mem::replace(&mut l.target, info.previous_target);
                self.notifications.push(Notification::TargetChanged {
                    link: info.link,
                    target: info.previous_target,
                });
                Ok(RestoreInfo::Retarget(RetargetRestoration {
                    link: info.link,
                    previous_target,
                }))
            }
            BackendRequest::RenameLink { link, name } => {
                let l = self
                    .links
                    .get_mut(&link)
                    .ok_or(BackendError::UnknownLink(link))?;
                let previous = std::mem::replace(&mut l.name, name);
                Ok(RestoreInfo::Name { previous })
            }
            BackendRequest::SetLinkDeclutter { link, declutter } => {
                let l = self
                    .links
                    .get_mut(&link)
                    .ok_or(BackendError::UnknownLink(link))?;
                let previous = std::mem::replace(&mut l.declutter, declutter);
                self.notifications
                    .push(Notification::DeclutterChanged { link, declutter });
                Ok(RestoreInfo::Declutter { previous })
            }
            BackendRequest::AddWaypoint { link, index, position } => {
                let l = self
                    .links
                    .get_mut(&link)
                    .ok_or(BackendError::UnknownLink(link))?;
                let waypoint = WaypointId::now_v7();
                let index = index.min(l.waypoints.len());
                l.waypoints.insert(index, (waypoint, position));
                self.notifications.push(Notification::WaypointAdded {
                    link,
                    waypoint,
                    index,
                    position,
                });
                Ok(RestoreInfo::Waypoint(WaypointRestoration {
                    link,
                    waypoint,
                    index,
                    position,
                }))
            }
            BackendRequest::RemoveWaypoint { link, waypoint } => {
                let l = self
                    .links
                    .get_mut(&link)
                    .ok_or(BackendError::UnknownLink(link))?;
                let index = l
                    .waypoints
                    .iter()
                    .position(|(id, _)| *id == waypoint)
                    .ok_or(BackendError::UnknownWaypoint(waypoint))?;
                let (_, position) = l.waypoints.remove(index);
                self.notifications
                    .push(Notification::WaypointRemoved { link, waypoint });
                Ok(RestoreInfo::Waypoint(WaypointRestoration {
                    link,
                    waypoint,
                    index,
                    position,
                }))
            }
            BackendRequest::RemoveAllWaypoints { link } => {
                let l = self
                    .links
                    .get_mut(&link)
                    .ok_or(BackendError::UnknownLink(link))?;
                let drained: Vec<(WaypointId, egui::Pos2)> = l.waypoints.drain(..).collect();
                let mut infos = Vec::with_capacity(drained.len());
                for (index, (waypoint, position)) in drained.into_iter().enumerate() {
                    self.notifications
                        .push(Notification::WaypointRemoved { link, waypoint });
                    infos.push(WaypointRestoration {
                        link,
                        waypoint,
                        index,
                        position,
                    });
                }
                Ok(RestoreInfo::Waypoints(infos))
            }
            BackendRequest::RestoreWaypoints { infos } => {
                let mut sorted = infos.clone();
                sorted.sort_by_key(|e| e.index);
                for info in &sorted {
                    let l = self
                        .links
                        .get_mut(&info.link)
                        .ok_or(BackendError::UnknownLink(info.link))?;
                    let index = info.index.min(l.waypoints.len());
                    l.waypoints.insert(index, (info.waypoint, info.position));
                    self.notifications.push(Notification::WaypointAdded {
                        link: info.link,
                        waypoint: info.waypoint,
                        index,
                        position: info.position,
                    });
                }
                Ok(RestoreInfo::Waypoints(infos))
            }
            BackendRequest::MoveWaypoints { moves } => {
                let mut previous = Vec::with_capacity(moves.len());
                for (waypoint, position) in moves {
                    let entry = self
                        .links
                        .values_mut()
                        .flat_map(|l| l.waypoints.iter_mut())
                        .find(|(id, _)| *id == waypoint)
                        .ok_or(BackendError::UnknownWaypoint(waypoint))?;
                    previous.push((waypoint, entry.1));
                    entry.1 = position;
                    self.notifications
                        .push(Notification::WaypointMoved { waypoint, position });
                }
                Ok(RestoreInfo::WaypointPositions(previous))
            }
            BackendRequest::ReparentParts { parts, new_parent } => {
                if !self.parts.contains_key(&new_parent) {
                    return Err(BackendError::UnknownPart(new_parent));
                }
                let mut moves = Vec::with_capacity(parts.len());
                let mut severed = Vec::new();
                for part in &parts {
                    let old_parent = self
                        .parts
                        .get(part)
                        .ok_or(BackendError::UnknownPart(*part))?
                        .parent;
                    moves.push((*part, old_parent));
                }
                // Links crossing the reparent boundary do not survive.
                let crossing: Vec<LinkId> = self
                    .links
                    .iter()
                    .filter(|(_, l)| {
                        let s = self.endpoint_part(l.source);
                        let t = self.endpoint_part(l.target);
                        match (s, t) {
                            (Some(s), Some(t)) => {
                                parts.contains(&s) != parts.contains(&t)
                            }
                            _ => false,
                        }
                    })
                    .map(|(id, _)| *id)
                    .collect();
                for link in crossing {
                    severed.push(self.link_restoration(link));
                    self.links.remove(&link);
                    self.notifications.push(Notification::LinkRemoved { link });
                }
                for part in &parts {
                    self.parts.get_mut(part).unwrap().parent = new_parent;
                }
                Ok(RestoreInfo::Reparent(ReparentRestoration { moves, severed }))
            }
            BackendRequest::RestoreReparent { info } => {
                for (part, old_parent) in &info.moves {
                    let p = self
                        .parts
                        .get_mut(part)
                        .ok_or(BackendError::UnknownPart(*part))?;
                    p.parent = *old_parent;
                }
                for link in &info.severed {
                    self.insert_link(link);
                }
                Ok(RestoreInfo::Reparent(info))
            }
            BackendRequest::PasteParts { parent, parts } => {
                if !self.parts.contains_key(&parent) {
                    return Err(BackendError::UnknownPart(parent));
                }
                let mut infos = Vec::with_capacity(parts.len());
                for mut info in parts {
                    info.parent = parent;
                    self.insert_part(&info);
                    infos.push(info);
                }
                Ok(RestoreInfo::Parts(infos))
            }
            BackendRequest::RemoveParts { parts } => {
                let mut infos = Vec::with_capacity(parts.len());
                for part in parts {
                    if !self.parts.contains_key(&part) {
                        return Err(BackendError::UnknownPart(part));
                    }
                    let links = self.remove_links_touching(part);
                    infos.push(self.part_restoration(part, links));
                    self.parts.remove(&part);
                    self.notifications.push(Notification::PartRemoved { part });
                }
                Ok(RestoreInfo::Parts(infos))
            }
            BackendRequest::RestoreParts { infos } => {
                for info in &infos {
                    self.insert_part(info);
                }
                Ok(RestoreInfo::Parts(infos))
            }
        }
    }

    fn drain_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }
}

/// A [`MemoryScenario`] behind a lock, so a test can keep inspecting the
/// model while the worker thread owns the API side.
#[derive(Clone)]
pub struct SharedScenario(Arc<Mutex<MemoryScenario>>);

impl SharedScenario {
    pub fn with_root() -> (Self, PartId) {
        let (scenario, root) = MemoryScenario::with_root();
        (Self(Arc::new(Mutex::new(scenario))), root)
    }

    pub fn lock(&self) -> MutexGuard<'_, MemoryScenario> {
        self.0.lock().unwrap()
    }

    pub fn dump(&self) -> String {
        self.lock().dump()
    }
}

impl ScenarioApi for SharedScenario {
    fn execute(&mut self, request: BackendRequest) -> Result<RestoreInfo, BackendError> {
        self.lock().execute(request)
    }

    fn drain_notifications(&mut self) -> Vec<Notification> {
        self.lock().drain_notifications()
    }
}
