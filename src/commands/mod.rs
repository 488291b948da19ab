use eframe::egui;
use std::any::Any;

use crate::backend::api::{BackendError, BackendRequest, RequestId, RestoreInfo};
use crate::backend::worker::BackendHandle;
use crate::common::config::Settings;
use crate::common::ids::PartId;

pub mod ops;

/// Which sub-scene and camera were visible when a command was created. Undo
/// and redo restore this view before replaying their visual effect, so the
/// user is never teleported blind.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewportContext {
    pub actor: PartId,
    pub center: egui::Pos2,
    pub zoom: f32,
}

impl ViewportContext {
    pub fn matches(&self, live: &ViewportContext, pos_tolerance: f32, zoom_tolerance: f32) -> bool {
        self.actor == live.actor
            && (self.zoom - live.zoom).abs() <= zoom_tolerance
            && self.center.distance(live.center) <= pos_tolerance
    }
}

/// One reversible backend mutation.
///
/// The protocol has three phases. The first execution ("try-do") runs when
/// the stack accepts the command; only on success does the command enter the
/// history. `undo` runs the inverse using the restoration value absorbed from
/// the last successful execution. `redo` re-runs the forward mutation and is
/// meaningful only after at least one undo.
pub trait UndoableCommand: Any + Send {
    /// The forward mutation. Called for try-do and redo; implementations use
    /// their absorbed restoration state on redo so nothing is recomputed.
    fn forward_request(&self) -> BackendRequest;

    /// The inverse mutation. Only called after a successful execution.
    fn inverse_request(&self) -> BackendRequest;

    /// Stores the restoration value a successful execution returned.
    fn absorb_restore(&mut self, info: RestoreInfo);

    fn redo_description(&self) -> String;
    fn undo_description(&self) -> String;
    fn try_do_description(&self) -> String {
        self.redo_description()
    }

    fn viewport(&self) -> Option<&ViewportContext>;
    fn set_viewport(&mut self, viewport: ViewportContext);

    fn as_any(&self) -> &dyn Any;
}

/// What the stack tells the surrounding application.
pub enum StackEvent {
    /// A backend request is in flight; show or clear the busy indicator.
    Busy(bool),
    Applied {
        description: String,
    },
    Undone {
        description: String,
    },
    Redone {
        description: String,
    },
    /// The mutation failed; nothing changed. For a failed try-do the
    /// discarded command rides along so the scene can roll back any local
    /// visual feedback.
    Failed {
        action: String,
        error: BackendError,
        command: Option<Box<dyn UndoableCommand>>,
    },
    /// Undo/redo was deferred: re-navigate to this viewport first.
    NavigateViewport(ViewportContext),
}

impl std::fmt::Debug for StackEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StackEvent::Busy(b) => write!(f, "Busy({})", b),
            StackEvent::Applied { description } => write!(f, "Applied({})", description),
            StackEvent::Undone { description } => write!(f, "Undone({})", description),
            StackEvent::Redone { description } => write!(f, "Redone({})", description),
            StackEvent::Failed { action, error, .. } => {
                write!(f, "Failed({}: {})", action, error)
            }
            StackEvent::NavigateViewport(v) => write!(f, "NavigateViewport({:?})", v),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    TryDo,
    Undo,
    Redo,
}

struct Pending {
    phase: Phase,
    request: RequestId,
    /// Present during try-do; the command joins the history on success.
    command: Option<Box<dyn UndoableCommand>>,
    index: usize,
}

struct Entry {
    command: Box<dyn UndoableCommand>,
    undone_once: bool,
}

/// Linear undo history with a cursor separating done from undone commands.
///
/// The `active` flag is the only mutual exclusion: while a request is
/// outstanding the stack rejects new pushes, so at most one mutation is ever
/// in flight and completions arrive in issue order.
pub struct CommandStack {
    entries: Vec<Entry>,
    cursor: usize,
    active: bool,
    pending: Option<Pending>,
    pos_tolerance: f32,
    zoom_tolerance: f32,
    events: Vec<StackEvent>,
}

impl CommandStack {
    pub fn new(settings: &Settings) -> Self {
        Self {
            entries: Vec::new(),
            cursor: 0,
            active: true,
            pending: None,
            pos_tolerance: settings.viewport_pos_tolerance,
            zoom_tolerance: settings.viewport_zoom_tolerance,
            events: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn can_undo(&self) -> bool {
        self.active && self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.active && self.cursor < self.entries.len()
    }

    /// Accepts a new command and fires its first execution. Returns false if
    /// the stack is deactivated by an in-flight command; the command is then
    /// dropped without side effects.
    pub fn push(
        &mut self,
        mut command: Box<dyn UndoableCommand>,
        viewport: ViewportContext,
        backend: &mut BackendHandle,
    ) -> bool {
        if !self.active {
            log::warn!(
                "command rejected while another is in flight: {}",
                command.try_do_description()
            );
            return false;
        }
        command.set_viewport(viewport);
        log::info!("{}", command.try_do_description());
        self.active = false;
        self.events.push(StackEvent::Busy(true));
        let request = backend.submit(command.forward_request());
        self.pending = Some(Pending {
            phase: Phase::TryDo,
            request,
            command: Some(command),
            index: 0,
        });
        true
    }

    /// Undoes the command below the cursor. If the live viewport differs from
    /// the one saved in the command, only a re-navigation is requested and
    /// the undo waits for the next invocation.
    pub fn undo(&mut self, live: ViewportContext, backend: &mut BackendHandle) -> bool {
        if !self.active {
            log::debug!("undo ignored while a command is in flight");
            return false;
        }
        if self.cursor == 0 {
            log::debug!("nothing to undo");
            return false;
        }
        let index = self.cursor - 1;
        if self.defer_for_viewport(index, live) {
            return false;
        }
        let entry = &self.entries[index];
        log::info!("{}", entry.command.undo_description());
        self.active = false;
        self.events.push(StackEvent::Busy(true));
        let request = backend.submit(entry.command.inverse_request());
        self.pending = Some(Pending {
            phase: Phase::Undo,
            request,
            command: None,
            index,
        });
        true
    }

    /// Redoes the command at the cursor, with the same viewport deferral as
    /// undo.
    pub fn redo(&mut self, live: ViewportContext, backend: &mut BackendHandle) -> bool {
        if !self.active {
            log::debug!("redo ignored while a command is in flight");
            return false;
        }
        if self.cursor >= self.entries.len() {
            log::debug!("nothing to redo");
            return false;
        }
        let index = self.cursor;
        if !self.entries[index].undone_once {
            // The initial push already performed the action.
            log::warn!("redo of a never-undone command is a no-op");
            return false;
        }
        if self.defer_for_viewport(index, live) {
            return false;
        }
        let entry = &self.entries[index];
        log::info!("{}", entry.command.redo_description());
        self.active = false;
        self.events.push(StackEvent::Busy(true));
        let request = backend.submit(entry.command.forward_request());
        self.pending = Some(Pending {
            phase: Phase::Redo,
            request,
            command: None,
            index,
        });
        true
    }

    fn defer_for_viewport(&mut self, index: usize, live: ViewportContext) -> bool {
        if let Some(saved) = self.entries[index].command.viewport()
            && !saved.matches(&live, self.pos_tolerance, self.zoom_tolerance)
        {
            self.events.push(StackEvent::NavigateViewport(*saved));
            return true;
        }
        false
    }

    /// Delivers one backend reply. Must be called on the UI thread, in reply
    /// order.
    pub fn on_reply(&mut self, request: RequestId, result: Result<RestoreInfo, BackendError>) {
        let Some(pending) = self.pending.take() else {
            log::warn!("reply {} without an outstanding command", request);
            return;
        };
        if pending.request != request {
            log::warn!(
                "reply {} does not match outstanding request {}",
                request,
                pending.request
            );
            self.pending = Some(pending);
            return;
        }
        self.events.push(StackEvent::Busy(false));
        self.active = true;

        match (pending.phase, result) {
            (Phase::TryDo, Ok(info)) => {
                let Some(mut command) = pending.command else {
                    log::error!("try-do reply without its command");
                    return;
                };
                command.absorb_restore(info);
                // Standard linear history: everything above the cursor dies.
                self.entries.truncate(self.cursor);
                self.events.push(StackEvent::Applied {
                    description: command.redo_description(),
                });
                self.entries.push(Entry {
                    command,
                    undone_once: false,
                });
                self.cursor += 1;
            }
            (Phase::TryDo, Err(error)) => {
                let command = pending.command;
                let action = command
                    .as_ref()
                    .map(|c| c.try_do_description())
                    .unwrap_or_default();
                log::warn!("{} failed: {}", action, error);
                self.events.push(StackEvent::Failed {
                    action,
                    error,
                    command,
                });
            }
            (Phase::Undo, Ok(info)) => {
                let entry = &mut self.entries[pending.index];
                entry.command.absorb_restore(info);
                entry.undone_once = true;
                self.cursor = pending.index;
                self.events.push(StackEvent::Undone {
                    description: entry.command.undo_description(),
                });
            }
            (Phase::Undo, Err(error)) => {
                let action = self.entries[pending.index].command.undo_description();
                log::warn!("{} failed: {}; nothing was undone", action, error);
                self.events.push(StackEvent::Failed {
                    action,
                    error,
                    command: None,
                });
            }
            (Phase::Redo, Ok(info)) => {
                let entry = &mut self.entries[pending.index];
                entry.command.absorb_restore(info);
                self.cursor = pending.index + 1;
                self.events.push(StackEvent::Redone {
                    description: entry.command.redo_description(),
                });
            }
            (Phase::Redo, Err(error)) => {
                let action = self.entries[pending.index].command.redo_description();
                log::warn!("{} failed: {}; nothing was redone", action, error);
                self.events.push(StackEvent::Failed {
                    action,
                    error,
                    command: None,
                });
            }
        }
    }

    /// Drains every waiting backend reply into the stack.
    pub fn pump(&mut self, backend: &mut BackendHandle) {
        while let Some((request, result)) = backend.poll_reply() {
            self.on_reply(request, result);
        }
    }

    /// Most recent done command of concrete type `T`, scanning from just
    /// below the cursor to the bottom.
    pub fn find_previous<T: UndoableCommand>(&self) -> Option<&T> {
        self.entries[..self.cursor]
            .iter()
            .rev()
            .find_map(|e| e.command.as_any().downcast_ref::<T>())
    }

    pub fn find_previous_by(
        &self,
        pred: impl Fn(&dyn UndoableCommand) -> bool,
    ) -> Option<&dyn UndoableCommand> {
        self.entries[..self.cursor]
            .iter()
            .rev()
            .map(|e| e.command.as_ref())
            .find(|c| pred(*c))
    }

    pub fn drain_events(&mut self) -> Vec<StackEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod test {
    use super::ops::*;
    use super::*;
    use crate::backend::testing::SharedScenario;

    fn fixture() -> (CommandStack, BackendHandle, SharedScenario, PartId) {
        let (scenario, root) = SharedScenario::with_root();
        let backend = BackendHandle::spawn(scenario.clone());
        let stack = CommandStack::new(&Settings::default());
        (stack, backend, scenario, root)
    }

    fn settle(stack: &mut CommandStack, backend: &mut BackendHandle) {
        let (request, result) = backend.wait_reply().expect("backend reply");
        stack.on_reply(request, result);
    }

    fn viewport(actor: PartId) -> ViewportContext {
        ViewportContext {
            actor,
            center: egui::Pos2::ZERO,
            zoom: 1.0,
        }
    }

    #[test]
    fn test_push_deactivates_then_appends_on_success() {
        let (mut stack, mut backend, scenario, root) = fixture();
        let vp = viewport(root);

        let accepted = stack.push(
            Box::new(AddPartCommand::new(root, "pump".to_owned(), egui::Pos2::ZERO)),
            vp,
            &mut backend,
        );
        assert!(accepted);
        assert!(!stack.is_active());
        assert_eq!(stack.len(), 0);

        // Mutual exclusion: no second command while one is in flight.
        let rejected = stack.push(
            Box::new(AddPartCommand::new(root, "valve".to_owned(), egui::Pos2::ZERO)),
            vp,
            &mut backend,
        );
        assert!(!rejected);

        settle(&mut stack, &mut backend);
        assert!(stack.is_active());
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.cursor(), 1);
        assert!(scenario.dump().contains("pump"));
        assert!(!scenario.dump().contains("valve"));

        let events = stack.drain_events();
        assert!(matches!(events[0], StackEvent::Busy(true)));
        assert!(events
            .iter()
            .any(|e| matches!(e, StackEvent::Applied { .. })));
    }

    #[test]
    fn test_failed_try_do_discards_command() {
        let (mut stack, mut backend, scenario, root) = fixture();
        let before = scenario.dump();

        stack.push(
            Box::new(RemovePartCommand::new(PartId::now_v7(), "ghost".to_owned())),
            viewport(root),
            &mut backend,
        );
        settle(&mut stack, &mut backend);

        assert!(stack.is_active());
        assert_eq!(stack.len(), 0);
        assert_eq!(scenario.dump(), before);
        let events = stack.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            StackEvent::Failed { command: Some(_), .. }
        )));
    }

    #[test]
    fn test_new_push_truncates_redo_history() {
        let (mut stack, mut backend, scenario, root) = fixture();
        let vp = viewport(root);
        let part = scenario.lock().seed_part(root, "a", egui::Pos2::ZERO);

        stack.push(
            Box::new(PartsPositionsCommand::new(vec![(
                part,
                egui::Pos2::ZERO,
                egui::Pos2::new(10.0, 5.0),
            )])),
            vp,
            &mut backend,
        );
        settle(&mut stack, &mut backend);
        assert!(stack.undo(vp, &mut backend));
        settle(&mut stack, &mut backend);
        assert!(stack.can_redo());

        stack.push(
            Box::new(PartsPositionsCommand::new(vec![(
                part,
                egui::Pos2::ZERO,
                egui::Pos2::new(-3.0, 0.0),
            )])),
            vp,
            &mut backend,
        );
        settle(&mut stack, &mut backend);

        // Linear history: the undone command is gone for good.
        assert_eq!(stack.len(), 1);
        assert!(!stack.can_redo());
        assert!(!stack.redo(vp, &mut backend));
    }

    #[test]
    fn test_redo_before_any_undo_is_a_noop() {
        let (mut stack, mut backend, scenario, root) = fixture();
        let vp = viewport(root);
        let part = scenario.lock().seed_part(root, "a", egui::Pos2::ZERO);

        stack.push(
            Box::new(RenamePartCommand::new(part, "a".to_owned(), "b".to_owned())),
            vp,
            &mut backend,
        );
        settle(&mut stack, &mut backend);
        assert!(!stack.redo(vp, &mut backend));
        assert!(stack.is_active());
    }

    #[test]
    fn test_viewport_mismatch_renavigates_and_defers() {
        let (mut stack, mut backend, scenario, root) = fixture();
        let vp = viewport(root);
        let part = scenario.lock().seed_part(root, "a", egui::Pos2::ZERO);

        stack.push(
            Box::new(RenamePartCommand::new(part, "a".to_owned(), "b".to_owned())),
            vp,
            &mut backend,
        );
        settle(&mut stack, &mut backend);
        stack.drain_events();

        let far_away = ViewportContext {
            actor: root,
            center: egui::Pos2::new(500.0, 500.0),
            zoom: 1.0,
        };
        assert!(!stack.undo(far_away, &mut backend));
        let events = stack.drain_events();
        assert!(matches!(events[0], StackEvent::NavigateViewport(v) if v == vp));
        assert_eq!(stack.cursor(), 1);

        // Once the view is back, the same invocation goes through.
        assert!(stack.undo(vp, &mut backend));
        settle(&mut stack, &mut backend);
        assert_eq!(stack.cursor(), 0);
        assert!(scenario.dump().contains("\"a\""));
    }

    #[test]
    fn test_failed_undo_keeps_stack_unchanged() {
        let (mut stack, mut backend, scenario, root) = fixture();
        let vp = viewport(root);
        let part = scenario.lock().seed_part(root, "a", egui::Pos2::ZERO);

        stack.push(
            Box::new(RenamePartCommand::new(part, "a".to_owned(), "b".to_owned())),
            vp,
            &mut backend,
        );
        settle(&mut stack, &mut backend);
        stack.drain_events();

        // The part vanishes behind the stack's back.
        backend.submit(crate::backend::api::BackendRequest::RemoveChildPart { part });
        backend.wait_reply().unwrap().1.unwrap();

        assert!(stack.undo(vp, &mut backend));
        settle(&mut stack, &mut backend);

        assert!(stack.is_active());
        assert_eq!(stack.cursor(), 1);
        assert_eq!(stack.len(), 1);
        let events = stack.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            StackEvent::Failed { command: None, .. }
        )));
    }

    #[test]
    fn test_find_previous_scans_backwards_from_cursor() {
        let (mut stack, mut backend, scenario, root) = fixture();
        let vp = viewport(root);
        let part = scenario.lock().seed_part(root, "a", egui::Pos2::ZERO);

        stack.push(
            Box::new(PartsPositionsCommand::new(vec![(
                part,
                egui::Pos2::ZERO,
                egui::Pos2::new(10.0, 0.0),
            )])),
            vp,
            &mut backend,
        );
        settle(&mut stack, &mut backend);
        stack.push(
            Box::new(RenamePartCommand::new(part, "a".to_owned(), "b".to_owned())),
            vp,
            &mut backend,
        );
        settle(&mut stack, &mut backend);

        let found = stack.find_previous::<PartsPositionsCommand>().unwrap();
        assert_eq!(found.moves()[0].0, part);
        assert!(stack
            .find_previous_by(|c| c.as_any().is::<RenamePartCommand>())
            .is_some());

        // Undone commands are above the cursor and no longer found.
        assert!(stack.undo(vp, &mut backend));
        settle(&mut stack, &mut backend);
        assert!(stack.undo(vp, &mut backend));
        settle(&mut stack, &mut backend);
        assert!(stack.find_previous::<PartsPositionsCommand>().is_none());
    }
}
