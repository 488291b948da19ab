//! Interaction core of a 2D actor-scenario diagram editor.
//!
//! This crate is the input-handling heart of a desktop modeling application:
//! the scene item layer with its link-anchor geometry, the state machine that
//! interprets raw mouse/keyboard events (selection, rubber band, moving,
//! link creation and retargeting, click-delete), and the undoable-command
//! stack that talks to the scenario model on a separate worker thread.
//! Rendering, dialogs and the scenario model itself live in the embedding
//! application; this crate only consumes their interfaces.

pub mod backend;
pub mod commands;
pub mod common;
pub mod scene;

pub use backend::api::{BackendError, BackendRequest, Notification, RestoreInfo, ScenarioApi};
pub use backend::worker::BackendHandle;
pub use commands::{CommandStack, StackEvent, UndoableCommand, ViewportContext};
pub use common::config::Settings;
pub use common::ids::{ItemId, LinkId, PartId, PortId, WaypointId};
pub use scene::fsm::{InputEvent, Key, ModifierKeys, MouseButton, SceneState};
pub use scene::{Scene, SceneNotice};
