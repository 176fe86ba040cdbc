//! Session lifecycle: the supervisor that owns the live peer session and the
//! single event loop that drives it.

use bytes::Bytes;
use relay_proto::{CommandArg, ControlCatalog, ControlValue, RemoteCommand, RosterEntry};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::negotiation::ConnectivityState;
use crate::transfer::TransferProgress;
use crate::transport::LinkState;

pub mod runtime;
pub mod supervisor;

pub use runtime::start;
pub use supervisor::Supervisor;

/// Orthogonal session toggles. Connectivity itself lives in the negotiation
/// state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    pub recording: bool,
    pub talking: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub link: LinkState,
    pub session: Option<u64>,
    pub connectivity: Option<ConnectivityState>,
    pub flags: SessionFlags,
    pub transfer: Option<TransferProgress>,
    pub queued_transfers: usize,
}

/// Everything the UI layer is told about.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Link(LinkState),
    Connectivity {
        session: u64,
        state: ConnectivityState,
    },
    LocalMedia {
        sending: bool,
    },
    RemoteTrack {
        kind: String,
        id: String,
    },
    Roster(Vec<RosterEntry>),
    /// Normalized device control catalog.
    Catalog(ControlCatalog),
    DeviceControl {
        value: Option<ControlValue>,
        reset: bool,
    },
    RemoteCommand {
        cmd: RemoteCommand,
        arg: CommandArg,
    },
    Notice(String),
    Transfer(TransferProgress),
    Status(StatusSnapshot),
}

#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Sends a local offer on the current session.
    Offer,
    Record(bool),
    Talk(bool),
    SendClip {
        name: String,
        mime: String,
        data: Bytes,
    },
    /// Sets a control by catalog name, in the presented (normalized) range.
    SetControl {
        name: String,
        value: i64,
    },
    ToggleControl {
        name: String,
        checked: bool,
    },
    ResetControls,
    Status,
    /// Closes the current session. The relay link stays up.
    Stop,
    Shutdown,
}

#[derive(Debug, Error)]
#[error("session runtime has stopped")]
pub struct RuntimeStopped;

/// Cloneable front door to a running session loop.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub(crate) fn new(commands: mpsc::UnboundedSender<SessionCommand>) -> Self {
        Self { commands }
    }

    pub fn send(&self, command: SessionCommand) -> Result<(), RuntimeStopped> {
        self.commands.send(command).map_err(|_| RuntimeStopped)
    }

    pub fn offer(&self) -> Result<(), RuntimeStopped> {
        self.send(SessionCommand::Offer)
    }

    pub fn record(&self, start: bool) -> Result<(), RuntimeStopped> {
        self.send(SessionCommand::Record(start))
    }

    pub fn talk(&self, start: bool) -> Result<(), RuntimeStopped> {
        self.send(SessionCommand::Talk(start))
    }

    pub fn send_clip(
        &self,
        name: impl Into<String>,
        mime: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Result<(), RuntimeStopped> {
        self.send(SessionCommand::SendClip {
            name: name.into(),
            mime: mime.into(),
            data: data.into(),
        })
    }

    pub fn set_control(&self, name: impl Into<String>, value: i64) -> Result<(), RuntimeStopped> {
        self.send(SessionCommand::SetControl {
            name: name.into(),
            value,
        })
    }

    pub fn toggle_control(
        &self,
        name: impl Into<String>,
        checked: bool,
    ) -> Result<(), RuntimeStopped> {
        self.send(SessionCommand::ToggleControl {
            name: name.into(),
            checked,
        })
    }

    pub fn reset_controls(&self) -> Result<(), RuntimeStopped> {
        self.send(SessionCommand::ResetControls)
    }

    pub fn request_status(&self) -> Result<(), RuntimeStopped> {
        self.send(SessionCommand::Status)
    }

    pub fn stop(&self) -> Result<(), RuntimeStopped> {
        self.send(SessionCommand::Stop)
    }

    pub fn shutdown(&self) -> Result<(), RuntimeStopped> {
        self.send(SessionCommand::Shutdown)
    }
}
