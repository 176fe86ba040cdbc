//! Wire definitions shared by the viewing client and the relay.
//! Kept free of runtime dependencies so the relay side (or other language
//! bindings) can reuse the exact JSON shapes.

pub mod channel;
pub mod control;
pub mod envelope;

pub use channel::{ChannelControl, ChannelNotice, FileAnnouncement};
pub use control::{
    CONTROL_TYPE_BOOLEAN, CONTROL_TYPE_INTEGER, ControlCatalog, ControlDescriptor, ControlValue,
    normalize_catalog,
};
pub use envelope::{
    CommandArg, ConnectivityCandidate, DescriptorRole, EnvelopeError, IceServer, IceServerList,
    IceUrls, RelayFrame, RemoteCommand, RosterEntry, SessionDescriptor, SignalEnvelope, SignalKind,
};

pub(crate) fn is_false(value: &bool) -> bool {
    !*value
}
