//! Demultiplexes relay frames onto the session components. Stateless; every
//! fault is logged and dropped here so nothing propagates back to the link.

use async_trait::async_trait;
use relay_proto::{
    CommandArg, ConnectivityCandidate, ControlCatalog, ControlValue, IceServerList, RelayFrame,
    RemoteCommand, RosterEntry, SessionDescriptor, SignalEnvelope,
};
use serde_json::Value;

/// Receivers for routed messages. Implemented by the session supervisor;
/// tests implement it to observe dispatch in isolation.
#[async_trait]
pub trait Dispatch: Send {
    async fn on_remote_descriptor(&mut self, descriptor: SessionDescriptor);

    async fn on_remote_candidate(&mut self, candidate: ConnectivityCandidate);

    fn on_ice_servers(&mut self, servers: IceServerList);

    fn on_device_control(&mut self, value: Option<ControlValue>, reset: bool);

    fn on_remote_command(&mut self, cmd: RemoteCommand, arg: CommandArg);

    fn on_record_refused(&mut self, detail: Value);

    fn on_roster(&mut self, roster: Vec<RosterEntry>);

    fn on_control_catalog(&mut self, catalog: ControlCatalog);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Dispatched,
    /// Parsed but of a kind this client does not handle.
    Ignored,
    Malformed,
}

pub async fn dispatch<D>(raw: &str, target: &mut D) -> Routed
where
    D: Dispatch + ?Sized,
{
    let frame = match RelayFrame::parse(raw) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!(target = "router", error = %err, len = raw.len(), "dropping malformed relay frame");
            return Routed::Malformed;
        }
    };

    let mut routed = Routed::Ignored;
    if let Some(catalog) = frame.catalog {
        target.on_control_catalog(catalog);
        routed = Routed::Dispatched;
    }

    let Some(envelope) = frame.envelope else {
        if let Some(tag) = frame.tag.as_deref() {
            tracing::trace!(target = "router", kind = tag, "ignoring unknown relay message");
        }
        return routed;
    };

    tracing::trace!(target = "router", kind = envelope.kind().as_wire(), "dispatching");
    match envelope {
        SignalEnvelope::SessionDescription { data } => target.on_remote_descriptor(data).await,
        SignalEnvelope::Candidate { data } => target.on_remote_candidate(data).await,
        SignalEnvelope::IceServers { ice_servers } => target.on_ice_servers(ice_servers),
        SignalEnvelope::UserControl { data, reset } => target.on_device_control(data, reset),
        SignalEnvelope::Command { cmd, arg } => target.on_remote_command(cmd, arg),
        SignalEnvelope::RecordRefused { data } => target.on_record_refused(data),
        SignalEnvelope::Roster { data } => target.on_roster(data),
    }
    Routed::Dispatched
}
