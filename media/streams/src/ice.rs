//! # ICE agent interface
//!
//! One ICE agent is shared by all streams of a [`StreamsGroup`](crate::StreamsGroup).
//! The agent itself (candidate gathering, connectivity checks, nomination) is
//! a black box behind the [`IceAgent`] trait, this crate only sequences it:
//! connectivity checks start once all streams of a round have rendered, and
//! DTLS handshakes are held back until the checks have completed.

pub use ice::{IceConnectionState, IceGatheringState};

/// ICE events surfaced through the engine's event queue.
///
/// These are forwarded verbatim to the signaling layer, which is the only
/// place that can act on them (e.g. by sending a re-INVITE after a restart).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceEventKind {
    /// Candidate gathering finished for all streams
    GatheringFinished,
    /// Connectivity checks ran to completion
    CheckListProcessingFinished,
    /// All losing pairs have been dealt with after nomination
    LosingPairsCompleted,
    /// The session needs an ICE restart
    RestartNeeded,
}

/// ICE agent shared by the streams of one call.
pub trait IceAgent {
    /// Returns if an ICE session exists for this call
    fn has_session(&self) -> bool;

    /// Returns if connectivity checks have run to completion.
    ///
    /// Must return `true` when no ICE session exists, so that transports
    /// waiting for a settled path (DTLS-SRTP) are not gated forever.
    fn has_completed(&self) -> bool;

    /// Gather candidates and build the check list for the stream at `index`
    fn prepare_stream(&mut self, index: usize);

    /// Start connectivity checks for all prepared streams
    fn start_connectivity_checks(&mut self);

    /// Current connection state, `None` without a session
    fn connection_state(&self) -> Option<IceConnectionState>;

    /// Current gathering state, `None` without a session
    fn gathering_state(&self) -> Option<IceGatheringState>;

    /// Drop the ICE session and all its check lists
    fn delete_session(&mut self);
}

/// [`IceAgent`] for calls that do not use ICE at all.
#[derive(Debug, Default)]
pub struct NoIce;

impl IceAgent for NoIce {
    fn has_session(&self) -> bool {
        false
    }

    fn has_completed(&self) -> bool {
        true
    }

    fn prepare_stream(&mut self, _index: usize) {}

    fn start_connectivity_checks(&mut self) {}

    fn connection_state(&self) -> Option<IceConnectionState> {
        None
    }

    fn gathering_state(&self) -> Option<IceGatheringState> {
        None
    }

    fn delete_session(&mut self) {}
}
