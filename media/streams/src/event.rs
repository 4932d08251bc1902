//! Events surfaced to the signaling layer.
//!
//! Popped from [`StreamsGroup::pop_event`](crate::StreamsGroup::pop_event)
//! after [`poll`](crate::StreamsGroup::poll) or any of the rendering
//! operations ran.

use crate::description::StreamKind;
use crate::engine::StreamStats;
use crate::ice::IceEventKind;

/// Direction of the RTCP traffic that triggered a reporting update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpDirection {
    Received,
    Sent,
}

/// Event for the owning call session.
#[derive(Debug)]
pub enum SessionEvent {
    /// The encryption status of the session's streams changed. Query
    /// [`all_streams_encrypted`](crate::StreamsGroup::all_streams_encrypted)
    /// for the aggregate.
    EncryptionChanged,

    /// The ZRTP short authentication string is ready for user verification
    AuthTokenReady { token: String, verified: bool },

    /// A stream's statistics snapshot was refreshed
    StatsUpdated { index: usize, stats: StreamStats },

    /// RTCP was received or emitted on a stream, relevant for quality
    /// reporting
    RtcpUpdate {
        index: usize,
        direction: RtcpDirection,
    },

    /// The peer requested a temporary maximum bitrate via RTCP TMMBR,
    /// `max_bitrate` is in bit/s
    TmmbrReceived { index: usize, max_bitrate: u64 },

    /// ICE state machine event, must be acted upon on the signaling plane
    Ice { index: usize, event: IceEventKind },

    /// Final media statistics of a stopping stream are available
    MediaInfoUpdated {
        index: usize,
        kind: StreamKind,
        stats: StreamStats,
    },

    /// An audio stream that may be part of a conference is stopping
    ConferenceStreamStopping { index: usize },
}
