//! # Media engine interface
//!
//! The actual media handling (RTP sessions, jitter buffer, SRTP/ZRTP/DTLS
//! primitives, capture & playback) lives in an engine behind the
//! [`MediaEngine`] and [`EngineStream`] traits. This crate configures and
//! drives engine streams, it never touches packets itself.
//!
//! Engine streams are expected to be non-blocking: [`iterate`](EngineStream::iterate)
//! and the event queue behind [`pop_event`](EngineStream::pop_event) are
//! polled from the call processing loop, any internal threading stays inside
//! the engine.

use crate::description::{RtcpXrSetup, StreamKind};
use crate::ice::IceEventKind;
use crate::profile::RtpProfile;
use sdp_types::SrtpSuite;
use std::net::IpAddr;

/// Error raised by the media engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to allocate transport resources: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// RTP/RTCP port pair of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPorts {
    pub rtp: u16,
    /// `None` when RTCP is disabled (multicast reception)
    pub rtcp: Option<u16>,
}

impl StreamPorts {
    pub fn new(rtp: u16, rtcp: u16) -> Self {
        StreamPorts {
            rtp,
            rtcp: Some(rtcp),
        }
    }

    pub fn rtp_only(rtp: u16) -> Self {
        StreamPorts { rtp, rtcp: None }
    }
}

/// RTCP feedback features toggled on an RTP session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvpfFeature {
    GenericNack,
    Tmmbr,
}

/// Adaptive bitrate control submitted to the engine after policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControl {
    Disabled,
    /// Simple QoS analyzer on the stream itself
    Basic,
    /// Engine wide bandwidth controller driven by TMMBR
    Advanced,
}

/// Local DTLS credentials handed to the engine.
pub struct DtlsParams<'a> {
    pub certificate_pem: &'a str,
    pub private_key_pem: &'a str,
}

/// DTLS role negotiated through the `a=setup` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DtlsRole {
    #[default]
    Unset,
    Client,
    Server,
}

/// Jitter buffer algorithm of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterBufferAlgorithm {
    Basic,
    #[default]
    RecursiveLeastSquare,
}

impl JitterBufferAlgorithm {
    /// Map a configured algorithm name, falling back to the default on
    /// unknown names.
    pub fn from_name(name: &str) -> Self {
        match name {
            "basic" => JitterBufferAlgorithm::Basic,
            "rls" => JitterBufferAlgorithm::RecursiveLeastSquare,
            other => {
                log::error!("Invalid jitter buffer algorithm: {other}");
                JitterBufferAlgorithm::RecursiveLeastSquare
            }
        }
    }
}

/// Resolved jitter buffer parameters applied to an RTP session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterBufferParams {
    pub enabled: bool,
    pub nominal_size_ms: u32,
    pub min_size_ms: u32,
    pub max_size_ms: u32,
    pub max_packets: u32,
    pub adaptive: bool,
    pub algorithm: JitterBufferAlgorithm,
    pub refresh_period_ms: u32,
    pub ramp_refresh_period_ms: u32,
    pub ramp_step_ms: u32,
    pub ramp_threshold: u32,
}

/// Snapshot of a stream's transport statistics, all bandwidths in kbit/s.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamStats {
    pub rtp_download_bandwidth: f32,
    pub rtp_upload_bandwidth: f32,
    pub rtcp_download_bandwidth: f32,
    pub rtcp_upload_bandwidth: f32,
    /// Estimated maximum download bandwidth, when the engine has one
    pub estimated_download_bandwidth: Option<f32>,
}

/// Event dequeued from a stream's transport layer event queue.
#[derive(Debug)]
pub enum EngineEvent {
    /// A compound RTCP packet was received
    RtcpReceived(Vec<u8>),
    /// A compound RTCP packet was emitted
    RtcpSent(Vec<u8>),
    /// The ZRTP handshake completed or the SRTP state changed
    ZrtpEncryptionChanged { encrypted: bool },
    /// The ZRTP short authentication string is ready for user verification
    ZrtpSasReady { token: String, verified: bool },
    /// The DTLS handshake completed or failed
    DtlsEncryptionChanged { encrypted: bool },
    /// ICE state machine event, only the signaling layer can act on it
    Ice(IceEventKind),
}

/// Factory for engine stream endpoints, one engine per call.
pub trait MediaEngine {
    fn create_stream(&mut self, kind: StreamKind) -> Result<Box<dyn EngineStream>, EngineError>;
}

/// One media stream endpoint inside the engine.
///
/// Configuration setters may be called repeatedly, a running stream applies
/// changed values without resetting its transport state.
pub trait EngineStream {
    fn kind(&self) -> StreamKind;

    /// Bind the transport sockets. `ports` of `None` requests ephemeral
    /// allocation by the system.
    fn bind(&mut self, bind_addr: IpAddr, ports: Option<StreamPorts>) -> Result<(), EngineError>;

    /// Locally bound ports, `None` before `bind` (or when ephemeral
    /// allocation has not happened yet)
    fn local_ports(&self) -> Option<StreamPorts>;

    /// Complete transport wiring that was deferred from `bind`, e.g.
    /// endpoints provided by an external transport factory.
    fn finish_prepare(&mut self) {}

    fn join_multicast_group(&mut self, addr: IpAddr) -> Result<(), EngineError>;
    fn set_multicast_ttl(&mut self, ttl: u8);

    fn enable_rtcp_mux(&mut self, enabled: bool);
    fn enable_avpf_feature(&mut self, feature: AvpfFeature, enabled: bool);
    fn configure_rtcp_xr(&mut self, config: &RtcpXrSetup);
    fn set_jitter_buffer_params(&mut self, params: &JitterBufferParams);
    fn set_symmetric_rtp(&mut self, enabled: bool);
    fn set_source_description(&mut self, cname: &str, tool: &str);
    fn set_dscp(&mut self, dscp: u8);
    fn set_recv_buf_size(&mut self, _size: u32) {}

    fn set_srtp_recv_key(&mut self, suite: &SrtpSuite, key_b64: &str);
    fn set_srtp_send_key(&mut self, suite: &SrtpSuite, key_b64: &str);
    fn set_encryption_mandatory(&mut self, mandatory: bool);

    /// Cap the total outbound network bitrate, in bit/s. 0 removes the cap.
    fn set_max_network_bitrate(&mut self, bitrate: u32);
    fn set_rate_control(&mut self, control: RateControl);

    fn enable_dtls(&mut self, params: &DtlsParams<'_>);
    fn start_dtls(&mut self, role: DtlsRole);

    /// Start the ZRTP engine on this stream
    fn start_zrtp(&mut self) {}
    /// Derive this stream's SRTP keys from the ZRTP master secret negotiated
    /// on the session's main stream
    fn derive_zrtp_keys(&mut self) {}
    fn has_zrtp_context(&self) -> bool {
        false
    }
    fn set_zrtp_sas_verified(&mut self, _verified: bool) {}

    /// Apply the codec profile for this round. `used_payload_type` is the
    /// payload type number the stream sends with.
    fn apply_profile(&mut self, profile: &RtpProfile, used_payload_type: Option<u8>);

    /// Start media flow. Idempotent on a running stream.
    fn start(&mut self) -> Result<(), EngineError>;

    /// The engine's per-kind iterate entry point
    fn iterate(&mut self);
    fn pop_event(&mut self) -> Option<EngineEvent>;

    fn stats(&self) -> StreamStats;
    fn is_secured(&self) -> bool;
    fn is_muted(&self) -> bool;
    /// Average quality rating in [0, 5], -1.0 when not available
    fn average_quality(&self) -> f32 {
        -1.0
    }
    /// Current quality rating in [0, 5], -1.0 when not available
    fn current_quality(&self) -> f32 {
        -1.0
    }
    fn avpf_rr_interval_ms(&self) -> u32 {
        0
    }

    /// Notification that the signaling session was definitively confirmed
    fn session_confirmed(&mut self) {}

    /// Release all transport resources
    fn stop(&mut self);
}
