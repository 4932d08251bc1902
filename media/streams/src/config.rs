//! Configuration surface consumed by the stream layer.
//!
//! Everything in here is read-only for this crate, the embedding application
//! fills it from its own settings store once per call.

use std::net::IpAddr;

/// Port allocation policy for one media kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PortRange {
    /// Let the transport layer pick an ephemeral port
    #[default]
    Auto,
    /// Probe this port and the next even ports above it
    Fixed(u16),
    /// Pick a random even port within the inclusive range.
    /// `Range(p, p)` behaves like `Fixed(p)`.
    Range(u16, u16),
}

/// Adaptive rate control mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AdaptiveRateMode {
    Off,
    /// Simple QoS analyzer built into the media engine
    Basic,
    /// Engine wide bandwidth controller, requires TMMBR feedback
    #[default]
    Advanced,
}

/// Media encryption requested for the call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MediaEncryption {
    #[default]
    None,
    Srtp,
    Zrtp,
    Dtls,
}

/// Jitter buffer tuning.
///
/// `algorithm` is kept as the configured name and validated when applied, an
/// unknown name falls back to the default with an error log.
#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    pub min_size_ms: u32,
    pub max_size_ms: u32,
    /// "basic" or "rls"
    pub algorithm: String,
    pub refresh_period_ms: u32,
    pub ramp_refresh_period_ms: u32,
    pub ramp_step_ms: u32,
    pub ramp_threshold: u32,
    /// Nominal size for audio (and text) streams, 0 disables the buffer
    pub audio_nominal_ms: u32,
    pub audio_adaptive: bool,
    pub video_nominal_ms: u32,
    pub video_adaptive: bool,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        JitterBufferConfig {
            min_size_ms: 40,
            max_size_ms: 500,
            algorithm: "rls".into(),
            refresh_period_ms: 5000,
            ramp_refresh_period_ms: 5000,
            ramp_step_ms: 20,
            ramp_threshold: 70,
            audio_nominal_ms: 60,
            audio_adaptive: true,
            video_nominal_ms: 60,
            video_adaptive: true,
        }
    }
}

/// Certificate and key used for DTLS-SRTP.
#[derive(Clone)]
pub struct DtlsIdentity {
    pub certificate_pem: String,
    pub private_key_pem: String,
}

impl std::fmt::Debug for DtlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The private key stays out of logs
        f.debug_struct("DtlsIdentity").finish_non_exhaustive()
    }
}

/// Per call configuration of the stream layer.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub audio_ports: PortRange,
    pub video_ports: PortRange,
    pub text_ports: PortRange,

    pub jitter_buffer: JitterBufferConfig,
    pub adaptive_rate: AdaptiveRateMode,

    /// DSCP marking, 0..=63
    pub audio_dscp: Option<u8>,
    pub video_dscp: Option<u8>,

    /// Explicit local address to bind transports to
    pub bind_address: Option<IpAddr>,
    pub ipv6: bool,

    pub audio_multicast_enabled: bool,
    pub audio_multicast: Option<IpAddr>,
    pub video_multicast_enabled: bool,
    pub video_multicast: Option<IpAddr>,

    /// RTCP SDES tool entry
    pub user_agent: String,
    /// RTCP CNAME, usually the local identity address
    pub identity: String,

    /// Upload bandwidth cap in kbit/s, 0 or less means unlimited
    pub upload_bandwidth: i32,
    /// Per call forced upload bandwidth in kbit/s, 0 means not forced.
    /// When forced, audio does not yield bandwidth headroom to video.
    pub forced_upload_bandwidth: i32,
    /// Outbound packetization time in ms, 0 means unset
    pub upload_ptime: u32,

    pub encryption: MediaEncryption,
    pub encryption_mandatory: bool,
    pub dtls_identity: Option<DtlsIdentity>,

    pub symmetric_rtp: bool,
    pub video_recv_buf_size: Option<u32>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        MediaConfig {
            audio_ports: PortRange::Auto,
            video_ports: PortRange::Auto,
            text_ports: PortRange::Auto,
            jitter_buffer: JitterBufferConfig::default(),
            adaptive_rate: AdaptiveRateMode::default(),
            audio_dscp: Some(0x2e), // EF
            video_dscp: Some(0x22), // AF41
            bind_address: None,
            ipv6: true,
            audio_multicast_enabled: false,
            audio_multicast: None,
            video_multicast_enabled: false,
            video_multicast: None,
            user_agent: concat!("rtc-streams/", env!("CARGO_PKG_VERSION")).into(),
            identity: String::new(),
            upload_bandwidth: 0,
            forced_upload_bandwidth: 0,
            upload_ptime: 0,
            encryption: MediaEncryption::None,
            encryption_mandatory: false,
            dtls_identity: None,
            symmetric_rtp: true,
            video_recv_buf_size: None,
        }
    }
}
