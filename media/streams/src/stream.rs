//! # Stream
//!
//! One media transport endpoint of a call. A [`Stream`] owns its engine
//! binding and walks a small lifecycle state machine:
//!
//! ```text
//! Stopped -> Preparing -> Running -> Stopped
//! ```
//!
//! The port configuration is chosen once at construction and held fixed for
//! the stream's lifetime. A stream whose destination toggles between unicast
//! and multicast cannot be reconfigured, its group replaces the instance.

use crate::config::{AdaptiveRateMode, MediaConfig, MediaEncryption, PortRange};
use crate::context::StreamContext;
use crate::description::{MulticastRole, RtcpXrSetup, SessionDescription, StreamKind};
use crate::engine::{
    AvpfFeature, DtlsParams, DtlsRole, EngineError, EngineEvent, EngineStream,
    JitterBufferAlgorithm, JitterBufferParams, MediaEngine, RateControl, StreamPorts, StreamStats,
};
use crate::event::SessionEvent;
use crate::profile::{self, RtpProfile};
use openssl::hash::MessageDigest;
use openssl::x509::X509;
use sdp_types::{Direction, Fingerprint, FingerprintAlgorithm, Setup};
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

/// Period of the per-stream event pump
pub(crate) const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Number of attempts when probing for a free port
const PORT_SELECTION_ATTEMPTS: u32 = 100;

/// RTPFB feedback message type of TMMBR (RFC 5104)
const RTPFB_TMMBR: u8 = 3;

/// Lifecycle state of a [`Stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Stopped,
    Preparing,
    Running,
}

/// Signaling state targeted by a render pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    EarlyMedia,
    Running,
    Paused,
}

/// Answers whether an RTP/RTCP port is already bound by any live stream of
/// any call in the process.
///
/// Port selection probes through this capability, which makes the port
/// choice a cross-call search. [`StreamsGroup`](crate::StreamsGroup)
/// implements it for its own streams, an embedder aggregates all groups.
pub trait PortUsage {
    fn is_port_used(&self, port: u16) -> bool;
}

/// [`PortUsage`] for processes without any other active call.
#[derive(Debug, Default)]
pub struct NoOtherCalls;

impl PortUsage for NoOtherCalls {
    fn is_port_used(&self, _port: u16) -> bool {
        false
    }
}

/// Port and multicast configuration of a stream, fixed at construction.
#[derive(Debug, Clone)]
pub(crate) struct PortConfig {
    /// `None` requests ephemeral allocation by the transport layer
    pub(crate) ports: Option<StreamPorts>,
    pub(crate) multicast_ip: Option<IpAddr>,
    pub(crate) multicast_role: MulticastRole,
}

impl PortConfig {
    fn select(
        kind: StreamKind,
        ctx: &StreamContext<'_>,
        config: &MediaConfig,
        ports_in_use: &dyn PortUsage,
    ) -> PortConfig {
        let range = match kind {
            StreamKind::Audio => config.audio_ports,
            StreamKind::Video => config.video_ports,
            StreamKind::Text => config.text_ports,
        };

        let rtp_port = match range {
            PortRange::Auto => None,
            PortRange::Fixed(port) => select_fixed_port(port, ports_in_use),
            PortRange::Range(lo, hi) if lo == hi => select_fixed_port(lo, ports_in_use),
            PortRange::Range(lo, hi) if lo > hi => {
                log::error!("Invalid port range [{lo}, {hi}]");
                None
            }
            PortRange::Range(lo, hi) => select_random_port(lo, hi, ports_in_use),
        };

        let ports = rtp_port.map(|rtp| StreamPorts::new(rtp, rtp + 1));

        let multicast_role = if ctx.local_is_offerer {
            ctx.local.map(|desc| desc.multicast_role)
        } else {
            ctx.remote.map(|desc| desc.multicast_role)
        }
        .unwrap_or_default();

        let multicast_ip = match kind {
            StreamKind::Audio if config.audio_multicast_enabled => config.audio_multicast,
            StreamKind::Video if config.video_multicast_enabled => config.video_multicast,
            _ => None,
        };

        let ports = if multicast_role == MulticastRole::Receiver {
            // As receiver we listen on the sender's announced port, RTCP is
            // not used in multicast
            ctx.remote
                .map(|desc| StreamPorts::rtp_only(desc.rtp_port))
                .or(ports)
        } else {
            ports
        };

        PortConfig {
            ports,
            multicast_ip,
            multicast_role,
        }
    }
}

fn select_fixed_port(base: u16, ports_in_use: &dyn PortUsage) -> Option<u16> {
    for attempt in 0..PORT_SELECTION_ATTEMPTS {
        let candidate = u32::from(base) + attempt * 2;
        let Ok(candidate) = u16::try_from(candidate) else {
            break;
        };

        if !ports_in_use.is_port_used(candidate) {
            return Some(candidate);
        }
    }

    log::error!("Could not find any free port above {base}");
    None
}

fn select_random_port(lo: u16, hi: u16, ports_in_use: &dyn PortUsage) -> Option<u16> {
    let range_size = u32::from(hi - lo);

    for _ in 0..PORT_SELECTION_ATTEMPTS {
        // Pick an even offset so an even range start yields even RTP ports
        let offset = (rand::random::<u32>() % range_size) & !1;
        let candidate = lo + offset as u16;

        if !ports_in_use.is_port_used(candidate) {
            log::info!("Port {candidate} randomly taken from range [{lo}, {hi}]");
            return Some(candidate);
        }
    }

    log::error!("Could not find any free port in range [{lo}, {hi}]");
    None
}

/// Group level state a stream operation may touch.
pub(crate) struct StreamEnv<'a> {
    pub(crate) config: &'a MediaConfig,
    pub(crate) events: &'a mut VecDeque<SessionEvent>,
    /// Audio bandwidth allocated for the whole group, kbit/s
    pub(crate) audio_bandwidth: &'a mut i32,
    /// Fingerprint of the local DTLS certificate, set by the first stream
    /// that loads the identity
    pub(crate) dtls_fingerprint: &'a mut Option<Fingerprint>,
}

/// One media transport stream of a [`StreamsGroup`](crate::StreamsGroup).
pub struct Stream {
    kind: StreamKind,
    index: usize,
    main: bool,
    state: StreamState,
    port_config: PortConfig,
    engine: Box<dyn EngineStream>,
    profile: Option<RtpProfile>,
    used_payload_type: Option<u8>,
    avpf: bool,
    stats: StreamStats,
    pub(crate) next_pump: Option<Instant>,
}

impl Stream {
    pub(crate) fn new(
        kind: StreamKind,
        index: usize,
        main: bool,
        ctx: &StreamContext<'_>,
        engine: &mut dyn MediaEngine,
        config: &MediaConfig,
        ports_in_use: &dyn PortUsage,
    ) -> Result<Stream, EngineError> {
        let port_config = PortConfig::select(kind, ctx, config, ports_in_use);

        log::info!(
            "Stream #{index} ({kind}) multicast role is [{}]",
            port_config.multicast_role
        );

        let engine_stream = engine.create_stream(kind)?;

        Ok(Stream {
            kind,
            index,
            main,
            state: StreamState::Stopped,
            port_config,
            engine: engine_stream,
            profile: None,
            used_payload_type: None,
            avpf: false,
            stats: StreamStats::default(),
            next_pump: None,
        })
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns if this is the designated main stream of its kind
    pub fn is_main(&self) -> bool {
        self.main
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Selected RTP/RTCP ports, `None` when ephemeral allocation is used
    pub fn ports(&self) -> Option<StreamPorts> {
        self.port_config.ports
    }

    pub fn is_port_used(&self, port: u16) -> bool {
        match self.port_config.ports {
            Some(ports) => ports.rtp == port || ports.rtcp == Some(port),
            None => false,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.engine.is_secured()
    }

    pub fn is_muted(&self) -> bool {
        self.engine.is_muted()
    }

    /// Average quality rating in [0, 5], -1.0 when not available
    pub fn average_quality(&self) -> f32 {
        self.engine.average_quality()
    }

    /// Current quality rating in [0, 5], -1.0 when not available
    pub fn current_quality(&self) -> f32 {
        self.engine.current_quality()
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Codec profile applied by the last render
    pub fn rtp_profile(&self) -> Option<&RtpProfile> {
        self.profile.as_ref()
    }

    /// Payload type number the stream sends with, once rendered
    pub fn used_payload_type(&self) -> Option<u8> {
        self.used_payload_type
    }

    pub(crate) fn avpf_enabled(&self) -> bool {
        self.avpf
    }

    pub(crate) fn avpf_rr_interval_ms(&self) -> u32 {
        self.engine.avpf_rr_interval_ms()
    }

    pub(crate) fn has_zrtp_context(&self) -> bool {
        self.engine.has_zrtp_context()
    }

    pub(crate) fn set_zrtp_sas_verified(&mut self, verified: bool) {
        self.engine.set_zrtp_sas_verified(verified);
    }

    pub(crate) fn derive_zrtp_keys(&mut self) {
        self.engine.derive_zrtp_keys();
    }

    fn bind_ip(&self, config: &MediaConfig) -> IpAddr {
        if let Some(multicast_ip) = self.port_config.multicast_ip {
            // Bind with the address family of the multicast group, dual
            // stack sockets and multicast don't mix well everywhere
            return match multicast_ip {
                IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
                IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
            };
        }

        if let Some(addr) = config.bind_address {
            return addr;
        }

        if config.ipv6 {
            Ipv6Addr::UNSPECIFIED.into()
        } else {
            Ipv4Addr::UNSPECIFIED.into()
        }
    }

    /// Allocate transport resources. No-op unless the stream is Stopped.
    pub(crate) fn prepare(&mut self, now: Instant, env: &mut StreamEnv<'_>) {
        if self.state != StreamState::Stopped {
            return;
        }

        let bind_addr = self.bind_ip(env.config);
        if let Err(e) = self.engine.bind(bind_addr, self.port_config.ports) {
            log::error!("Stream #{}: failed to bind transport: {e}", self.index);
        }

        if self.port_config.multicast_role == MulticastRole::Receiver {
            match self.port_config.multicast_ip {
                Some(addr) => {
                    if let Err(e) = self.engine.join_multicast_group(addr) {
                        log::error!("Stream #{}: cannot join multicast group: {e}", self.index);
                    }
                }
                None => {
                    log::error!("Cannot join multicast group if multicast ip is not set");
                }
            }
        }

        self.engine
            .set_jitter_buffer_params(&self.jitter_buffer_params(env.config));
        self.engine.set_symmetric_rtp(env.config.symmetric_rtp);
        self.engine
            .set_source_description(&env.config.identity, &env.config.user_agent);

        let dscp = match self.kind {
            StreamKind::Audio => env.config.audio_dscp,
            StreamKind::Video => env.config.video_dscp,
            StreamKind::Text => None,
        };
        if let Some(dscp) = dscp {
            self.engine.set_dscp(dscp);
        }

        if self.kind == StreamKind::Video {
            if let Some(size) = env.config.video_recv_buf_size {
                self.engine.set_recv_buf_size(size);
            }
        }

        self.setup_dtls(env);

        self.next_pump = Some(now + EVENT_POLL_INTERVAL);
        self.state = StreamState::Preparing;
    }

    /// Complete transport wiring deferred from [`prepare`](Self::prepare) and
    /// learn ephemeral ports once they exist.
    pub(crate) fn finish_prepare(&mut self) {
        self.engine.finish_prepare();

        if self.port_config.ports.is_none() {
            self.port_config.ports = self.engine.local_ports();
        }
    }

    fn setup_dtls(&mut self, env: &mut StreamEnv<'_>) {
        if env.config.encryption != MediaEncryption::Dtls {
            return;
        }

        let Some(identity) = &env.config.dtls_identity else {
            log::error!("Unable to retrieve DTLS certificate and key, DTLS disabled");
            return;
        };

        let digest = X509::from_pem(identity.certificate_pem.as_bytes())
            .and_then(|cert| cert.digest(MessageDigest::sha256()));

        match digest {
            Ok(digest) => {
                if env.dtls_fingerprint.is_none() {
                    *env.dtls_fingerprint = Some(Fingerprint {
                        algorithm: FingerprintAlgorithm::SHA256,
                        fingerprint: digest.to_vec(),
                    });
                }

                self.engine.enable_dtls(&DtlsParams {
                    certificate_pem: &identity.certificate_pem,
                    private_key_pem: &identity.private_key_pem,
                });
            }
            Err(e) => {
                log::error!("Failed to load DTLS certificate, DTLS disabled: {e}");
            }
        }
    }

    /// Apply the configuration of one offer/answer round and start media.
    pub(crate) fn render(
        &mut self,
        ctx: &StreamContext<'_>,
        env: &mut StreamEnv<'_>,
        _target: TargetState,
    ) {
        let Some(result) = ctx.result else {
            log::error!(
                "Stream #{}: render without a result description",
                self.index
            );
            return;
        };

        let rtp_addr = result
            .rtp_addr
            .or(ctx.result_session.and_then(|session| session.addr));
        let is_multicast = rtp_addr.is_some_and(|addr| addr.is_multicast());

        self.engine
            .set_max_network_bitrate(env.config.upload_bandwidth.max(0) as u32 * 1000);

        if is_multicast {
            if let Some(ttl) = result.ttl {
                self.engine.set_multicast_ttl(ttl);
            }
        }

        self.engine.enable_rtcp_mux(result.rtcp_mux);

        if result.has_srtp() {
            self.apply_srtp_keys(ctx);
        }
        self.engine
            .set_encryption_mandatory(env.config.encryption_mandatory);

        self.configure_rtcp_fb(ctx);
        self.configure_rtcp_xr(ctx);
        self.configure_rate_control(ctx, env.config);

        self.avpf = result.rtcp_fb.generic_nack || result.rtcp_fb.tmmbr;

        let result_session = ctx
            .result_session
            .expect("result stream implies a result session description");

        let bandwidth = match self.kind {
            StreamKind::Audio => profile::ideal_audio_bandwidth(result_session, result, env.config),
            StreamKind::Video => {
                profile::video_bandwidth(result_session, result, *env.audio_bandwidth, env.config)
            }
            StreamKind::Text => 0,
        };

        let build = profile::make_profile(result, bandwidth, env.config.upload_ptime);
        if self.kind == StreamKind::Audio {
            *env.audio_bandwidth = build.allocated_bandwidth;
            log::info!("Audio bandwidth is {} kbit/s", build.allocated_bandwidth);
        }

        self.engine
            .apply_profile(&build.profile, build.used_payload_type);
        self.used_payload_type = build.used_payload_type;
        self.profile = Some(build.profile);

        if self.state != StreamState::Running {
            if let Err(e) = self.engine.start() {
                log::error!("Stream #{}: failed to start: {e}", self.index);
            } else if self.main
                && self.kind == StreamKind::Audio
                && env.config.encryption == MediaEncryption::Zrtp
            {
                self.engine.start_zrtp();
            }
        }

        self.state = StreamState::Running;
    }

    fn apply_srtp_keys(&mut self, ctx: &StreamContext<'_>) {
        let Some(result) = ctx.result else { return };

        let local_key = ctx.local.and_then(|local| {
            let tag = result.crypto_local_tag?;
            local.crypto.iter().find(|crypto| crypto.tag == tag)
        });

        let Some(local_crypto) = local_key else {
            log::warn!(
                "Failed to find local crypto algo with tag: {:?}",
                result.crypto_local_tag
            );
            return;
        };

        let recv = &result.crypto[0];
        if let Some(key) = recv.keys.first() {
            self.engine.set_srtp_recv_key(&recv.suite, &key.key_and_salt);
        }
        if let Some(key) = local_crypto.keys.first() {
            self.engine
                .set_srtp_send_key(&local_crypto.suite, &key.key_and_salt);
        }
    }

    fn configure_rtcp_fb(&mut self, ctx: &StreamContext<'_>) {
        // No AVPF for anything but audio and video
        if self.kind == StreamKind::Text {
            return;
        }

        let Some(result) = ctx.result else { return };

        self.engine
            .enable_avpf_feature(AvpfFeature::GenericNack, result.rtcp_fb.generic_nack);
        self.engine
            .enable_avpf_feature(AvpfFeature::Tmmbr, result.rtcp_fb.tmmbr);
    }

    fn configure_rtcp_xr(&mut self, ctx: &StreamContext<'_>) {
        let (Some(local), Some(remote)) = (ctx.local, ctx.remote) else {
            return;
        };

        let config = match local.dir {
            Direction::Inactive => return,
            Direction::RecvOnly => {
                // Local config for unilateral parameters, remote config for
                // the collaborative ones
                RtcpXrSetup {
                    rcvr_rtt_mode: remote.rtcp_xr.rcvr_rtt_mode,
                    rcvr_rtt_max_size: remote.rtcp_xr.rcvr_rtt_max_size,
                    ..local.rtcp_xr
                }
            }
            _ => remote.rtcp_xr,
        };

        self.engine.configure_rtcp_xr(&config);
    }

    fn configure_rate_control(&mut self, ctx: &StreamContext<'_>, config: &MediaConfig) {
        if config.adaptive_rate == AdaptiveRateMode::Off {
            self.engine.set_rate_control(RateControl::Disabled);
            return;
        }

        let tmmbr_enabled = ctx
            .result
            .map(|result| result.rtcp_fb.tmmbr)
            .unwrap_or(false);

        let mut advanced = config.adaptive_rate == AdaptiveRateMode::Advanced;
        if advanced && !tmmbr_enabled {
            log::warn!(
                "Advanced adaptive rate control requested but avpf-tmmbr is not \
                 activated in this stream. Reverting to basic rate control instead"
            );
            advanced = false;
        }

        if advanced {
            log::info!("Setting up advanced rate control");
            self.engine.set_rate_control(RateControl::Advanced);
            return;
        }

        let video_will_be_used = ctx
            .result_session
            .map(SessionDescription::has_active_video)
            .unwrap_or(false);

        if self.kind == StreamKind::Audio && video_will_be_used {
            // Video is going to adapt, adapting audio as well is pointless
            self.engine.set_rate_control(RateControl::Disabled);
        } else {
            self.engine.set_rate_control(RateControl::Basic);
        }
    }

    fn jitter_buffer_params(&self, config: &MediaConfig) -> JitterBufferParams {
        let jb = &config.jitter_buffer;

        let (nominal, adaptive) = match self.kind {
            // Text uses the same sizing as audio
            StreamKind::Audio | StreamKind::Text => (jb.audio_nominal_ms, jb.audio_adaptive),
            StreamKind::Video => (jb.video_nominal_ms, jb.video_adaptive),
        };

        let mut min_size_ms = jb.min_size_ms;
        let mut max_size_ms = jb.max_size_ms;
        let enabled = nominal > 0;
        if enabled {
            min_size_ms = min_size_ms.min(nominal);
            max_size_ms = max_size_ms.max(nominal);
        }

        JitterBufferParams {
            enabled,
            nominal_size_ms: nominal,
            min_size_ms,
            max_size_ms,
            // Allow 200 packets per second, quite large
            max_packets: max_size_ms * 200 / 1000,
            adaptive,
            algorithm: JitterBufferAlgorithm::from_name(&jb.algorithm),
            refresh_period_ms: jb.refresh_period_ms,
            ramp_refresh_period_ms: jb.ramp_refresh_period_ms,
            ramp_step_ms: jb.ramp_step_ms,
            ramp_threshold: jb.ramp_threshold,
        }
    }

    /// Start the DTLS handshake when the round negotiated DTLS-SRTP
    pub(crate) fn start_dtls(&mut self, ctx: &StreamContext<'_>) {
        let Some(dtls) = ctx.result.and_then(|result| result.dtls.as_ref()) else {
            return;
        };

        let role = match dtls.setup {
            Setup::Active => DtlsRole::Client,
            Setup::Passive => DtlsRole::Server,
            Setup::ActPass | Setup::HoldConn => DtlsRole::Unset,
        };

        self.engine.start_dtls(role);
    }

    pub(crate) fn session_confirmed(&mut self, _ctx: &StreamContext<'_>) {
        log::debug!("Stream #{}: session confirmed", self.index);
        self.engine.session_confirmed();
    }

    /// Stop the stream and release its transport resources. Idempotent.
    pub(crate) fn stop(&mut self, env: &mut StreamEnv<'_>) {
        if self.state == StreamState::Stopped {
            return;
        }

        self.engine.set_rate_control(RateControl::Disabled);
        self.profile = None;
        self.used_payload_type = None;

        // Final statistics snapshot, then flush whatever the transport still
        // queued. Only reporting events are of interest at this point.
        self.stats = self.engine.stats();

        while let Some(event) = self.engine.pop_event() {
            if let EngineEvent::RtcpReceived(data) = event {
                for max_bitrate in tmmbr_requests(&data) {
                    env.events.push_back(SessionEvent::TmmbrReceived {
                        index: self.index,
                        max_bitrate,
                    });
                }
            }
        }

        env.events.push_back(SessionEvent::MediaInfoUpdated {
            index: self.index,
            kind: self.kind,
            stats: self.stats,
        });

        if self.kind == StreamKind::Audio {
            env.events.push_back(SessionEvent::ConferenceStreamStopping {
                index: self.index,
            });
        }

        self.engine.stop();
        self.next_pump = None;
        self.state = StreamState::Stopped;
    }

    // Event pump plumbing, driven by the owning group

    pub(crate) fn iterate_engine(&mut self) {
        self.engine.iterate();
    }

    pub(crate) fn pop_engine_event(&mut self) -> Option<EngineEvent> {
        self.engine.pop_event()
    }

    pub(crate) fn refresh_stats(&mut self) -> StreamStats {
        self.stats = self.engine.stats();
        self.stats
    }
}

/// Extract all TMMBR bitrate ceilings from a compound RTCP packet.
///
/// Only the framing needed to locate RTPFB TMMBR entries is interpreted,
/// every other packet in the compound is skipped by its length field.
pub(crate) fn tmmbr_requests(data: &[u8]) -> Vec<u64> {
    const RTCP_HEADER_LEN: usize = 4;
    /// Header plus sender and media SSRC
    const FB_HEADER_LEN: usize = 12;
    const RTPFB: u8 = 205;

    let mut requests = Vec::new();
    let mut rest = data;

    while rest.len() >= RTCP_HEADER_LEN {
        if rest[0] >> 6 != 2 {
            log::warn!("Failed to parse incoming RTCP packet: bad version");
            break;
        }

        let length = 4 * (usize::from(u16::from_be_bytes([rest[2], rest[3]])) + 1);
        if length > rest.len() {
            log::warn!("Truncated RTCP packet in compound packet");
            break;
        }

        let (packet, tail) = rest.split_at(length);
        rest = tail;

        let fmt = packet[0] & 0x1f;
        if packet[1] != RTPFB || fmt != RTPFB_TMMBR || packet.len() < FB_HEADER_LEN {
            continue;
        }

        // FCI entries: 32 bit SSRC, then 6 bit exponent, 17 bit mantissa
        // and 9 bit measured overhead
        for entry in packet[FB_HEADER_LEN..].chunks_exact(8) {
            let word = u32::from_be_bytes([entry[4], entry[5], entry[6], entry[7]]);
            let exponent = word >> 26;
            let mantissa = u64::from((word >> 9) & 0x1_ffff);
            requests.push(mantissa << exponent);
        }
    }

    requests
}
