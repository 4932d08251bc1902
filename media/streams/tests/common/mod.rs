#![allow(dead_code)]

use rtc_streams::config::MediaConfig;
use rtc_streams::description::{
    PayloadType, RtcpXrSetup, SessionDescription, StreamDescription, StreamKind,
};
use rtc_streams::engine::{
    AvpfFeature, DtlsParams, DtlsRole, EngineError, EngineEvent, EngineStream, JitterBufferParams,
    MediaEngine, RateControl, StreamPorts, StreamStats,
};
use rtc_streams::ice::{IceAgent, IceConnectionState, IceGatheringState};
use rtc_streams::{PortUsage, StreamsGroup};
use sdp_types::SrtpSuite;
use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::rc::Rc;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Observable state of one fake engine stream, shared with the test body.
pub struct FakeStreamState {
    pub bound: Option<(IpAddr, Option<StreamPorts>)>,
    /// What `local_ports` reports after binding with ephemeral ports
    pub allocated_ports: Option<StreamPorts>,
    pub started: bool,
    pub stopped: bool,
    pub secured: bool,
    pub muted: bool,
    pub average_quality: f32,
    pub current_quality: f32,
    pub stats: StreamStats,
    pub events: VecDeque<EngineEvent>,
    pub iterations: u32,

    pub rtcp_mux: Option<bool>,
    pub avpf_features: Vec<(AvpfFeature, bool)>,
    pub rtcp_xr: Option<RtcpXrSetup>,
    pub jitter_buffer: Option<JitterBufferParams>,
    pub rate_control: Option<RateControl>,
    pub max_network_bitrate: Option<u32>,
    pub encryption_mandatory: Option<bool>,
    pub srtp_recv_key: Option<(String, String)>,
    pub srtp_send_key: Option<(String, String)>,
    pub dtls_enabled: bool,
    pub dtls_started: Option<DtlsRole>,
    pub zrtp_started: bool,
    pub zrtp_keys_derived: bool,
    pub has_zrtp_context: bool,
    pub sas_verified: Option<bool>,
    pub profile_numbers: Vec<u8>,
    pub used_payload_type: Option<u8>,
    pub multicast_joined: Option<IpAddr>,
    pub session_confirmed: bool,
}

impl Default for FakeStreamState {
    fn default() -> Self {
        FakeStreamState {
            bound: None,
            allocated_ports: None,
            started: false,
            stopped: false,
            secured: false,
            muted: false,
            average_quality: -1.0,
            current_quality: -1.0,
            stats: StreamStats::default(),
            events: VecDeque::new(),
            iterations: 0,
            rtcp_mux: None,
            avpf_features: Vec::new(),
            rtcp_xr: None,
            jitter_buffer: None,
            rate_control: None,
            max_network_bitrate: None,
            encryption_mandatory: None,
            srtp_recv_key: None,
            srtp_send_key: None,
            dtls_enabled: false,
            dtls_started: None,
            zrtp_started: false,
            zrtp_keys_derived: false,
            has_zrtp_context: false,
            sas_verified: None,
            profile_numbers: Vec::new(),
            used_payload_type: None,
            multicast_joined: None,
            session_confirmed: false,
        }
    }
}

pub type StreamHandle = Rc<RefCell<FakeStreamState>>;

pub struct FakeEngineStream {
    kind: StreamKind,
    state: StreamHandle,
}

impl EngineStream for FakeEngineStream {
    fn kind(&self) -> StreamKind {
        self.kind
    }

    fn bind(&mut self, bind_addr: IpAddr, ports: Option<StreamPorts>) -> Result<(), EngineError> {
        self.state.borrow_mut().bound = Some((bind_addr, ports));
        Ok(())
    }

    fn local_ports(&self) -> Option<StreamPorts> {
        let state = self.state.borrow();
        state.bound.and_then(|(_, ports)| ports).or(state.allocated_ports)
    }

    fn join_multicast_group(&mut self, addr: IpAddr) -> Result<(), EngineError> {
        self.state.borrow_mut().multicast_joined = Some(addr);
        Ok(())
    }

    fn set_multicast_ttl(&mut self, _ttl: u8) {}

    fn enable_rtcp_mux(&mut self, enabled: bool) {
        self.state.borrow_mut().rtcp_mux = Some(enabled);
    }

    fn enable_avpf_feature(&mut self, feature: AvpfFeature, enabled: bool) {
        self.state.borrow_mut().avpf_features.push((feature, enabled));
    }

    fn configure_rtcp_xr(&mut self, config: &RtcpXrSetup) {
        self.state.borrow_mut().rtcp_xr = Some(*config);
    }

    fn set_jitter_buffer_params(&mut self, params: &JitterBufferParams) {
        self.state.borrow_mut().jitter_buffer = Some(*params);
    }

    fn set_symmetric_rtp(&mut self, _enabled: bool) {}

    fn set_source_description(&mut self, _cname: &str, _tool: &str) {}

    fn set_dscp(&mut self, _dscp: u8) {}

    fn set_srtp_recv_key(&mut self, suite: &SrtpSuite, key_b64: &str) {
        self.state.borrow_mut().srtp_recv_key =
            Some((suite.as_str().to_string(), key_b64.to_string()));
    }

    fn set_srtp_send_key(&mut self, suite: &SrtpSuite, key_b64: &str) {
        self.state.borrow_mut().srtp_send_key =
            Some((suite.as_str().to_string(), key_b64.to_string()));
    }

    fn set_encryption_mandatory(&mut self, mandatory: bool) {
        self.state.borrow_mut().encryption_mandatory = Some(mandatory);
    }

    fn set_max_network_bitrate(&mut self, bitrate: u32) {
        self.state.borrow_mut().max_network_bitrate = Some(bitrate);
    }

    fn set_rate_control(&mut self, control: RateControl) {
        self.state.borrow_mut().rate_control = Some(control);
    }

    fn enable_dtls(&mut self, _params: &DtlsParams<'_>) {
        self.state.borrow_mut().dtls_enabled = true;
    }

    fn start_dtls(&mut self, role: DtlsRole) {
        self.state.borrow_mut().dtls_started = Some(role);
    }

    fn start_zrtp(&mut self) {
        self.state.borrow_mut().zrtp_started = true;
    }

    fn derive_zrtp_keys(&mut self) {
        self.state.borrow_mut().zrtp_keys_derived = true;
    }

    fn has_zrtp_context(&self) -> bool {
        self.state.borrow().has_zrtp_context
    }

    fn set_zrtp_sas_verified(&mut self, verified: bool) {
        self.state.borrow_mut().sas_verified = Some(verified);
    }

    fn apply_profile(&mut self, profile: &rtc_streams::RtpProfile, used_payload_type: Option<u8>) {
        let mut state = self.state.borrow_mut();
        state.profile_numbers = profile.payloads().map(|payload| payload.number).collect();
        state.used_payload_type = used_payload_type;
    }

    fn start(&mut self) -> Result<(), EngineError> {
        self.state.borrow_mut().started = true;
        Ok(())
    }

    fn iterate(&mut self) {
        self.state.borrow_mut().iterations += 1;
    }

    fn pop_event(&mut self) -> Option<EngineEvent> {
        self.state.borrow_mut().events.pop_front()
    }

    fn stats(&self) -> StreamStats {
        self.state.borrow().stats
    }

    fn is_secured(&self) -> bool {
        self.state.borrow().secured
    }

    fn is_muted(&self) -> bool {
        self.state.borrow().muted
    }

    fn average_quality(&self) -> f32 {
        self.state.borrow().average_quality
    }

    fn current_quality(&self) -> f32 {
        self.state.borrow().current_quality
    }

    fn session_confirmed(&mut self) {
        self.state.borrow_mut().session_confirmed = true;
    }

    fn stop(&mut self) {
        self.state.borrow_mut().stopped = true;
    }
}

/// Record of all engine streams a [`FakeEngine`] created.
pub type CreatedStreams = Rc<RefCell<Vec<(StreamKind, StreamHandle)>>>;

#[derive(Default)]
pub struct FakeEngine {
    created: CreatedStreams,
}

impl FakeEngine {
    pub fn new() -> (FakeEngine, CreatedStreams) {
        let engine = FakeEngine::default();
        let created = engine.created.clone();
        (engine, created)
    }
}

impl MediaEngine for FakeEngine {
    fn create_stream(&mut self, kind: StreamKind) -> Result<Box<dyn EngineStream>, EngineError> {
        let state = StreamHandle::default();
        self.created.borrow_mut().push((kind, state.clone()));
        Ok(Box::new(FakeEngineStream { kind, state }))
    }
}

pub struct FakeIceState {
    pub session: bool,
    pub completed: bool,
    pub prepared: Vec<usize>,
    pub checks_started: u32,
    pub deleted: bool,
}

impl Default for FakeIceState {
    fn default() -> Self {
        FakeIceState {
            session: false,
            // Without an ICE session nothing gates on connectivity checks
            completed: true,
            prepared: Vec::new(),
            checks_started: 0,
            deleted: false,
        }
    }
}

pub type IceHandle = Rc<RefCell<FakeIceState>>;

#[derive(Default)]
pub struct FakeIce {
    state: IceHandle,
}

impl FakeIce {
    pub fn new() -> (FakeIce, IceHandle) {
        let agent = FakeIce::default();
        let state = agent.state.clone();
        (agent, state)
    }
}

impl IceAgent for FakeIce {
    fn has_session(&self) -> bool {
        self.state.borrow().session
    }

    fn has_completed(&self) -> bool {
        self.state.borrow().completed
    }

    fn prepare_stream(&mut self, index: usize) {
        self.state.borrow_mut().prepared.push(index);
    }

    fn start_connectivity_checks(&mut self) {
        self.state.borrow_mut().checks_started += 1;
    }

    fn connection_state(&self) -> Option<IceConnectionState> {
        None
    }

    fn gathering_state(&self) -> Option<IceGatheringState> {
        None
    }

    fn delete_session(&mut self) {
        self.state.borrow_mut().deleted = true;
    }
}

/// [`PortUsage`] over a plain set of ports.
#[derive(Default)]
pub struct UsedPorts(pub RefCell<HashSet<u16>>);

impl UsedPorts {
    pub fn with(ports: impl IntoIterator<Item = u16>) -> Self {
        UsedPorts(RefCell::new(ports.into_iter().collect()))
    }
}

impl PortUsage for UsedPorts {
    fn is_port_used(&self, port: u16) -> bool {
        self.0.borrow().contains(&port)
    }
}

/// [`PortUsage`] that claims every port is taken.
pub struct AllPortsUsed;

impl PortUsage for AllPortsUsed {
    fn is_port_used(&self, _port: u16) -> bool {
        true
    }
}

pub fn make_group(config: MediaConfig) -> (StreamsGroup, CreatedStreams, IceHandle) {
    init_logging();

    let (engine, created) = FakeEngine::new();
    let (ice, ice_state) = FakeIce::new();

    let group = StreamsGroup::new(config, Box::new(engine), Box::new(ice));
    (group, created, ice_state)
}

pub fn audio_desc(port: u16) -> StreamDescription {
    let mut desc = StreamDescription::new(StreamKind::Audio);
    desc.rtp_addr = Some("192.168.1.10".parse().unwrap());
    desc.rtp_port = port;
    desc.rtcp_port = port + 1;
    desc.payloads = vec![PayloadType::new(0, "PCMU", 8000)];
    desc
}

pub fn video_desc(port: u16) -> StreamDescription {
    let mut desc = StreamDescription::new(StreamKind::Video);
    desc.rtp_addr = Some("192.168.1.10".parse().unwrap());
    desc.rtp_port = port;
    desc.rtcp_port = port + 1;
    desc.payloads = vec![PayloadType::new(96, "VP8", 90000)];
    desc
}

pub fn session_with(streams: Vec<StreamDescription>) -> SessionDescription {
    let mut session = SessionDescription::new();
    session.streams = streams;
    session
}
