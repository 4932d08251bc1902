//! # StreamsGroup
//!
//! The ordered collection of media streams of one call session. The group
//! drives creation, renegotiation, rendering and teardown across all of its
//! streams, owns the ICE agent they share, aggregates cross-stream state
//! (bandwidth, quality, mute, encryption) and runs the periodic event pump
//! and bandwidth report.
//!
//! The signaling layer calls [`create_streams`](StreamsGroup::create_streams),
//! [`prepare`](StreamsGroup::prepare) and [`render`](StreamsGroup::render) in
//! sequence for every offer/answer round, then keeps the group alive with
//! [`poll`](StreamsGroup::poll) / [`timeout`](StreamsGroup::timeout) until
//! the call ends with [`clear_streams`](StreamsGroup::clear_streams).

use crate::config::MediaConfig;
use crate::context::{OfferAnswerContext, OfferAnswerState};
use crate::description::StreamKind;
use crate::engine::{EngineEvent, MediaEngine};
use crate::event::{RtcpDirection, SessionEvent};
use crate::ice::IceAgent;
use crate::stream::{
    EVENT_POLL_INTERVAL, PortUsage, Stream, StreamEnv, StreamState, TargetState, tmmbr_requests,
};
use sdp_types::Fingerprint;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Period of the aggregate bandwidth report
const BANDWIDTH_REPORT_INTERVAL: Duration = Duration::from_secs(1);

type PostRenderHook = Box<dyn FnOnce()>;

/// All media streams of one call session.
pub struct StreamsGroup {
    config: MediaConfig,
    engine: Box<dyn MediaEngine>,
    ice_agent: Box<dyn IceAgent>,

    /// Streams indexed by their position in the session description. Slots
    /// are empty when stream creation failed for that index.
    streams: Vec<Option<Stream>>,

    /// The last rendered offer/answer round, diffed against the next one
    current_state: OfferAnswerState,

    next_bandwidth_report: Option<Instant>,
    post_render_hooks: Vec<PostRenderHook>,

    /// Audio bandwidth allocated to this group, kbit/s
    audio_bandwidth: i32,
    /// Local DTLS certificate fingerprint for the signaling layer
    dtls_fingerprint: Option<Fingerprint>,

    auth_token: Option<String>,
    auth_token_verified: bool,

    events: VecDeque<SessionEvent>,
}

impl StreamsGroup {
    pub fn new(
        config: MediaConfig,
        engine: Box<dyn MediaEngine>,
        ice_agent: Box<dyn IceAgent>,
    ) -> Self {
        StreamsGroup {
            config,
            engine,
            ice_agent,
            streams: Vec::new(),
            current_state: OfferAnswerState::default(),
            next_bandwidth_report: None,
            post_render_hooks: Vec::new(),
            audio_bandwidth: 0,
            dtls_fingerprint: None,
            auth_token: None,
            auth_token_verified: false,
            events: VecDeque::new(),
        }
    }

    pub fn ice_agent(&self) -> &dyn IceAgent {
        &*self.ice_agent
    }

    pub fn ice_agent_mut(&mut self) -> &mut dyn IceAgent {
        &mut *self.ice_agent
    }

    pub fn config(&self) -> &MediaConfig {
        &self.config
    }

    /// Ensure a stream of the right kind exists for every index of the local
    /// session description.
    ///
    /// Calling this again with an unchanged description is a no-op. A kind
    /// change of an existing index is logged and left alone.
    pub fn create_streams(
        &mut self,
        params: &OfferAnswerContext<'_>,
        ports_in_use: &dyn PortUsage,
    ) {
        for index in 0..params.local_stream_count() {
            let scoped = params.scope_to_index(index);
            let local = scoped
                .local
                .expect("indices iterate the local description's own stream list");

            if index >= self.streams.len() {
                self.streams.resize_with(index + 1, || None);
            }

            match &self.streams[index] {
                Some(stream) if stream.kind() != local.kind => {
                    log::error!(
                        "Inconsistency detected while creating streams. Type has changed \
                         from {} to {}!",
                        stream.kind(),
                        local.kind
                    );
                }
                Some(_) => {}
                None => {
                    let main = !self
                        .streams
                        .iter()
                        .flatten()
                        .any(|stream| stream.kind() == local.kind);

                    // Ports of this group's own streams are taken as well
                    let ports_in_use = WithOwnPorts {
                        own: used_ports(&self.streams),
                        outer: ports_in_use,
                    };

                    match Stream::new(
                        local.kind,
                        index,
                        main,
                        &scoped,
                        &mut *self.engine,
                        &self.config,
                        &ports_in_use,
                    ) {
                        Ok(stream) => self.streams[index] = Some(stream),
                        Err(e) => {
                            log::error!("Could not create stream of type {}: {e}", local.kind);
                        }
                    }
                }
            }
        }
    }

    /// Allocate transport resources on every stream that is still Stopped.
    pub fn prepare(&mut self, now: Instant) {
        let Self {
            streams,
            config,
            events,
            audio_bandwidth,
            dtls_fingerprint,
            ice_agent,
            ..
        } = self;

        let mut env = StreamEnv {
            config,
            events,
            audio_bandwidth,
            dtls_fingerprint,
        };

        for stream in streams.iter_mut().flatten() {
            if stream.state() == StreamState::Stopped {
                stream.prepare(now, &mut env);
                ice_agent.prepare_stream(stream.index());
            }
        }
    }

    /// Apply the configuration of one offer/answer round to every stream, in
    /// ascending index order.
    ///
    /// A stream whose destination toggled between unicast and multicast is
    /// stopped and recreated in place before rendering, a live transport
    /// cannot change its cast.
    pub fn render(
        &mut self,
        params: &OfferAnswerContext<'_>,
        target: TargetState,
        now: Instant,
        ports_in_use: &dyn PortUsage,
    ) {
        let Self {
            streams,
            config,
            events,
            audio_bandwidth,
            dtls_fingerprint,
            current_state,
            engine,
            ..
        } = self;

        let mut env = StreamEnv {
            config,
            events,
            audio_bandwidth,
            dtls_fingerprint,
        };

        for index in 0..streams.len() {
            if streams[index].is_none() {
                continue;
            }

            log::info!("Rendering stream #{index}");

            let (scoped, diff) = params.scope_to_index_with_diff(index, current_state);

            if diff.local.any() {
                log::info!("Local stream description has changed: {}", diff.local);
            }
            if diff.result.any() {
                log::info!("Result stream description has changed: {}", diff.result);
            }

            if diff.cast_changed() {
                // Switching between unicast and multicast needs a fresh
                // transport, replace the stream instance in place
                let mut old = streams[index].take().expect("checked above");
                old.stop(&mut env);

                let kind = scoped.local.map(|local| local.kind).unwrap_or(old.kind());

                let ports_in_use = WithOwnPorts {
                    own: used_ports(streams),
                    outer: ports_in_use,
                };

                match Stream::new(
                    kind,
                    index,
                    old.is_main(),
                    &scoped,
                    &mut **engine,
                    env.config,
                    &ports_in_use,
                ) {
                    Ok(stream) => streams[index] = Some(stream),
                    Err(e) => {
                        log::error!("Could not recreate stream #{index}: {e}");
                        continue;
                    }
                }
            }

            let stream = streams[index].as_mut().expect("slot filled above");

            if stream.state() == StreamState::Stopped {
                stream.prepare(now, &mut env);
            }
            if stream.state() == StreamState::Preparing {
                stream.finish_prepare();
            }

            stream.render(&scoped, &mut env, target);
        }

        if self.next_bandwidth_report.is_none() {
            self.next_bandwidth_report = Some(now + BANDWIDTH_REPORT_INTERVAL);
        }

        for hook in self.post_render_hooks.drain(..) {
            hook();
        }

        if !self.ice_agent.has_completed() {
            self.ice_agent.start_connectivity_checks();
        } else {
            // DTLS must not start before ICE has settled on a path
            self.start_dtls(params);
        }

        // Keep this round to diff the next render against it
        self.current_state = params.to_owned();
    }

    fn start_dtls(&mut self, params: &OfferAnswerContext<'_>) {
        for stream in self.streams.iter_mut().flatten() {
            let scoped = params.scope_to_index(stream.index());
            stream.start_dtls(&scoped);
        }
    }

    /// Notify every stream that the signaling session was definitively
    /// confirmed.
    pub fn session_confirmed(&mut self) {
        let Self {
            streams,
            current_state,
            ..
        } = self;

        for stream in streams.iter_mut().flatten() {
            let scoped = current_state.scope_to_index(stream.index());
            stream.session_confirmed(&scoped);
        }
    }

    /// Stop every stream that is not already Stopped.
    pub fn stop(&mut self) {
        self.next_bandwidth_report = None;

        let Self {
            streams,
            config,
            events,
            audio_bandwidth,
            dtls_fingerprint,
            ..
        } = self;

        let mut env = StreamEnv {
            config,
            events,
            audio_bandwidth,
            dtls_fingerprint,
        };

        for stream in streams.iter_mut().flatten() {
            if stream.state() != StreamState::Stopped {
                stream.stop(&mut env);
            }
        }
    }

    /// Tear everything down at the end of the call: stop all streams,
    /// release the ICE session and drop the retained offer/answer state.
    pub fn clear_streams(&mut self) {
        self.stop();
        self.ice_agent.delete_session();
        self.streams.clear();
        self.current_state.clear();
    }

    /// Defer a callback to run exactly once after the next render, in
    /// enqueue order.
    pub fn add_post_render_hook(&mut self, hook: impl FnOnce() + 'static) {
        self.post_render_hooks.push(Box::new(hook));
    }

    pub fn stream(&self, index: usize) -> Option<&Stream> {
        let Some(stream) = self.streams.get(index) else {
            log::error!("Bad stream index {index}");
            return None;
        };
        stream.as_ref()
    }

    /// All existing streams in index order
    pub fn streams(&self) -> impl Iterator<Item = &Stream> {
        self.streams.iter().flatten()
    }

    /// The designated main stream of a kind
    pub fn lookup_main_stream(&self, kind: StreamKind) -> Option<&Stream> {
        self.streams()
            .find(|stream| stream.is_main() && stream.kind() == kind)
    }

    /// Audio bandwidth currently allocated to this group, kbit/s
    pub fn audio_bandwidth(&self) -> i32 {
        self.audio_bandwidth
    }

    /// Fingerprint of the local DTLS certificate, available once a stream
    /// prepared with DTLS encryption
    pub fn dtls_fingerprint(&self) -> Option<&Fingerprint> {
        self.dtls_fingerprint.as_ref()
    }

    /// ZRTP authentication token of the session, once negotiated
    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub fn auth_token_verified(&self) -> bool {
        self.auth_token_verified
    }

    /// Record the user's verdict on the ZRTP authentication string.
    ///
    /// Without a running main audio stream or without a ZRTP context this
    /// logs an error and changes nothing.
    pub fn set_auth_token_verified(&mut self, verified: bool) {
        let main_audio = self
            .streams
            .iter_mut()
            .flatten()
            .find(|stream| stream.is_main() && stream.kind() == StreamKind::Audio);

        let Some(stream) = main_audio.filter(|stream| stream.state() == StreamState::Running)
        else {
            log::error!("set_auth_token_verified(): no audio stream or not started");
            return;
        };

        if !stream.has_zrtp_context() {
            log::error!("set_auth_token_verified(): no zrtp context");
            return;
        }

        stream.set_zrtp_sas_verified(verified);
        self.auth_token_verified = verified;
    }

    fn auth_token_ready(&mut self, token: String, verified: bool) {
        log::info!(
            "Authentication token is {token} ({})",
            if verified { "verified" } else { "unverified" }
        );

        self.auth_token = Some(token.clone());
        self.auth_token_verified = verified;
        self.events
            .push_back(SessionEvent::AuthTokenReady { token, verified });
    }

    // ==== Cross-stream aggregates

    /// Number of streams in the Running state
    pub fn active_streams_count(&self) -> usize {
        self.streams()
            .filter(|stream| stream.state() == StreamState::Running)
            .count()
    }

    /// Returns if at least one stream is Running
    pub fn is_started(&self) -> bool {
        self.streams()
            .any(|stream| stream.state() == StreamState::Running)
    }

    /// Returns if at least one stream is Running and every Running stream
    /// reports encrypted media.
    pub fn all_streams_encrypted(&self) -> bool {
        let mut active_stream_count = 0;

        for stream in self.streams() {
            if stream.state() == StreamState::Running {
                active_stream_count += 1;
                if !stream.is_encrypted() {
                    return false;
                }
            }
        }

        active_stream_count > 0
    }

    /// Returns if every Running stream is muted. Vacuously true without any
    /// Running stream.
    pub fn is_muted(&self) -> bool {
        self.streams()
            .filter(|stream| stream.state() == StreamState::Running)
            .all(|stream| stream.is_muted())
    }

    /// Mean of the average quality ratings of all streams that report one,
    /// -1.0 when none does.
    pub fn average_quality(&self) -> f32 {
        self.overall_quality(Stream::average_quality)
    }

    /// Mean of the current quality ratings of all streams that report one,
    /// -1.0 when none does.
    pub fn current_quality(&self) -> f32 {
        self.overall_quality(Stream::current_quality)
    }

    fn overall_quality(&self, rating: impl Fn(&Stream) -> f32) -> f32 {
        let mut sum = 0.0;
        let mut counted = 0;

        for stream in self.streams() {
            let rating = rating(stream);
            if rating != -1.0 {
                sum += rating;
                counted += 1;
            }
        }

        if counted == 0 {
            return -1.0;
        }

        sum / counted as f32
    }

    /// Returns if AVPF was negotiated on every Running stream, and at least
    /// one stream is Running.
    pub fn avpf_enabled(&self) -> bool {
        let mut any_running = false;

        for stream in self.streams() {
            if stream.state() == StreamState::Running {
                any_running = true;
                if !stream.avpf_enabled() {
                    return false;
                }
            }
        }

        any_running
    }

    /// Largest AVPF regular RTCP report interval of all streams, ms
    pub fn avpf_rr_interval_ms(&self) -> u32 {
        self.streams()
            .map(Stream::avpf_rr_interval_ms)
            .max()
            .unwrap_or(0)
    }

    /// Returns if `port` matches the RTP or RTCP port of any stream
    pub fn is_port_used(&self, port: u16) -> bool {
        self.streams().any(|stream| stream.is_port_used(port))
    }

    // ==== Event pump

    /// Duration after which [`poll`](Self::poll) must be called
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        let mut deadline: Option<Instant> = None;

        for stream in self.streams() {
            deadline = opt_min(deadline, stream.next_pump);
        }
        deadline = opt_min(deadline, self.next_bandwidth_report);

        deadline.map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Drive all periodic work that is due: each stream's event pump and the
    /// bandwidth report.
    pub fn poll(&mut self, now: Instant) {
        for index in 0..self.streams.len() {
            let due = self.streams[index]
                .as_ref()
                .and_then(|stream| stream.next_pump)
                .is_some_and(|deadline| deadline <= now);

            if due {
                self.pump_stream(index);

                if let Some(stream) = self.streams[index].as_mut() {
                    if stream.next_pump.is_some() {
                        stream.next_pump = Some(now + EVENT_POLL_INTERVAL);
                    }
                }
            }
        }

        if let Some(deadline) = self.next_bandwidth_report {
            if now >= deadline {
                self.compute_and_report_bandwidth();
                self.next_bandwidth_report = Some(now + BANDWIDTH_REPORT_INTERVAL);
            }
        }
    }

    /// Returns if [`pop_event`](Self::pop_event) will yield an event
    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Next event for the owning call session
    pub fn pop_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    fn pump_stream(&mut self, index: usize) {
        if let Some(stream) = self.streams[index].as_mut() {
            stream.iterate_engine();
        }

        // The event queue is drained to exhaustion and the stream is looked
        // up again for every event: handling one may replace the instance
        loop {
            let event = {
                let Some(stream) = self.streams.get_mut(index).and_then(Option::as_mut) else {
                    break;
                };
                match stream.pop_engine_event() {
                    Some(event) => event,
                    None => break,
                }
            };

            self.handle_engine_event(index, event);
        }
    }

    fn handle_engine_event(&mut self, index: usize, event: EngineEvent) {
        // Every event may have moved the engine's counters
        if let Some(stream) = self.streams.get_mut(index).and_then(Option::as_mut) {
            stream.refresh_stats();
        }

        match event {
            EngineEvent::RtcpReceived(data) => {
                for max_bitrate in tmmbr_requests(&data) {
                    self.events.push_back(SessionEvent::TmmbrReceived {
                        index,
                        max_bitrate,
                    });
                }

                self.notify_stats_updated(index, RtcpDirection::Received);
            }
            EngineEvent::RtcpSent(_) => {
                self.notify_stats_updated(index, RtcpDirection::Sent);
            }
            EngineEvent::ZrtpEncryptionChanged { encrypted } => {
                let (kind, main) = match self.streams.get(index).and_then(Option::as_ref) {
                    Some(stream) => (stream.kind(), stream.is_main()),
                    None => return,
                };

                if main && kind == StreamKind::Audio {
                    if encrypted {
                        self.zrtp_started(index);
                    } else {
                        self.propagate_encryption_changed();
                    }
                } else {
                    self.propagate_encryption_changed();
                }
            }
            EngineEvent::DtlsEncryptionChanged { encrypted: _ } => {
                self.propagate_encryption_changed();
            }
            EngineEvent::ZrtpSasReady { token, verified } => {
                self.auth_token_ready(token, verified);
            }
            EngineEvent::Ice(event) => {
                // Only the signaling layer can act on these
                self.events.push_back(SessionEvent::Ice { index, event });
            }
        }
    }

    fn notify_stats_updated(&mut self, index: usize, direction: RtcpDirection) {
        let Some(stream) = self.streams.get_mut(index).and_then(Option::as_mut) else {
            return;
        };

        let stats = stream.refresh_stats();
        self.events
            .push_back(SessionEvent::RtcpUpdate { index, direction });
        self.events
            .push_back(SessionEvent::StatsUpdated { index, stats });
    }

    /// The main stream finished its ZRTP handshake: let every other stream
    /// derive its keys from the shared master secret, then notify the
    /// session once.
    fn zrtp_started(&mut self, main_index: usize) {
        for stream in self.streams.iter_mut().flatten() {
            if stream.index() != main_index {
                stream.derive_zrtp_keys();
            }
        }

        self.propagate_encryption_changed();
    }

    fn propagate_encryption_changed(&mut self) {
        self.events.push_back(SessionEvent::EncryptionChanged);
    }

    fn compute_and_report_bandwidth(&mut self) {
        for stream in self.streams.iter_mut().flatten() {
            stream.refresh_stats();
        }

        if !log::log_enabled!(log::Level::Info) {
            return;
        }

        for stream in self.streams() {
            if stream.state() != StreamState::Running {
                continue;
            }

            let stats = stream.stats();
            let estimated = stats
                .estimated_download_bandwidth
                .map(|bw| format!(" Est max d={bw:.2}"))
                .unwrap_or_default();

            log::info!(
                "Stream #{} ({}) RTP: [d={:.2},u={:.2}] RTCP: [d={:.2},u={:.2}]{estimated} (kbit/s)",
                stream.index(),
                stream.kind(),
                stats.rtp_download_bandwidth,
                stats.rtp_upload_bandwidth,
                stats.rtcp_download_bandwidth,
                stats.rtcp_upload_bandwidth,
            );
        }
    }
}

impl PortUsage for StreamsGroup {
    fn is_port_used(&self, port: u16) -> bool {
        StreamsGroup::is_port_used(self, port)
    }
}

fn opt_min(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (None, None) => None,
        (None, Some(b)) => Some(b),
        (Some(a), None) => Some(a),
        (Some(a), Some(b)) => Some(a.min(b)),
    }
}

fn used_ports(streams: &[Option<Stream>]) -> Vec<u16> {
    let mut ports = Vec::new();

    for stream in streams.iter().flatten() {
        if let Some(stream_ports) = stream.ports() {
            ports.push(stream_ports.rtp);
            ports.extend(stream_ports.rtcp);
        }
    }

    ports
}

/// Port usage of an outer registry combined with this group's own streams
struct WithOwnPorts<'a> {
    own: Vec<u16>,
    outer: &'a dyn PortUsage,
}

impl PortUsage for WithOwnPorts<'_> {
    fn is_port_used(&self, port: u16) -> bool {
        self.own.contains(&port) || self.outer.is_port_used(port)
    }
}
