use common::{audio_desc, make_group, session_with, video_desc};
use rtc_streams::config::MediaConfig;
use rtc_streams::context::OfferAnswerContext;
use rtc_streams::engine::StreamStats;
use rtc_streams::event::SessionEvent;
use rtc_streams::{NoOtherCalls, TargetState};
use std::time::{Duration, Instant};

mod common;

#[test]
fn audio_yields_headroom_when_video_is_present() {
    let (mut group, _, _) = make_group(MediaConfig::default());

    let local = session_with(vec![audio_desc(7078), video_desc(9078)]);

    let mut negotiated_audio = audio_desc(8078);
    negotiated_audio.bandwidth = Some(600);
    let negotiated = vec![negotiated_audio, video_desc(9578)];

    let remote = session_with(negotiated.clone());
    let result = session_with(negotiated);
    let ctx = OfferAnswerContext::new(Some(&local), Some(&remote), Some(&result), true);

    let now = Instant::now();
    group.create_streams(&ctx, &NoOtherCalls);
    group.prepare(now);
    group.render(&ctx, TargetState::Running, now, &NoOtherCalls);

    // 600 kbit/s declared, but video needs the headroom
    assert_eq!(group.audio_bandwidth(), 100);
}

#[test]
fn audio_keeps_the_declared_bandwidth_without_video() {
    let (mut group, _, _) = make_group(MediaConfig::default());

    let local = session_with(vec![audio_desc(7078)]);

    let mut negotiated_audio = audio_desc(8078);
    negotiated_audio.bandwidth = Some(600);

    let remote = session_with(vec![negotiated_audio.clone()]);
    let result = session_with(vec![negotiated_audio]);
    let ctx = OfferAnswerContext::new(Some(&local), Some(&remote), Some(&result), true);

    let now = Instant::now();
    group.create_streams(&ctx, &NoOtherCalls);
    group.prepare(now);
    group.render(&ctx, TargetState::Running, now, &NoOtherCalls);

    assert_eq!(group.audio_bandwidth(), 600);
}

#[test]
fn upload_cap_feeds_the_network_bitrate_limit() {
    let config = MediaConfig {
        upload_bandwidth: 512,
        ..Default::default()
    };
    let (mut group, created, _) = make_group(config);

    let local = session_with(vec![audio_desc(7078)]);
    let remote = session_with(vec![audio_desc(8078)]);
    let result = session_with(vec![audio_desc(8078)]);
    let ctx = OfferAnswerContext::new(Some(&local), Some(&remote), Some(&result), true);

    let now = Instant::now();
    group.create_streams(&ctx, &NoOtherCalls);
    group.prepare(now);
    group.render(&ctx, TargetState::Running, now, &NoOtherCalls);

    assert_eq!(
        created.borrow()[0].1.borrow().max_network_bitrate,
        Some(512_000)
    );
}

#[test]
fn bandwidth_report_ticks_once_per_second() {
    let (mut group, created, _) = make_group(MediaConfig::default());

    let local = session_with(vec![audio_desc(7078)]);
    let remote = session_with(vec![audio_desc(8078)]);
    let result = session_with(vec![audio_desc(8078)]);
    let ctx = OfferAnswerContext::new(Some(&local), Some(&remote), Some(&result), true);

    let now = Instant::now();
    group.create_streams(&ctx, &NoOtherCalls);
    group.prepare(now);
    group.render(&ctx, TargetState::Running, now, &NoOtherCalls);

    created.borrow()[0].1.borrow_mut().stats = StreamStats {
        rtp_download_bandwidth: 42.0,
        rtp_upload_bandwidth: 23.0,
        ..Default::default()
    };

    // The report is not due before a full period has passed
    group.poll(now + Duration::from_millis(500));
    assert_ne!(
        group.stream(0).unwrap().stats().rtp_download_bandwidth,
        42.0
    );

    group.poll(now + Duration::from_millis(1100));
    assert_eq!(
        group.stream(0).unwrap().stats().rtp_download_bandwidth,
        42.0
    );
}

#[test]
fn event_pump_deadline_drives_the_timeout() {
    let (mut group, _, _) = make_group(MediaConfig::default());

    let local = session_with(vec![audio_desc(7078)]);
    let ctx = OfferAnswerContext::new(Some(&local), None, None, true);

    let now = Instant::now();
    group.create_streams(&ctx, &NoOtherCalls);
    assert!(group.timeout(now).is_none());

    group.prepare(now);
    let timeout = group.timeout(now).unwrap();
    assert!(timeout <= Duration::from_millis(20));
}

#[test]
fn stats_refresh_surfaces_session_events() {
    let (mut group, created, _) = make_group(MediaConfig::default());

    let local = session_with(vec![audio_desc(7078)]);
    let remote = session_with(vec![audio_desc(8078)]);
    let result = session_with(vec![audio_desc(8078)]);
    let ctx = OfferAnswerContext::new(Some(&local), Some(&remote), Some(&result), true);

    let now = Instant::now();
    group.create_streams(&ctx, &NoOtherCalls);
    group.prepare(now);
    group.render(&ctx, TargetState::Running, now, &NoOtherCalls);
    while group.pop_event().is_some() {}

    created.borrow()[0].1.borrow_mut().stats.rtp_download_bandwidth = 64.0;
    created
        .borrow()[0]
        .1
        .borrow_mut()
        .events
        .push_back(rtc_streams::engine::EngineEvent::RtcpSent(vec![]));

    group.poll(now + Duration::from_millis(25));

    let mut saw_stats = false;
    while let Some(event) = group.pop_event() {
        if let SessionEvent::StatsUpdated { index, stats } = event {
            assert_eq!(index, 0);
            assert_eq!(stats.rtp_download_bandwidth, 64.0);
            saw_stats = true;
        }
    }
    assert!(saw_stats);
}
