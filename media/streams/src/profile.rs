//! RTP profile construction and bandwidth budgeting.
//!
//! Bandwidth figures are kbit/s throughout, values of 0 or less mean
//! "unlimited" so that configuration and SDP `b=AS` values can be combined
//! without a separate sentinel type.

use crate::config::MediaConfig;
use crate::description::{PayloadType, SessionDescription, StreamDescription, StreamKind};
use std::collections::BTreeMap;

/// Per packet IPv4 + UDP + RTP header overhead in bytes
const PACKET_OVERHEAD: i32 = 40;

/// Packet rate assumed when a codec does not negotiate a ptime
const DEFAULT_PACKETS_PER_SECOND: i32 = 50;

/// Codec profile applied to a stream's RTP session for one round.
///
/// Built fresh on every render from the negotiated codec list so that
/// renegotiations never mutate payload types of a running profile in place.
#[derive(Debug, Default)]
pub struct RtpProfile {
    entries: BTreeMap<u8, PayloadType>,
}

impl RtpProfile {
    pub fn payload(&self, number: u8) -> Option<&PayloadType> {
        self.entries.get(&number)
    }

    pub fn payloads(&self) -> impl Iterator<Item = &PayloadType> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, payload: PayloadType) {
        if self.entries.contains_key(&payload.number) {
            log::warn!(
                "A payload type with number {} already exists in profile",
                payload.number
            );
            return;
        }

        self.entries.insert(payload.number, payload);
    }
}

/// Outcome of building the profile for one stream.
pub(crate) struct ProfileBuild {
    pub(crate) profile: RtpProfile,
    /// Payload type number the stream sends with, the first entry that is
    /// not telephone-event
    pub(crate) used_payload_type: Option<u8>,
    /// Bandwidth allocated to the stream after codec specific adjustment,
    /// kbit/s
    pub(crate) allocated_bandwidth: i32,
}

/// Build the RTP profile for a stream from its negotiated codec list.
///
/// The first codec enabled for sending is the selected one, it drives the
/// final bandwidth allocation and the outbound ptime. Duplicate payload type
/// numbers keep the first registration.
pub(crate) fn make_profile(
    desc: &StreamDescription,
    mut bandwidth: i32,
    configured_up_ptime: u32,
) -> ProfileBuild {
    let mut profile = RtpProfile::default();
    let mut used_payload_type = None;
    let mut first = true;
    let mut up_ptime = 0;

    for payload in &desc.payloads {
        // Work on a copy, the description stays untouched for later diffs
        let mut payload = payload.clone();

        if first && payload.send_enabled {
            // First sendable codec in the list is the selected one
            if desc.kind == StreamKind::Audio {
                bandwidth = audio_payload_type_bandwidth(&payload, bandwidth);
                up_ptime = configured_up_ptime;
            }
            first = false;
        }

        if used_payload_type.is_none() && !payload.is_telephone_event() {
            used_payload_type = Some(payload.number);
        }

        if let Some(override_bitrate) = payload.bitrate_override {
            log::info!(
                "Payload type [{}/{}] has explicit bitrate [{}] kbit/s",
                payload.encoding,
                payload.clock_rate,
                override_bitrate / 1000
            );
            payload.bitrate = Some(min_bandwidth(override_bitrate, bandwidth * 1000));
        } else {
            payload.bitrate = Some(bandwidth * 1000);
        }

        if let Some(maxptime) = desc.maxptime {
            append_fmtp(&mut payload.send_fmtp, &format!("maxptime={maxptime}"));
        }

        let ptime = desc.ptime.unwrap_or(up_ptime);
        if ptime > 0 {
            append_fmtp(&mut payload.send_fmtp, &format!("ptime={ptime}"));
        }

        profile.insert(payload);
    }

    ProfileBuild {
        profile,
        used_payload_type,
        allocated_bandwidth: bandwidth,
    }
}

fn append_fmtp(fmtp: &mut Option<String>, param: &str) {
    match fmtp {
        Some(fmtp) => {
            fmtp.push(';');
            fmtp.push_str(param);
        }
        None => *fmtp = Some(param.to_string()),
    }
}

/// Smaller of two bandwidths, 0 or less counting as unlimited.
pub(crate) fn min_bandwidth(a: i32, b: i32) -> i32 {
    if a <= 0 {
        return b;
    }
    if b <= 0 {
        return a;
    }
    a.min(b)
}

/// Returns if `a` is greater than `b`, 0 or less counting as infinite.
pub(crate) fn bandwidth_is_greater(a: i32, b: i32) -> bool {
    if a <= 0 {
        true
    } else if b <= 0 {
        false
    } else {
        a >= b
    }
}

/// Bandwidth left for video after the audio allocation, keeping a 10 kbit/s
/// margin for RTCP and signaling.
pub(crate) fn remaining_video_bandwidth(total: i32, audio: i32) -> i32 {
    (total - audio - 10).max(0)
}

/// Bandwidth an audio codec will effectively use under a cap of `maxbw`.
fn audio_payload_type_bandwidth(payload: &PayloadType, maxbw: i32) -> i32 {
    if let Some(override_bitrate) = payload.bitrate_override {
        return override_bitrate / 1000;
    }

    match payload.bitrate {
        // Variable bitrate codecs follow the allocation
        None => maxbw,
        Some(bitrate) => min_bandwidth(maxbw, audio_bandwidth_from_codec_bitrate(bitrate)),
    }
}

/// IP level bandwidth of a fixed bitrate audio codec, headers included.
fn audio_bandwidth_from_codec_bitrate(bitrate: i32) -> i32 {
    let packet_size = (bitrate / 8) / DEFAULT_PACKETS_PER_SECOND + PACKET_OVERHEAD;
    packet_size * 8 * DEFAULT_PACKETS_PER_SECOND / 1000
}

/// Target upload bandwidth for an audio stream.
///
/// When video is part of the session the audio stream yields headroom to it
/// through a fixed step table, unless the application forced an explicit
/// upload bandwidth for the call.
pub(crate) fn ideal_audio_bandwidth(
    session: &SessionDescription,
    desc: &StreamDescription,
    config: &MediaConfig,
) -> i32 {
    let remote_bandwidth = declared_bandwidth(desc, session.bandwidth);

    let (upload_bandwidth, forced) = if config.forced_upload_bandwidth > 0 {
        (config.forced_upload_bandwidth, true)
    } else {
        (config.upload_bandwidth, false)
    };

    let upload_bandwidth = min_bandwidth(upload_bandwidth, remote_bandwidth);

    if !session.has_active_video() || forced {
        return upload_bandwidth;
    }

    if bandwidth_is_greater(upload_bandwidth, 512) {
        100
    } else if bandwidth_is_greater(upload_bandwidth, 256) {
        64
    } else if bandwidth_is_greater(upload_bandwidth, 128) {
        40
    } else {
        // Anything that gets here is a positive cap of 128 kbit/s or less
        24
    }
}

/// Bandwidth available to a video stream: what remains of the upload budget
/// after the audio allocation, capped by what the peer declared.
pub(crate) fn video_bandwidth(
    session: &SessionDescription,
    desc: &StreamDescription,
    audio_bandwidth: i32,
    config: &MediaConfig,
) -> i32 {
    let remote_bandwidth = match (desc.bandwidth, session.bandwidth) {
        (Some(bw), _) if bw > 0 => bw as i32,
        // b=AS given globally, not per stream
        (_, Some(bw)) if bw > 0 => remaining_video_bandwidth(bw as i32, audio_bandwidth),
        _ => 0,
    };

    min_bandwidth(
        remaining_video_bandwidth(config.upload_bandwidth, audio_bandwidth),
        remote_bandwidth,
    )
}

fn declared_bandwidth(desc: &StreamDescription, session_bandwidth: Option<u32>) -> i32 {
    match (desc.bandwidth, session_bandwidth) {
        (Some(bw), _) if bw > 0 => bw as i32,
        (_, Some(bw)) if bw > 0 => bw as i32,
        _ => 0,
    }
}
