//! # Negotiated session & stream descriptions
//!
//! The signaling layer runs the SDP offer/answer exchange and hands the
//! resulting descriptions to this crate. A [`SessionDescription`] is one side
//! of an exchange (local, remote or the negotiated result), holding one
//! [`StreamDescription`] per media line.
//!
//! Between two negotiation rounds the same stream index can change in ways
//! that require different amounts of work, from re-applying codec parameters
//! up to recreating the transport. [`StreamDescription::changes_from`]
//! computes which fields differ so callers can skip redundant work.

use sdp_types::{Direction, Fingerprint, Setup, SrtpCrypto};
use std::borrow::Cow;
use std::fmt;
use std::net::IpAddr;

/// Kind of a media transport stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Audio,
    Video,
    /// Real-time text (RFC 4103)
    Text,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Audio => "audio",
            StreamKind::Video => "video",
            StreamKind::Text => "text",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a stream in a multicast session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MulticastRole {
    #[default]
    None,
    Sender,
    Receiver,
}

impl MulticastRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MulticastRole::None => "none",
            MulticastRole::Sender => "sender",
            MulticastRole::Receiver => "receiver",
        }
    }
}

impl fmt::Display for MulticastRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One codec of a stream's negotiated payload list.
///
/// The list is ordered by preference, the first entry that is enabled for
/// sending is the codec the stream will encode with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadType {
    /// RTP payload type number
    pub number: u8,
    /// Encoding name as it appears in `a=rtpmap`
    pub encoding: Cow<'static, str>,
    pub clock_rate: u32,
    /// Number of channels, usually only set for audio
    pub channels: Option<u32>,
    /// Nominal codec bitrate in bit/s. `None` for variable bitrate codecs,
    /// which follow whatever bandwidth is allocated to the stream.
    pub bitrate: Option<i32>,
    /// Explicit bitrate override in bit/s. Takes precedence over the
    /// bandwidth allocated from the session budget.
    pub bitrate_override: Option<i32>,
    /// Negotiated to be used for sending
    pub send_enabled: bool,
    /// `a=fmtp` parameters advertised by the peer, used to configure the encoder
    pub recv_fmtp: Option<String>,
    /// `a=fmtp` parameters for the outbound direction
    pub send_fmtp: Option<String>,
}

impl PayloadType {
    pub fn new(number: u8, encoding: impl Into<Cow<'static, str>>, clock_rate: u32) -> Self {
        PayloadType {
            number,
            encoding: encoding.into(),
            clock_rate,
            channels: None,
            bitrate: None,
            bitrate_override: None,
            send_enabled: true,
            recv_fmtp: None,
            send_fmtp: None,
        }
    }

    pub fn is_telephone_event(&self) -> bool {
        self.encoding.eq_ignore_ascii_case("telephone-event")
    }
}

/// RTCP feedback (AVPF) features negotiated for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RtcpFeedbackSetup {
    pub generic_nack: bool,
    pub tmmbr: bool,
}

/// Receiver reference time report mode of RTCP extended reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RcvrRttMode {
    #[default]
    None,
    All,
    Sender,
}

/// RTCP extended reports (RFC 3611) configuration of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RtcpXrSetup {
    pub enabled: bool,
    pub rcvr_rtt_mode: RcvrRttMode,
    pub rcvr_rtt_max_size: u32,
    pub stat_summary: bool,
    pub voip_metrics: bool,
}

/// DTLS-SRTP parameters of a negotiated stream description.
#[derive(Debug, Clone)]
pub struct DtlsParameters {
    /// Certificate fingerprint of the peer
    pub fingerprint: Fingerprint,
    /// Negotiated local setup role (`a=setup`)
    pub setup: Setup,
}

/// One media stream of a [`SessionDescription`].
#[derive(Debug, Clone)]
pub struct StreamDescription {
    pub kind: StreamKind,
    pub dir: Direction,
    /// Address media is sent to. Falls back to the session level address.
    pub rtp_addr: Option<IpAddr>,
    /// 0 when the stream is disabled
    pub rtp_port: u16,
    pub rtcp_port: u16,
    /// TTL for multicast sessions
    pub ttl: Option<u8>,
    pub multicast_role: MulticastRole,
    /// `b=AS` bandwidth of this stream in kbit/s
    pub bandwidth: Option<u32>,
    /// Negotiated codec list, ordered by preference
    pub payloads: Vec<PayloadType>,
    /// `a=ptime` in milliseconds
    pub ptime: Option<u32>,
    /// `a=maxptime` in milliseconds
    pub maxptime: Option<u32>,
    pub rtcp_mux: bool,
    pub rtcp_fb: RtcpFeedbackSetup,
    pub rtcp_xr: RtcpXrSetup,
    /// SDES-SRTP crypto attributes of this description
    pub crypto: Vec<SrtpCrypto>,
    /// On a negotiated result: tag of the chosen crypto attribute of the
    /// local description
    pub crypto_local_tag: Option<u32>,
    /// On a negotiated result: DTLS-SRTP parameters when DTLS was negotiated
    pub dtls: Option<DtlsParameters>,
}

impl StreamDescription {
    pub fn new(kind: StreamKind) -> Self {
        StreamDescription {
            kind,
            dir: Direction::SendRecv,
            rtp_addr: None,
            rtp_port: 0,
            rtcp_port: 0,
            ttl: None,
            multicast_role: MulticastRole::None,
            bandwidth: None,
            payloads: Vec::new(),
            ptime: None,
            maxptime: None,
            rtcp_mux: false,
            rtcp_fb: RtcpFeedbackSetup::default(),
            rtcp_xr: RtcpXrSetup::default(),
            crypto: Vec::new(),
            crypto_local_tag: None,
            dtls: None,
        }
    }

    /// Returns if the stream carries media at all
    pub fn is_active(&self) -> bool {
        self.rtp_port != 0 && self.dir != Direction::Inactive
    }

    /// Returns if SRTP keys were exchanged over the signaling path
    pub fn has_srtp(&self) -> bool {
        !self.crypto.is_empty()
    }

    /// Returns if the stream uses a multicast destination
    pub fn is_multicast(&self) -> bool {
        self.rtp_addr.is_some_and(|addr| addr.is_multicast())
            || self.multicast_role != MulticastRole::None
    }

    /// Compute which fields differ from `previous`
    pub fn changes_from(&self, previous: &StreamDescription) -> StreamChanges {
        StreamChanges {
            cast: self.is_multicast() != previous.is_multicast(),
            address: self.rtp_addr != previous.rtp_addr,
            ports: self.rtp_port != previous.rtp_port || self.rtcp_port != previous.rtcp_port,
            codecs: self.payloads != previous.payloads,
            direction: self.dir != previous.dir,
            crypto_keys: !same_crypto(&self.crypto, &previous.crypto),
        }
    }
}

fn same_crypto(a: &[SrtpCrypto], b: &[SrtpCrypto]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.tag == y.tag
                && x.suite == y.suite
                && x.keys.len() == y.keys.len()
                && x.keys
                    .iter()
                    .zip(&y.keys)
                    .all(|(k, l)| k.key_and_salt == l.key_and_salt)
        })
}

/// One side of an offer/answer exchange.
#[derive(Debug, Clone, Default)]
pub struct SessionDescription {
    /// Session level connection address (`c=`), used when a stream has none
    pub addr: Option<IpAddr>,
    /// Session level `b=AS` bandwidth in kbit/s
    pub bandwidth: Option<u32>,
    pub streams: Vec<StreamDescription>,
}

impl SessionDescription {
    pub fn new() -> Self {
        SessionDescription::default()
    }

    /// Returns if the session contains an active video stream with codecs
    pub fn has_active_video(&self) -> bool {
        self.streams.iter().any(|stream| {
            stream.kind == StreamKind::Video && stream.is_active() && !stream.payloads.is_empty()
        })
    }
}

/// Fields of a stream description that changed between two negotiation rounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamChanges {
    /// The destination toggled between unicast and multicast
    pub cast: bool,
    pub address: bool,
    pub ports: bool,
    pub codecs: bool,
    pub direction: bool,
    pub crypto_keys: bool,
}

impl StreamChanges {
    pub fn any(&self) -> bool {
        let StreamChanges {
            cast,
            address,
            ports,
            codecs,
            direction,
            crypto_keys,
        } = *self;

        cast || address || ports || codecs || direction || crypto_keys
    }
}

impl fmt::Display for StreamChanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;

        for (set, name) in [
            (self.cast, "cast"),
            (self.address, "address"),
            (self.ports, "ports"),
            (self.codecs, "codecs"),
            (self.direction, "direction"),
            (self.crypto_keys, "crypto-keys"),
        ] {
            if !set {
                continue;
            }

            if !first {
                f.write_str(" ")?;
            }

            f.write_str(name)?;
            first = false;
        }

        if first {
            f.write_str("none")?;
        }

        Ok(())
    }
}
