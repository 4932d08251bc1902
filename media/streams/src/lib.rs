//! # Offer/answer driven media stream orchestration
//!
//! This crate manages the set of media transport streams (audio, video,
//! real-time text) of a call: given the local, remote and negotiated session
//! descriptions of an SDP offer/answer round, it instantiates, configures,
//! starts, monitors and tears down one stream per media line, optionally
//! secured via DTLS-SRTP or ZRTP and traversed via ICE.
//!
//! [`StreamsGroup`] is the top level type. It is sans-io and single
//! threaded: the embedding call processing loop drives it with
//! [`poll`](StreamsGroup::poll) / [`timeout`](StreamsGroup::timeout) and
//! consumes notifications from [`pop_event`](StreamsGroup::pop_event).
//! The actual media handling is a black box behind the traits in [`engine`],
//! ICE connectivity behind the one in [`ice`].
//!
//! ```no_run
//! # use rtc_streams::{config::MediaConfig, context::OfferAnswerContext};
//! # use rtc_streams::{StreamsGroup, NoOtherCalls, TargetState, ice::NoIce};
//! # use std::time::Instant;
//! # fn example(engine: Box<dyn rtc_streams::engine::MediaEngine>,
//! #            local: rtc_streams::description::SessionDescription,
//! #            remote: rtc_streams::description::SessionDescription,
//! #            result: rtc_streams::description::SessionDescription) {
//! let mut group = StreamsGroup::new(MediaConfig::default(), engine, Box::new(NoIce));
//!
//! let ctx = OfferAnswerContext::new(Some(&local), Some(&remote), Some(&result), true);
//! group.create_streams(&ctx, &NoOtherCalls);
//! group.prepare(Instant::now());
//! group.render(&ctx, TargetState::Running, Instant::now(), &NoOtherCalls);
//!
//! loop {
//!     // sleep until group.timeout(now) elapses, then:
//!     group.poll(Instant::now());
//!     while let Some(_event) = group.pop_event() {
//!         // forward to the signaling layer
//!     }
//! #   break;
//! }
//! # }
//! ```

pub mod config;
pub mod context;
pub mod description;
pub mod engine;
pub mod event;
pub mod group;
pub mod ice;
mod profile;
mod stream;

pub use group::StreamsGroup;
pub use profile::RtpProfile;
pub use stream::{NoOtherCalls, PortUsage, Stream, StreamState, TargetState};
