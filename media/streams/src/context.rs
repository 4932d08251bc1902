//! # Offer/answer context
//!
//! An [`OfferAnswerContext`] bundles the three session descriptions of one
//! offer/answer round: the local description, the remote description and the
//! negotiated result. Local-only rounds (building an offer) and remote-only
//! rounds are legal, the missing sides are simply absent.
//!
//! The context is scoped to a single stream index with
//! [`scope_to_index`](OfferAnswerContext::scope_to_index), which yields a
//! [`StreamContext`] whose per-stream sub-descriptions are consistent with the
//! index by construction.

use crate::description::{SessionDescription, StreamChanges, StreamDescription};

/// The descriptions of one offer/answer round, owned by the signaling layer.
#[derive(Debug, Clone, Copy)]
pub struct OfferAnswerContext<'a> {
    local: Option<&'a SessionDescription>,
    remote: Option<&'a SessionDescription>,
    result: Option<&'a SessionDescription>,
    local_is_offerer: bool,
}

impl<'a> OfferAnswerContext<'a> {
    pub fn new(
        local: Option<&'a SessionDescription>,
        remote: Option<&'a SessionDescription>,
        result: Option<&'a SessionDescription>,
        local_is_offerer: bool,
    ) -> Self {
        OfferAnswerContext {
            local,
            remote,
            result,
            local_is_offerer,
        }
    }

    pub fn local(&self) -> Option<&'a SessionDescription> {
        self.local
    }

    pub fn remote(&self) -> Option<&'a SessionDescription> {
        self.remote
    }

    pub fn result(&self) -> Option<&'a SessionDescription> {
        self.result
    }

    pub fn local_is_offerer(&self) -> bool {
        self.local_is_offerer
    }

    /// Number of streams in the local description, 0 when there is none
    pub fn local_stream_count(&self) -> usize {
        self.local.map(|desc| desc.streams.len()).unwrap_or(0)
    }

    /// Scope the context to the stream at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range of any present description. Indices
    /// must come from iterating the descriptions' own stream lists.
    pub fn scope_to_index(&self, index: usize) -> StreamContext<'a> {
        StreamContext {
            index,
            local_session: self.local,
            remote_session: self.remote,
            result_session: self.result,
            local: self.local.map(|desc| &desc.streams[index]),
            remote: self.remote.map(|desc| &desc.streams[index]),
            result: self.result.map(|desc| &desc.streams[index]),
            local_is_offerer: self.local_is_offerer,
        }
    }

    /// Scope the context to the stream at `index` and compute which fields
    /// changed versus the same index of a previously retained round.
    pub fn scope_to_index_with_diff(
        &self,
        index: usize,
        previous: &OfferAnswerState,
    ) -> (StreamContext<'a>, ContextDiff) {
        let scoped = self.scope_to_index(index);

        let diff = ContextDiff {
            local: diff_side(scoped.local, previous.local.as_ref(), index),
            result: diff_side(scoped.result, previous.result.as_ref(), index),
        };

        (scoped, diff)
    }

    /// Create an owned snapshot of this round, to diff against in the next one
    pub fn to_owned(&self) -> OfferAnswerState {
        OfferAnswerState {
            local: self.local.cloned(),
            remote: self.remote.cloned(),
            result: self.result.cloned(),
            local_is_offerer: self.local_is_offerer,
        }
    }
}

fn diff_side(
    current: Option<&StreamDescription>,
    previous: Option<&SessionDescription>,
    index: usize,
) -> StreamChanges {
    let previous = previous.and_then(|desc| desc.streams.get(index));

    match (current, previous) {
        (Some(current), Some(previous)) => current.changes_from(previous),
        // Nothing to compare against, nothing is reported as changed
        _ => StreamChanges::default(),
    }
}

/// View of an [`OfferAnswerContext`] scoped to a single stream index.
#[derive(Debug, Clone, Copy)]
pub struct StreamContext<'a> {
    pub index: usize,
    pub local_session: Option<&'a SessionDescription>,
    pub remote_session: Option<&'a SessionDescription>,
    pub result_session: Option<&'a SessionDescription>,
    pub local: Option<&'a StreamDescription>,
    pub remote: Option<&'a StreamDescription>,
    pub result: Option<&'a StreamDescription>,
    pub local_is_offerer: bool,
}

/// Changes of one stream versus the previously rendered round, for the local
/// and the negotiated result description.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextDiff {
    pub local: StreamChanges,
    pub result: StreamChanges,
}

impl ContextDiff {
    /// The destination toggled between unicast and multicast on either side
    pub fn cast_changed(&self) -> bool {
        self.local.cast || self.result.cast
    }
}

/// Owned snapshot of an offer/answer round.
///
/// Retained between renders to detect what changed in the next round.
#[derive(Debug, Default)]
pub struct OfferAnswerState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    result: Option<SessionDescription>,
    local_is_offerer: bool,
}

impl OfferAnswerState {
    pub fn clear(&mut self) {
        *self = OfferAnswerState::default();
    }

    /// Scope the retained state to the stream at `index`.
    ///
    /// # Panics
    ///
    /// Panics like [`OfferAnswerContext::scope_to_index`] when `index` is out
    /// of range of a present description.
    pub fn scope_to_index(&self, index: usize) -> StreamContext<'_> {
        StreamContext {
            index,
            local_session: self.local.as_ref(),
            remote_session: self.remote.as_ref(),
            result_session: self.result.as_ref(),
            local: self.local.as_ref().map(|desc| &desc.streams[index]),
            remote: self.remote.as_ref().map(|desc| &desc.streams[index]),
            result: self.result.as_ref().map(|desc| &desc.streams[index]),
            local_is_offerer: self.local_is_offerer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::{PayloadType, StreamKind};

    fn two_stream_session() -> SessionDescription {
        let mut session = SessionDescription::new();

        let mut audio = StreamDescription::new(StreamKind::Audio);
        audio.rtp_port = 7078;
        audio.payloads = vec![PayloadType::new(0, "PCMU", 8000)];

        let mut video = StreamDescription::new(StreamKind::Video);
        video.rtp_port = 9078;
        video.payloads = vec![PayloadType::new(96, "VP8", 90000)];

        session.streams = vec![audio, video];
        session
    }

    #[test]
    fn scoped_descriptions_follow_the_index() {
        let local = two_stream_session();
        let result = two_stream_session();

        let ctx = OfferAnswerContext::new(Some(&local), None, Some(&result), true);

        let scoped = ctx.scope_to_index(1);
        assert_eq!(scoped.index, 1);
        assert_eq!(scoped.local.unwrap().kind, StreamKind::Video);
        assert_eq!(scoped.result.unwrap().kind, StreamKind::Video);
        assert!(scoped.remote.is_none());
    }

    #[test]
    fn diff_against_previous_round() {
        let local = two_stream_session();
        let result = two_stream_session();
        let previous = OfferAnswerContext::new(Some(&local), None, Some(&result), true).to_owned();

        let mut changed_result = two_stream_session();
        changed_result.streams[0].rtp_addr = Some("239.0.0.1".parse().unwrap());

        let ctx = OfferAnswerContext::new(Some(&local), None, Some(&changed_result), true);

        let (_, diff) = ctx.scope_to_index_with_diff(0, &previous);
        assert!(diff.result.cast);
        assert!(!diff.local.cast);
        assert!(diff.cast_changed());

        let (_, diff) = ctx.scope_to_index_with_diff(1, &previous);
        assert!(!diff.cast_changed());
    }

    #[test]
    fn diff_without_previous_round_reports_nothing() {
        let local = two_stream_session();
        let ctx = OfferAnswerContext::new(Some(&local), None, None, true);

        let (_, diff) = ctx.scope_to_index_with_diff(0, &OfferAnswerState::default());
        assert!(!diff.local.any());
        assert!(!diff.result.any());
    }
}
