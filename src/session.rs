//! Session state.
//!
//! One [`Session`] per attached client. The registry hands out
//! `Arc<Session>` clones; recipient relations hold further clones, which is
//! what keeps a session alive while someone still relays to it.
//!
//! Three locks with disjoint jobs:
//! - `media`: scalar media state (accept/send flags, bitrate, PLI pacing,
//!   continuity contexts),
//! - `recipients`: the fan-out list,
//! - `recorders`: the per-medium recording slots.
//!
//! None of them is ever held across a script call-in or a host callback
//! that can re-enter the bridge.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::host::HostHandle;
use crate::recording::RecorderSet;
use crate::rtp::RtpContext;

/// The three media kinds a session can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Medium {
    Audio,
    Video,
    Data,
}

impl Medium {
    /// Parse the wire keyword used across the script boundary.
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("audio") {
            Some(Self::Audio)
        } else if s.eq_ignore_ascii_case("video") {
            Some(Self::Video)
        } else if s.eq_ignore_ascii_case("data") {
            Some(Self::Data)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Data => "data",
        }
    }
}

/// Direction of a `configureMedium` call, relative to this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The session receives relayed media of this kind ("in").
    In,
    /// The session's own media of this kind is forwarded ("out").
    Out,
}

impl Direction {
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("in") {
            Some(Self::In)
        } else if s.eq_ignore_ascii_case("out") {
            Some(Self::Out)
        } else {
            None
        }
    }
}

/// Scalar media state, all guarded by one lock.
#[derive(Default)]
struct MediaState {
    accept_audio: bool,
    accept_video: bool,
    accept_data: bool,
    send_audio: bool,
    send_video: bool,
    send_data: bool,
    /// Bitrate cap enforced via REMB, 0 = unconstrained.
    bitrate: u32,
    /// Keyframe-request interval in seconds, 0 = disabled.
    pli_freq: u64,
    /// When the last keyframe request went out.
    pli_latest: Option<Instant>,
    /// Continuity contexts: [audio, video].
    rtp_ctx: [RtpContext; 2],
}

/// One attached client.
pub struct Session {
    id: u32,
    handle: HostHandle,
    started: AtomicBool,
    hanging_up: AtomicBool,
    destroyed: AtomicBool,
    media: Mutex<MediaState>,
    recipients: Mutex<Vec<std::sync::Arc<Session>>>,
    recorders: Mutex<RecorderSet>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("started", &self.started())
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(id: u32, handle: HostHandle) -> Self {
        Self {
            id,
            handle,
            started: AtomicBool::new(false),
            hanging_up: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            media: Mutex::new(MediaState::default()),
            recipients: Mutex::new(Vec::new()),
            recorders: Mutex::new(RecorderSet::default()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn handle(&self) -> &HostHandle {
        &self.handle
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::SeqCst);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Returns true the first time, false on repeats.
    pub(crate) fn mark_destroyed(&self) -> bool {
        !self.destroyed.swap(true, Ordering::SeqCst)
    }

    pub fn is_hanging_up(&self) -> bool {
        self.hanging_up.load(Ordering::SeqCst)
    }

    /// Latch the hangup; returns true the first time so the caller can make
    /// `hangup_media` idempotent.
    pub(crate) fn begin_hangup(&self) -> bool {
        !self.hanging_up.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn clear_hangup(&self) {
        self.hanging_up.store(false, Ordering::SeqCst);
    }

    fn lock_media(&self) -> MutexGuard<'_, MediaState> {
        self.media.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_recorders(&self) -> MutexGuard<'_, RecorderSet> {
        self.recorders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether relayed media of `medium` should be delivered to this session.
    pub fn accepts(&self, medium: Medium) -> bool {
        let media = self.lock_media();
        match medium {
            Medium::Audio => media.accept_audio,
            Medium::Video => media.accept_video,
            Medium::Data => media.accept_data,
        }
    }

    /// Whether this session's own media of `medium` may be forwarded.
    pub fn sends(&self, medium: Medium) -> bool {
        let media = self.lock_media();
        match medium {
            Medium::Audio => media.send_audio,
            Medium::Video => media.send_video,
            Medium::Data => media.send_data,
        }
    }

    pub(crate) fn configure_medium(&self, medium: Medium, direction: Direction, enabled: bool) {
        let mut media = self.lock_media();
        let flag = match (medium, direction) {
            (Medium::Audio, Direction::In) => &mut media.accept_audio,
            (Medium::Audio, Direction::Out) => &mut media.send_audio,
            (Medium::Video, Direction::In) => &mut media.accept_video,
            (Medium::Video, Direction::Out) => &mut media.send_video,
            (Medium::Data, Direction::In) => &mut media.accept_data,
            (Medium::Data, Direction::Out) => &mut media.send_data,
        };
        *flag = enabled;
    }

    pub fn bitrate(&self) -> u32 {
        self.lock_media().bitrate
    }

    pub(crate) fn set_bitrate(&self, bitrate: u32) {
        self.lock_media().bitrate = bitrate;
    }

    pub(crate) fn set_pli_freq(&self, seconds: u64) {
        self.lock_media().pli_freq = seconds;
    }

    /// Record that a keyframe request was just sent.
    pub(crate) fn mark_pli_sent(&self, now: Instant) {
        self.lock_media().pli_latest = Some(now);
    }

    /// Keyframe-request pacing: true (and updates the request time) when a
    /// nonzero interval is configured and it has elapsed.
    pub(crate) fn pli_due(&self, now: Instant) -> bool {
        let mut media = self.lock_media();
        if media.pli_freq == 0 {
            return false;
        }
        let interval = Duration::from_secs(media.pli_freq);
        match media.pli_latest {
            Some(latest) if now.duration_since(latest) < interval => false,
            _ => {
                media.pli_latest = Some(now);
                true
            }
        }
    }

    /// Rewrite the packet's seq/ts through this session's continuity context
    /// for the given medium.
    pub(crate) fn rewrite_for_continuity(&self, video: bool, buf: &mut [u8]) {
        let mut media = self.lock_media();
        let step = if video {
            crate::rtp::VIDEO_TS_STEP
        } else {
            crate::rtp::AUDIO_TS_STEP
        };
        media.rtp_ctx[usize::from(video)].update(buf, step);
    }

    /// Reset everything the script configured for the media path. Called at
    /// hangup: the next PeerConnection starts from a clean slate.
    pub(crate) fn reset_media(&self) {
        let mut media = self.lock_media();
        *media = MediaState::default();
    }

    /// Add `recipient` to the fan-out list. No duplicates; returns whether
    /// the relation was created.
    pub(crate) fn add_recipient(&self, recipient: &std::sync::Arc<Session>) -> bool {
        let mut recipients = self.recipients.lock().unwrap_or_else(PoisonError::into_inner);
        if recipients.iter().any(|r| r.id == recipient.id) {
            return false;
        }
        recipients.push(std::sync::Arc::clone(recipient));
        true
    }

    /// Remove the recipient with `id`. Removing an absent entry is a no-op;
    /// returns whether a relation was dropped.
    pub(crate) fn remove_recipient(&self, id: u32) -> bool {
        let mut recipients = self.recipients.lock().unwrap_or_else(PoisonError::into_inner);
        let before = recipients.len();
        recipients.retain(|r| r.id != id);
        recipients.len() != before
    }

    /// Consistent-at-a-point-in-time copy of the fan-out list. The lock is
    /// released before the caller relays anything, so relaying never blocks
    /// list mutation.
    pub(crate) fn snapshot_recipients(&self) -> Vec<std::sync::Arc<Session>> {
        self.recipients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop every recipient relation this session holds.
    pub(crate) fn clear_recipients(&self) {
        self.recipients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Append `buf` to the recorder for `medium`, if recording.
    pub(crate) fn record_frame(&self, medium: Medium, buf: &[u8]) {
        self.lock_recorders().save_frame(medium, buf);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Last reference gone: make sure recorder handles are closed.
        if let Ok(recorders) = self.recorders.get_mut() {
            recorders.close_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn session(id: u32) -> Arc<Session> {
        Arc::new(Session::new(id, Arc::new(()) as HostHandle))
    }

    #[test]
    fn medium_and_direction_parse_case_insensitive() {
        assert_eq!(Medium::parse("Audio"), Some(Medium::Audio));
        assert_eq!(Medium::parse("VIDEO"), Some(Medium::Video));
        assert_eq!(Medium::parse("data"), Some(Medium::Data));
        assert_eq!(Medium::parse("screen"), None);
        assert_eq!(Direction::parse("IN"), Some(Direction::In));
        assert_eq!(Direction::parse("out"), Some(Direction::Out));
        assert_eq!(Direction::parse("both"), None);
    }

    #[test]
    fn add_remove_recipient_round_trips_reference_count() {
        let a = session(1);
        let b = session(2);
        let baseline = Arc::strong_count(&b);
        assert!(a.add_recipient(&b));
        assert_eq!(Arc::strong_count(&b), baseline + 1);
        // Repeated adds do not duplicate the entry or the reference.
        assert!(!a.add_recipient(&b));
        assert_eq!(Arc::strong_count(&b), baseline + 1);
        assert!(a.remove_recipient(b.id()));
        assert_eq!(Arc::strong_count(&b), baseline);
        // Removing an absent entry is a no-op.
        assert!(!a.remove_recipient(b.id()));
        assert_eq!(Arc::strong_count(&b), baseline);
    }

    #[test]
    fn configure_medium_sets_independent_flags() {
        let s = session(1);
        assert!(!s.accepts(Medium::Audio));
        s.configure_medium(Medium::Audio, Direction::In, true);
        s.configure_medium(Medium::Video, Direction::Out, true);
        assert!(s.accepts(Medium::Audio));
        assert!(!s.sends(Medium::Audio));
        assert!(s.sends(Medium::Video));
        assert!(!s.accepts(Medium::Video));
    }

    #[test]
    fn reset_media_clears_flags_and_pacing() {
        let s = session(1);
        s.configure_medium(Medium::Data, Direction::Out, true);
        s.set_bitrate(128_000);
        s.set_pli_freq(2);
        s.reset_media();
        assert!(!s.sends(Medium::Data));
        assert_eq!(s.bitrate(), 0);
        assert!(!s.pli_due(Instant::now()));
    }

    #[test]
    fn pli_pacing_allows_one_request_per_interval() {
        let s = session(1);
        let now = Instant::now();
        s.set_pli_freq(10);
        // Nothing sent yet: first packet triggers a request.
        assert!(s.pli_due(now));
        // Inside the interval: paced out.
        assert!(!s.pli_due(now + Duration::from_secs(5)));
        // Interval elapsed.
        assert!(s.pli_due(now + Duration::from_secs(10)));
    }
}
