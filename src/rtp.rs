//! Minimal RTP header access and send-timing continuity rewriting.
//!
//! The bridge does not parse RTP payloads; it only needs the sequence
//! number, timestamp and SSRC from the fixed 12-byte header to keep a
//! recipient's outbound stream continuous when the session feeding it is
//! switched.

/// Fixed RTP header length (no CSRCs, no extensions considered).
pub const HEADER_LEN: usize = 12;

/// Timestamp step assumed between the last packet of the old source and the
/// first packet of the new one, for 90kHz video.
pub(crate) const VIDEO_TS_STEP: u32 = 4500;
/// Same, for 48kHz/20ms audio.
pub(crate) const AUDIO_TS_STEP: u32 = 960;

/// True if `buf` is long enough to carry an RTP header with version 2.
pub fn looks_like_rtp(buf: &[u8]) -> bool {
    buf.len() >= HEADER_LEN && buf[0] >> 6 == 2
}

pub fn seq_number(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[2], buf[3]])
}

pub fn timestamp(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]])
}

pub fn ssrc(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]])
}

pub fn set_seq_number(buf: &mut [u8], seq: u16) {
    buf[2..4].copy_from_slice(&seq.to_be_bytes());
}

pub fn set_timestamp(buf: &mut [u8], ts: u32) {
    buf[4..8].copy_from_slice(&ts.to_be_bytes());
}

/// Per-recipient, per-medium continuity context.
///
/// Tracks running sequence/timestamp offsets so that when the packet source
/// feeding a recipient changes (a new SSRC shows up), the rewritten stream
/// continues from where the previous one left off instead of jumping.
#[derive(Debug, Default, Clone)]
pub struct RtpContext {
    active: bool,
    last_ssrc: u32,
    seq_offset: u16,
    ts_offset: u32,
    last_seq: u16,
    last_ts: u32,
}

impl RtpContext {
    /// Forget everything; the next packet starts a fresh stream.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Rewrite the sequence number and timestamp of the packet in `buf` in
    /// place. `ts_step` is the timestamp gap assumed across a source switch.
    ///
    /// The caller is responsible for restoring the original values after the
    /// packet has been sent, since `buf` is shared across recipients.
    pub fn update(&mut self, buf: &mut [u8], ts_step: u32) {
        let ssrc = ssrc(buf);
        let seq = seq_number(buf);
        let ts = timestamp(buf);
        if !self.active {
            self.active = true;
            self.last_ssrc = ssrc;
            self.seq_offset = 0;
            self.ts_offset = 0;
        } else if ssrc != self.last_ssrc {
            // Source switched: continue right after the last values we emitted.
            self.last_ssrc = ssrc;
            self.seq_offset = self.last_seq.wrapping_add(1).wrapping_sub(seq);
            self.ts_offset = self.last_ts.wrapping_add(ts_step).wrapping_sub(ts);
        }
        let out_seq = seq.wrapping_add(self.seq_offset);
        let out_ts = ts.wrapping_add(self.ts_offset);
        set_seq_number(buf, out_seq);
        set_timestamp(buf, out_ts);
        self.last_seq = out_seq;
        self.last_ts = out_ts;
    }
}
