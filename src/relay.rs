//! Media/data fan-out to recipient sessions.
//!
//! The hot path: no script engine involvement, only session-level flags the
//! script configured earlier. The recipient list is snapshotted under its
//! lock and the lock released before anything is sent, so relaying can never
//! block an `addRecipient`/`removeRecipient` running elsewhere. A recipient
//! added mid-packet may or may not see that packet — best-effort, not
//! transactional.

use crate::host::Host;
use crate::rtp;
use crate::session::{Medium, Session};

/// Relay one RTP packet from `source` to every current recipient, rewriting
/// sequence numbers and timestamps through each recipient's continuity
/// context. The source's own view of the packet is left untouched.
pub(crate) fn fan_out_rtp(host: &dyn Host, source: &Session, video: bool, buf: &[u8]) {
    if !rtp::looks_like_rtp(buf) {
        log::warn!("Invalid packet, not relaying");
        return;
    }
    let medium = if video { Medium::Video } else { Medium::Audio };
    // Work on a copy: the rewrite below is per recipient and the original
    // seq/ts must be restored after every send.
    let mut packet = buf.to_vec();
    let orig_seq = rtp::seq_number(&packet);
    let orig_ts = rtp::timestamp(&packet);
    for recipient in source.snapshot_recipients() {
        if !recipient.started() || !recipient.accepts(medium) {
            continue;
        }
        recipient.rewrite_for_continuity(video, &mut packet);
        host.relay_rtp(recipient.handle(), video, &packet);
        rtp::set_seq_number(&mut packet, orig_seq);
        rtp::set_timestamp(&mut packet, orig_ts);
    }
}

/// Relay one data-channel message from `source` to every current recipient
/// that accepts data. Failures are silent: dropping beats blocking.
pub(crate) fn fan_out_data(host: &dyn Host, source: &Session, buf: &[u8]) {
    for recipient in source.snapshot_recipients() {
        if !recipient.started() || !recipient.accepts(Medium::Data) {
            continue;
        }
        log::trace!(
            "Forwarding data message ({} bytes) to session {}",
            buf.len(),
            recipient.id()
        );
        host.relay_data(recipient.handle(), buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostHandle, Recorder};
    use anyhow::{anyhow, Result};
    use serde_json::Value;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct CaptureHost {
        rtp: Mutex<Vec<(bool, Vec<u8>)>>,
        data: Mutex<Vec<Vec<u8>>>,
    }

    impl Host for CaptureHost {
        fn push_event(
            &self,
            _: &HostHandle,
            _: Option<&str>,
            _: &Value,
            _: Option<&Value>,
        ) -> Result<()> {
            Ok(())
        }
        fn notify_event(&self, _: Option<&HostHandle>, _: &Value) {}
        fn close_pc(&self, _: &HostHandle) {}
        fn relay_rtp(&self, _: &HostHandle, video: bool, buf: &[u8]) {
            self.rtp.lock().unwrap().push((video, buf.to_vec()));
        }
        fn relay_rtcp(&self, _: &HostHandle, _: bool, _: &[u8]) {}
        fn relay_data(&self, _: &HostHandle, buf: &[u8]) {
            self.data.lock().unwrap().push(buf.to_vec());
        }
        fn create_recorder(&self, _: &str, _: &str, _: &str) -> Result<Box<dyn Recorder>> {
            Err(anyhow!("unused"))
        }
    }

    fn session(id: u32) -> Arc<Session> {
        Arc::new(Session::new(id, Arc::new(()) as HostHandle))
    }

    fn receiving_session(id: u32, medium: Medium) -> Arc<Session> {
        let s = session(id);
        s.set_started(true);
        s.configure_medium(medium, crate::session::Direction::In, true);
        s
    }

    fn rtp_packet(ssrc: u32, seq: u16, ts: u32) -> Vec<u8> {
        let mut buf = vec![0u8; rtp::HEADER_LEN + 8];
        buf[0] = 0x80;
        rtp::set_seq_number(&mut buf, seq);
        rtp::set_timestamp(&mut buf, ts);
        buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
        buf
    }

    #[test]
    fn source_switch_stays_monotonic_at_the_recipient() {
        let host = CaptureHost::default();
        let a = session(1);
        let c = session(3);
        let b = receiving_session(2, Medium::Video);
        a.add_recipient(&b);

        // A feeds B with ascending timestamps.
        for (seq, ts) in [(100u16, 1000u32), (101, 5500), (102, 10_000)] {
            fan_out_rtp(&host, &a, true, &rtp_packet(0xaaaa, seq, ts));
        }
        // Switch B's source to C, whose stream restarts low.
        a.remove_recipient(b.id());
        c.add_recipient(&b);
        fan_out_rtp(&host, &c, true, &rtp_packet(0xcccc, 7, 500));
        fan_out_rtp(&host, &c, true, &rtp_packet(0xcccc, 8, 5000));

        let sent = host.rtp.lock().unwrap();
        assert_eq!(sent.len(), 5);
        let mut last_seq = 0u16;
        let mut last_ts = 0u32;
        for (i, (video, packet)) in sent.iter().enumerate() {
            assert!(*video);
            let seq = rtp::seq_number(packet);
            let ts = rtp::timestamp(packet);
            if i > 0 {
                assert!(seq > last_seq, "seq regressed at packet {i}");
                assert!(ts >= last_ts, "ts regressed at packet {i}");
            }
            last_seq = seq;
            last_ts = ts;
        }
    }

    #[test]
    fn source_packet_keeps_its_original_header() {
        let host = CaptureHost::default();
        let a = session(1);
        let b = receiving_session(2, Medium::Video);
        let b2 = receiving_session(3, Medium::Video);
        a.add_recipient(&b);
        a.add_recipient(&b2);
        // Force an offset in b's context so the rewrite is visible.
        fan_out_rtp(&host, &a, true, &rtp_packet(0x1, 100, 9000));
        let packet = rtp_packet(0x2, 5, 100);
        fan_out_rtp(&host, &a, true, &packet);
        // The caller's buffer was never modified.
        assert_eq!(rtp::seq_number(&packet), 5);
        assert_eq!(rtp::timestamp(&packet), 100);
        // And every recipient got its own consistent rewrite.
        let sent = host.rtp.lock().unwrap();
        assert_eq!(sent.len(), 4);
    }

    #[test]
    fn recipients_filter_on_accept_flag_and_started() {
        let host = CaptureHost::default();
        let a = session(1);
        let audio_only = receiving_session(2, Medium::Audio);
        let not_started = session(3);
        not_started.configure_medium(Medium::Video, crate::session::Direction::In, true);
        a.add_recipient(&audio_only);
        a.add_recipient(&not_started);
        fan_out_rtp(&host, &a, true, &rtp_packet(0x1, 1, 1));
        assert!(host.rtp.lock().unwrap().is_empty());
        fan_out_rtp(&host, &a, false, &rtp_packet(0x1, 2, 961));
        assert_eq!(host.rtp.lock().unwrap().len(), 1);
    }

    #[test]
    fn data_fan_out_respects_accept_data() {
        let host = CaptureHost::default();
        let a = session(1);
        let b = receiving_session(2, Medium::Data);
        let c = receiving_session(3, Medium::Audio);
        a.add_recipient(&b);
        a.add_recipient(&c);
        fan_out_data(&host, &a, b"hello");
        let sent = host.data.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], b"hello");
    }

    #[test]
    fn malformed_rtp_is_dropped() {
        let host = CaptureHost::default();
        let a = session(1);
        let b = receiving_session(2, Medium::Video);
        a.add_recipient(&b);
        fan_out_rtp(&host, &a, true, &[0x80, 0x00, 0x01]);
        assert!(host.rtp.lock().unwrap().is_empty());
    }
}
