//! The few RTCP feedback packets the bridge crafts itself.
//!
//! Keyframe requests (PLI) and receiver bandwidth caps (REMB) are the only
//! RTCP the bridge originates; everything else is either delegated to the
//! script or passed through untouched.

/// Payload-specific feedback packet type.
const PT_PSFB: u8 = 206;
/// PSFB format: Picture Loss Indication.
const FMT_PLI: u8 = 1;
/// PSFB format: application layer feedback (REMB lives here).
const FMT_ALFB: u8 = 15;

/// Build a Picture Loss Indication (keyframe request).
///
/// Sender/media SSRCs are left zeroed; the host rewrites them for the actual
/// transport.
pub fn pli() -> [u8; 12] {
    let mut buf = [0u8; 12];
    buf[0] = 0x80 | FMT_PLI;
    buf[1] = PT_PSFB;
    buf[2..4].copy_from_slice(&2u16.to_be_bytes()); // length in words minus one
    buf
}

/// Build a Receiver Estimated Maximum Bitrate packet capping at `bitrate`
/// bits per second.
pub fn remb(bitrate: u32) -> [u8; 24] {
    let mut buf = [0u8; 24];
    buf[0] = 0x80 | FMT_ALFB;
    buf[1] = PT_PSFB;
    buf[2..4].copy_from_slice(&5u16.to_be_bytes());
    buf[12..16].copy_from_slice(b"REMB");
    buf[16] = 1; // one SSRC entry follows
    // 6-bit exponent + 18-bit mantissa
    let mut exp = 0u8;
    let mut mantissa = bitrate;
    while mantissa >= (1 << 18) {
        mantissa >>= 1;
        exp += 1;
    }
    buf[17] = (exp << 2) | ((mantissa >> 16) as u8 & 0x03);
    buf[18] = (mantissa >> 8) as u8;
    buf[19] = mantissa as u8;
    // The single SSRC entry stays zeroed, same as in pli().
    buf
}

/// Scan a (possibly compound) RTCP packet for a REMB block and return the
/// advertised bitrate, or 0 when none is present.
pub fn get_remb(buf: &[u8]) -> u32 {
    let mut offset = 0usize;
    while offset + 4 <= buf.len() {
        let words = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        let record_len = (words + 1) * 4;
        if record_len == 0 || offset + record_len > buf.len() {
            return 0;
        }
        let pt = buf[offset + 1];
        let fmt = buf[offset] & 0x1f;
        if pt == PT_PSFB && fmt == FMT_ALFB && record_len >= 20 && &buf[offset + 12..offset + 16] == b"REMB" {
            let exp = buf[offset + 17] >> 2;
            let mantissa = ((u32::from(buf[offset + 17]) & 0x03) << 16)
                | (u32::from(buf[offset + 18]) << 8)
                | u32::from(buf[offset + 19]);
            return mantissa << exp;
        }
        offset += record_len;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pli_is_a_psfb_fmt1() {
        let buf = pli();
        assert_eq!(buf[0] >> 6, 2);
        assert_eq!(buf[0] & 0x1f, FMT_PLI);
        assert_eq!(buf[1], PT_PSFB);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 2);
    }

    #[test]
    fn remb_round_trips_through_get_remb() {
        for bitrate in [64_000u32, 128_000, 1_500_000, 20_000_000] {
            let buf = remb(bitrate);
            let decoded = get_remb(&buf);
            // Mantissa truncation loses at most the shifted-out low bits.
            assert!(decoded <= bitrate);
            assert!(decoded > bitrate - (bitrate >> 10) - 1, "{bitrate} -> {decoded}");
        }
    }

    #[test]
    fn get_remb_skips_leading_records() {
        // Receiver report (pt 201, one word of payload) followed by a REMB.
        let mut compound = vec![0x80, 201, 0, 1, 0, 0, 0, 0];
        compound.extend_from_slice(&remb(256_000));
        assert_eq!(get_remb(&compound), 256_000);
    }

    #[test]
    fn get_remb_on_unrelated_rtcp_is_zero() {
        let sr = [0x80u8, 200, 0, 1, 0, 0, 0, 0];
        assert_eq!(get_remb(&sr), 0);
        assert_eq!(get_remb(&pli()), 0);
        assert_eq!(get_remb(&[]), 0);
    }
}
