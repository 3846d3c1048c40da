use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds between the NTP epoch (1 Jan 1900) and the Unix epoch (1 Jan 1970).
const NTP_UNIX_OFFSET_SECS: u64 = 0x83AA_7E80;

/// A 64-bit NTP timestamp: `(seconds_since_1900 << 32) | fraction`.
pub type NtpTime = u64;

/// Converts a `SystemTime` into the 64-bit NTP fixed-point timestamp used by
/// RTCP SR packets.
///
/// `frac = micros * 2^32 / 1_000_000`, matching RFC 3550 §4.
pub fn system_time_to_ntp(t: SystemTime) -> NtpTime {
    let dur = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    unix_duration_to_ntp(dur)
}

pub fn unix_duration_to_ntp(dur: Duration) -> NtpTime {
    let secs = dur.as_secs() + NTP_UNIX_OFFSET_SECS;
    let frac = ((dur.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (secs << 32) | (frac & 0xFFFF_FFFF)
}

pub fn ntp_to_unix_duration(ntp: NtpTime) -> Duration {
    let secs = (ntp >> 32).saturating_sub(NTP_UNIX_OFFSET_SECS);
    let frac = ntp & 0xFFFF_FFFF;
    let nanos = (frac * 1_000_000_000) >> 32;
    Duration::new(secs, nanos as u32)
}

/// The middle 32 bits of an NTP timestamp, as embedded in SR sender-info and
/// echoed back as `lsr` in RR report blocks.
pub fn ntp_to_compact(ntp: NtpTime) -> u32 {
    ((ntp >> 16) & 0xFFFF_FFFF) as u32
}

/// A host-supplied monotonic millisecond clock. The core never reads the
/// system clock directly outside of NTP timestamping; everything else
/// (RTO, jitter, RTCP scheduling) is driven off of this.
pub trait Clock: std::fmt::Debug {
    fn now_ms(&self) -> u64;

    fn now_ntp(&self) -> NtpTime {
        system_time_to_ntp(SystemTime::now())
    }
}

/// Default `Clock` backed by `SystemTime`. Hosts embedding the core in a
/// simulation or test harness provide their own `Clock` implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ntp_round_trip_is_close() {
        let now = SystemTime::now();
        let ntp = system_time_to_ntp(now);
        let back = UNIX_EPOCH + ntp_to_unix_duration(ntp);
        let delta = now
            .duration_since(back)
            .or_else(|_| back.duration_since(now))
            .unwrap();
        assert!(delta < Duration::from_millis(1));
    }

    #[test]
    fn compact_ntp_is_middle_32_bits() {
        let ntp: NtpTime = 0x1122_3344_5566_7788;
        assert_eq!(ntp_to_compact(ntp), 0x3344_5566);
    }
}
