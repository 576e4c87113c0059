//! Codec for the `supervise/status` record written by `runsv`.
//!
//! Layout, all numeric fields big-endian:
//!
//! | offset | width | field        |
//! |--------|-------|--------------|
//! | 0      | 8     | seconds      |
//! | 8      | 4     | nanoseconds  |
//! | 12     | 4     | pid          |
//! | 16     | 1     | paused       |
//! | 17     | 1     | want         |
//! | 18     | 1     | got term     |
//! | 19     | 1     | phase        |
//! | 20     | 4     | reserved     |
//!
//! `seconds` is a TAI64 label: `2^62 + unix + 10`.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use thiserror::Error;

use crate::layout;

/// Size of an encoded record, reserved tail included.
pub const RECORD_LEN: usize = 24;
/// Bytes carrying fields; shorter input cannot be decoded.
pub const FIELDS_LEN: usize = 20;

const TAI_OFFSET: u64 = 1 << 62;
const TAI_BIAS_SECS: u64 = 10;
const WANT_UP: u8 = b'u';
/// `phase` value while the `run` script's process is alive.
pub const PHASE_RUN: u8 = 1;
/// `phase` value while the `finish` script runs.
#[cfg(test)]
pub const PHASE_FINISH: u8 = 2;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("the service '{name}' doesn't exist")]
    ServiceNotFound { name: String },
    #[error("the service '{name}' is not supervised yet; is the daemon running?")]
    NotSupervised { name: String },
    #[error("status record is {len} bytes, expected at least {FIELDS_LEN}")]
    Truncated { len: usize },
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Raw fields of a status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRecord {
    pub seconds: u64,
    pub nanoseconds: u32,
    pub pid: u32,
    pub paused: u8,
    pub want: u8,
    pub got_term: u8,
    pub phase: u8,
}

impl StatusRecord {
    pub fn decode(raw: &[u8]) -> Result<Self, StatusError> {
        let fields: &[u8; FIELDS_LEN] = raw
            .get(..FIELDS_LEN)
            .and_then(|head| head.try_into().ok())
            .ok_or(StatusError::Truncated { len: raw.len() })?;
        Ok(Self {
            seconds: u64::from_be_bytes(field(fields, 0)),
            nanoseconds: u32::from_be_bytes(field(fields, 8)),
            pid: u32::from_be_bytes(field(fields, 12)),
            paused: fields[16],
            want: fields[17],
            got_term: fields[18],
            phase: fields[19],
        })
    }

    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut raw = [0u8; RECORD_LEN];
        raw[0..8].copy_from_slice(&self.seconds.to_be_bytes());
        raw[8..12].copy_from_slice(&self.nanoseconds.to_be_bytes());
        raw[12..16].copy_from_slice(&self.pid.to_be_bytes());
        raw[16] = self.paused;
        raw[17] = self.want;
        raw[18] = self.got_term;
        raw[19] = self.phase;
        raw
    }

    /// Builds the record `runsv` would write for a process started at
    /// `start_time`.
    #[cfg(test)]
    pub fn at(start_time: SystemTime, pid: u32, want_up: bool, phase: u8) -> Self {
        let since_epoch = start_time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            seconds: TAI_OFFSET + since_epoch.as_secs() + TAI_BIAS_SECS,
            nanoseconds: since_epoch.subsec_micros() * 1000,
            pid,
            paused: 0,
            want: if want_up { WANT_UP } else { b'd' },
            got_term: 0,
            phase,
        }
    }

    /// Start time as Unix time, truncated to microseconds. A timestamp
    /// beyond what `SystemTime` can hold reads as the Unix epoch.
    pub fn start_time(&self) -> SystemTime {
        let mut seconds = self.seconds;
        if seconds >= TAI_OFFSET {
            seconds -= TAI_OFFSET;
        }
        let seconds = seconds.saturating_sub(TAI_BIAS_SECS);
        let micros = u64::from(self.nanoseconds / 1000);
        Duration::from_secs(seconds)
            .checked_add(Duration::from_micros(micros))
            .and_then(|since_epoch| UNIX_EPOCH.checked_add(since_epoch))
            .unwrap_or(UNIX_EPOCH)
    }

    pub fn want_up(&self) -> bool {
        self.want == WANT_UP
    }

    pub fn is_up(&self) -> bool {
        self.phase == PHASE_RUN
    }
}

fn field<const N: usize>(fields: &[u8; FIELDS_LEN], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&fields[offset..offset + N]);
    out
}

/// Status of one service, derived fresh from its record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub start_time: SystemTime,
    pub pid: u32,
    pub paused: bool,
    pub want_up: bool,
    pub got_term: bool,
    pub up: bool,
}

impl ServiceStatus {
    pub fn from_record(name: impl Into<String>, record: &StatusRecord) -> Self {
        Self {
            name: name.into(),
            start_time: record.start_time(),
            pid: record.pid,
            paused: record.paused != 0,
            want_up: record.want_up(),
            got_term: record.got_term != 0,
            up: record.is_up(),
        }
    }

    /// A service `runsv` has not picked up yet; shown as down.
    pub fn unsupervised(name: impl Into<String>, now: SystemTime) -> Self {
        Self {
            name: name.into(),
            start_time: now,
            pid: 0,
            paused: false,
            want_up: false,
            got_term: false,
            up: false,
        }
    }

    pub fn label(&self) -> &'static str {
        if self.up {
            "up"
        } else if self.want_up {
            "down (want up)"
        } else {
            "down"
        }
    }

    /// Time spent in the current state as of `now`.
    pub fn elapsed(&self, now: SystemTime) -> Duration {
        now.duration_since(self.start_time).unwrap_or_default()
    }
}

/// Reads and decodes the status record of the service rooted at
/// `service_dir`.
pub fn read_status(service_dir: &Path) -> Result<ServiceStatus, StatusError> {
    let name = layout::service_name(service_dir);
    if !service_dir.exists() {
        return Err(StatusError::ServiceNotFound { name });
    }
    let path = layout::status_file(service_dir);
    let raw = match std::fs::read(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(StatusError::NotSupervised { name });
        }
        Err(source) => return Err(StatusError::Io { path, source }),
    };
    let record = StatusRecord::decode(&raw)?;
    Ok(ServiceStatus::from_record(name, &record))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(want: u8, phase: u8) -> StatusRecord {
        StatusRecord {
            seconds: TAI_OFFSET + 1_700_000_000 + TAI_BIAS_SECS,
            nanoseconds: 123_456_789,
            pid: 4242,
            paused: 0,
            want,
            got_term: 0,
            phase,
        }
    }

    #[test]
    fn round_trips_known_tuples() {
        let samples = [
            record(b'u', PHASE_RUN),
            StatusRecord {
                seconds: u64::MAX,
                nanoseconds: u32::MAX,
                pid: u32::MAX,
                paused: 1,
                want: b'd',
                got_term: 1,
                phase: PHASE_FINISH,
            },
            StatusRecord {
                seconds: 0,
                nanoseconds: 0,
                pid: 0,
                paused: 0,
                want: 0,
                got_term: 0,
                phase: 0,
            },
        ];
        for sample in samples {
            assert_eq!(StatusRecord::decode(&sample.encode()).unwrap(), sample);
        }
    }

    #[test]
    fn fields_sit_at_documented_offsets() {
        let raw = record(b'u', PHASE_RUN).encode();
        assert_eq!(raw.len(), RECORD_LEN);
        assert_eq!(raw[0], 0x40);
        assert_eq!(&raw[12..16], &4242u32.to_be_bytes());
        assert_eq!(raw[17], b'u');
        assert_eq!(raw[19], PHASE_RUN);
        assert_eq!(&raw[20..], &[0, 0, 0, 0]);
    }

    #[test]
    fn accepts_bare_field_bytes_and_rejects_short_input() {
        let raw = record(b'd', 0).encode();
        assert!(StatusRecord::decode(&raw[..FIELDS_LEN]).is_ok());
        let err = StatusRecord::decode(&raw[..FIELDS_LEN - 1]).unwrap_err();
        assert!(matches!(err, StatusError::Truncated { len: 19 }));
    }

    #[test]
    fn start_time_removes_tai_bias_and_scales_nanoseconds() {
        let start = record(b'u', PHASE_RUN).start_time();
        let expected = UNIX_EPOCH + Duration::from_secs(1_700_000_000) + Duration::from_micros(123_456);
        assert_eq!(start, expected);
    }

    #[test]
    fn start_time_accepts_unoffset_seconds() {
        let mut raw = record(b'u', PHASE_RUN);
        raw.seconds = 1_700_000_000 + TAI_BIAS_SECS;
        raw.nanoseconds = 0;
        assert_eq!(raw.start_time(), UNIX_EPOCH + Duration::from_secs(1_700_000_000));
    }

    #[test]
    fn out_of_range_start_time_reads_as_epoch() {
        let mut garbage = record(b'u', PHASE_RUN);
        garbage.seconds = u64::MAX;
        garbage.nanoseconds = u32::MAX;
        let decoded = StatusRecord::decode(&garbage.encode()).unwrap();

        let status = ServiceStatus::from_record("redis", &decoded);
        assert_eq!(status.start_time, UNIX_EPOCH);
        assert!(status.up);
        assert!(status.elapsed(SystemTime::now()) > Duration::ZERO);
    }

    #[test]
    fn at_inverts_start_time() {
        let start = UNIX_EPOCH + Duration::from_secs(1_650_000_000) + Duration::from_micros(42);
        let raw = StatusRecord::at(start, 7, true, PHASE_RUN);
        assert_eq!(raw.start_time(), start);
        assert!(raw.want_up());
    }

    #[test]
    fn labels_follow_up_and_want_flags() {
        let want_up_but_down = ServiceStatus::from_record("redis", &record(b'u', 0));
        assert_eq!(want_up_but_down.label(), "down (want up)");

        let up = ServiceStatus::from_record("redis", &record(b'u', PHASE_RUN));
        assert_eq!(up.label(), "up");
        let up_want_down = ServiceStatus::from_record("redis", &record(b'd', PHASE_RUN));
        assert_eq!(up_want_down.label(), "up");

        let down = ServiceStatus::from_record("redis", &record(b'd', 0));
        assert_eq!(down.label(), "down");
        let finishing = ServiceStatus::from_record("redis", &record(b'u', PHASE_FINISH));
        assert_eq!(finishing.label(), "down (want up)");
    }

    #[test]
    fn missing_service_directory_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = read_status(&tmp.path().join("services").join("ghost")).unwrap_err();
        assert!(matches!(err, StatusError::ServiceNotFound { ref name } if name == "ghost"));
        assert_eq!(err.to_string(), "the service 'ghost' doesn't exist");
    }

    #[test]
    fn missing_status_file_is_not_supervised() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("redis");
        std::fs::create_dir_all(&dir).unwrap();
        let err = read_status(&dir).unwrap_err();
        assert!(matches!(err, StatusError::NotSupervised { .. }));
    }

    #[test]
    fn reads_status_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("postgresql");
        std::fs::create_dir_all(dir.join("supervise")).unwrap();
        std::fs::write(layout::status_file(&dir), record(b'u', PHASE_RUN).encode()).unwrap();
        let status = read_status(&dir).unwrap();
        assert_eq!(status.name, "postgresql");
        assert_eq!(status.pid, 4242);
        assert!(status.up);
        assert!(!status.paused);
    }
}
