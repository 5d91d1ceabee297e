use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-recording-file tracking state. Primary key is the file's basename.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingDescriptor {
    pub filename: String,
    pub channel: Option<String>,
    pub uniqueid: Option<String>,
    pub linkedid: Option<String>,
    pub callerid_num: Option<String>,
    pub exten: Option<String>,
    pub context: Option<String>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub file_path: Option<String>,
    pub file_exists: bool,
    pub file_size: i64,
    pub last_size_check: Option<DateTime<Utc>>,
    pub size_stable_count: i32,
    pub recording_complete: bool,
    pub uploaded: bool,
    pub upload_status: Option<i32>,
    pub upload_attempts: i32,
    pub last_upload_attempt: Option<DateTime<Utc>>,
    pub last_upload_error: Option<String>,
    pub earliest_upload_time: Option<DateTime<Utc>>,
    /// Filename was synthesized (`<uniqueid>.wav`) because the start event omitted one and
    /// no on-disk candidate was found; suppresses the file-discovery fallback's basename match
    /// against it so a later, differently-named real file is not conflated with this entry.
    pub synthetic_filename: bool,
}

impl RecordingDescriptor {
    pub fn new(filename: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            filename: filename.into(),
            channel: None,
            uniqueid: None,
            linkedid: None,
            callerid_num: None,
            exten: None,
            context: None,
            started_at,
            stopped_at: None,
            file_path: None,
            file_exists: true,
            file_size: 0,
            last_size_check: None,
            size_stable_count: 0,
            recording_complete: false,
            uploaded: false,
            upload_status: None,
            upload_attempts: 0,
            last_upload_attempt: None,
            last_upload_error: None,
            earliest_upload_time: None,
            synthetic_filename: false,
        }
    }

    /// Minimum plausible size (bytes) for a non-empty recording; below this a stable sample
    /// sequence is not allowed to mark the recording complete (avoids shipping WAV headers).
    pub const MIN_STABLE_SIZE: i64 = 1000;
    /// Number of consecutive identical-size samples required for completion.
    pub const STABILITY_SAMPLES: i32 = 2;
    /// Recording descriptors are purged this long after `started_at`. Extended from the
    /// original 24h recording-purge window to match the 48h retry ceiling so a descriptor is
    /// never dropped while still eligible for a retried upload (see DESIGN.md).
    pub const PURGE_AGE_HOURS: i64 = 48;

    pub fn observe_size(&mut self, size: i64, now: DateTime<Utc>) {
        if size == self.file_size && size >= Self::MIN_STABLE_SIZE {
            self.size_stable_count += 1;
        } else if size < Self::MIN_STABLE_SIZE {
            self.size_stable_count = 0;
        } else {
            self.size_stable_count = 0;
        }
        self.file_size = size;
        self.last_size_check = Some(now);
        if self.size_stable_count >= Self::STABILITY_SAMPLES {
            self.recording_complete = true;
        }
    }

    pub fn mark_stopped(&mut self, stopped_at: DateTime<Utc>) {
        self.stopped_at = Some(stopped_at);
        self.earliest_upload_time = Some(stopped_at + chrono::Duration::seconds(5));
    }

    /// Cooldown before the next retry attempt, scaling with attempt count: 5m, 10m, 20m,
    /// 40m, 1h, then holding at 1h until the 48h abandonment ceiling.
    pub fn retry_cooldown(attempts: i32) -> chrono::Duration {
        let minutes = match attempts {
            0 => return chrono::Duration::zero(),
            1 => 5,
            2 => 10,
            3 => 20,
            4 => 40,
            _ => 60,
        };
        chrono::Duration::minutes(minutes)
    }

    pub fn is_abandoned(&self, now: DateTime<Utc>) -> bool {
        now - self.started_at >= chrono::Duration::hours(Self::PURGE_AGE_HOURS)
    }

    pub fn eligible_for_upload(&self, now: DateTime<Utc>) -> bool {
        if !self.recording_complete || self.uploaded {
            return false;
        }
        match self.earliest_upload_time {
            Some(t) => now >= t,
            None => false,
        }
    }

    pub fn record_failed_attempt(&mut self, status: Option<i32>, error: impl Into<String>, now: DateTime<Utc>) {
        self.upload_attempts += 1;
        self.upload_status = status;
        self.last_upload_error = Some(error.into());
        self.last_upload_attempt = Some(now);
        self.earliest_upload_time = Some(now + Self::retry_cooldown(self.upload_attempts));
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.uploaded = true;
        self.upload_status = Some(202);
        self.last_upload_attempt = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_identical_stable_samples_mark_complete() {
        let mut d = RecordingDescriptor::new("x.wav", Utc::now());
        d.observe_size(4096, Utc::now());
        assert!(!d.recording_complete);
        d.observe_size(4096, Utc::now());
        assert!(d.recording_complete);
    }

    #[test]
    fn sizes_below_minimum_never_stabilize() {
        let mut d = RecordingDescriptor::new("x.wav", Utc::now());
        d.observe_size(10, Utc::now());
        d.observe_size(10, Utc::now());
        assert!(!d.recording_complete);
    }

    #[test]
    fn growing_size_resets_stability_count() {
        let mut d = RecordingDescriptor::new("x.wav", Utc::now());
        d.observe_size(4096, Utc::now());
        d.observe_size(8192, Utc::now());
        assert_eq!(d.size_stable_count, 0);
        assert!(!d.recording_complete);
    }

    #[test]
    fn eligibility_requires_complete_and_cooldown_elapsed() {
        let now = Utc::now();
        let mut d = RecordingDescriptor::new("x.wav", now);
        assert!(!d.eligible_for_upload(now));
        d.recording_complete = true;
        d.earliest_upload_time = Some(now - chrono::Duration::seconds(1));
        assert!(d.eligible_for_upload(now));
    }
}
