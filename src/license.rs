use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

const SEGMENTS: usize = 4;
const SEGMENT_LEN: usize = 4;
/// Days a validated license may go without a fresh check.
const MAX_OFFLINE_DAYS: i64 = 7;
const MAX_ACTIVATION_ATTEMPTS: u32 = 3;
const ATTEMPT_TIMEOUT_MINUTES: i64 = 30;

#[derive(Debug, Error)]
pub enum LicenseError {
    #[error("license key format is invalid (expected XXXX-XXXX-XXXX-XXXX)")]
    InvalidKeyFormat,

    #[error("license key checksum does not match")]
    ChecksumMismatch,

    #[error("license is bound to a different machine")]
    MachineMismatch,

    #[error("license expired on {0}")]
    Expired(DateTime<Utc>),

    #[error("offline grace period of 7 days exceeded ({days} days since last check)")]
    GraceExpired { days: i64 },

    #[error("too many failed activation attempts, try again in {minutes} minute(s)")]
    TooManyAttempts { minutes: i64 },

    #[error("no license is activated")]
    NotActivated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerInfo {
    pub name: Option<String>,
    pub email: Option<String>,
    pub company: Option<String>,
}

/// A successful activation, bound to one machine fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activation {
    pub license_key: String,
    pub machine_id: String,
    pub activation_date: DateTime<Utc>,
    pub last_check_date: DateTime<Utc>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub customer: CustomerInfo,
}

/// Persisted license state: the current activation (if any) plus the
/// failed-attempt throttle, which survives restarts on purpose.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseState {
    pub activation: Option<Activation>,
    pub failed_attempts: u32,
    pub last_attempt_time: Option<DateTime<Utc>>,
}

impl LicenseState {
    pub fn activated_now(
        license_key: String,
        machine_id: String,
        expiry_date: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        LicenseState {
            activation: Some(Activation {
                license_key,
                machine_id,
                activation_date: now,
                last_check_date: now,
                expiry_date,
                customer: CustomerInfo::default(),
            }),
            failed_attempts: 0,
            last_attempt_time: None,
        }
    }

    /// Validate the key and bind it to `machine_id`. A bad key counts
    /// against the attempt budget; three failures lock activation for
    /// thirty minutes.
    pub fn activate(
        &mut self,
        key: &str,
        customer: CustomerInfo,
        expiry_date: Option<DateTime<Utc>>,
        machine_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), LicenseError> {
        self.ensure_attempt_allowed(now)?;

        if let Err(e) = validate_key(key) {
            self.failed_attempts += 1;
            self.last_attempt_time = Some(now);
            return Err(e);
        }

        self.activation = Some(Activation {
            license_key: key.to_string(),
            machine_id: machine_id.to_string(),
            activation_date: now,
            last_check_date: now,
            expiry_date,
            customer,
        });
        self.failed_attempts = 0;
        self.last_attempt_time = None;
        Ok(())
    }

    /// Re-check the stored activation against this machine and the
    /// clock. A passing check is expected to be followed by `touch` so
    /// the offline grace window restarts.
    pub fn validate(&self, machine_id: &str, now: DateTime<Utc>) -> Result<&Activation, LicenseError> {
        let activation = self.activation.as_ref().ok_or(LicenseError::NotActivated)?;

        if activation.machine_id != machine_id {
            return Err(LicenseError::MachineMismatch);
        }
        if let Some(expiry) = activation.expiry_date {
            if now > expiry {
                return Err(LicenseError::Expired(expiry));
            }
        }
        let offline_days = (now - activation.last_check_date).num_days();
        if offline_days > MAX_OFFLINE_DAYS {
            return Err(LicenseError::GraceExpired { days: offline_days });
        }
        Ok(activation)
    }

    /// Record a successful check, restarting the offline grace window.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if let Some(activation) = self.activation.as_mut() {
            activation.last_check_date = now;
        }
    }

    pub fn deactivate(&mut self) {
        self.activation = None;
    }

    /// Days until expiry; `None` for perpetual licenses, zero when
    /// already expired.
    pub fn remaining_days(&self, now: DateTime<Utc>) -> Option<i64> {
        let expiry = self.activation.as_ref()?.expiry_date?;
        Some((expiry - now).num_days().max(0))
    }

    fn ensure_attempt_allowed(&mut self, now: DateTime<Utc>) -> Result<(), LicenseError> {
        if self.failed_attempts < MAX_ACTIVATION_ATTEMPTS {
            return Ok(());
        }
        let last = match self.last_attempt_time {
            Some(t) => t,
            None => return Ok(()),
        };
        let elapsed = (now - last).num_minutes();
        if elapsed < ATTEMPT_TIMEOUT_MINUTES {
            return Err(LicenseError::TooManyAttempts {
                minutes: ATTEMPT_TIMEOUT_MINUTES - elapsed,
            });
        }
        // Timeout passed; the budget resets.
        self.failed_attempts = 0;
        self.last_attempt_time = None;
        Ok(())
    }
}

/// Generate a fresh key: three random segments from a UUID plus a
/// checksum segment over them.
pub fn generate_key() -> String {
    let pool: String = Uuid::new_v4().simple().to_string().to_uppercase();
    let mut segments: Vec<String> = (0..SEGMENTS - 1)
        .map(|i| pool[i * SEGMENT_LEN..(i + 1) * SEGMENT_LEN].to_string())
        .collect();
    let checksum = key_checksum(&segments.concat());
    segments.push(checksum);
    segments.join("-")
}

/// Structural and checksum validation of a key. No server involved;
/// the last segment must equal the checksum of the first three.
pub fn validate_key(key: &str) -> Result<(), LicenseError> {
    let segments: Vec<&str> = key.split('-').collect();
    if segments.len() != SEGMENTS {
        return Err(LicenseError::InvalidKeyFormat);
    }
    for segment in &segments {
        if segment.len() != SEGMENT_LEN
            || !segment.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        {
            return Err(LicenseError::InvalidKeyFormat);
        }
    }
    let expected = key_checksum(&segments[..SEGMENTS - 1].concat());
    if segments[SEGMENTS - 1] != expected {
        return Err(LicenseError::ChecksumMismatch);
    }
    Ok(())
}

fn key_checksum(payload: &str) -> String {
    sha256_hex(payload)[..SEGMENT_LEN].to_uppercase()
}

/// Stable fingerprint of this machine from environment identity; no
/// hardware probing, which keeps the check fully offline.
pub fn machine_fingerprint() -> String {
    let hostname = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".into());
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown-user".into());
    sha256_hex(&format!(
        "{}|{}|{}|{}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        hostname,
        user
    ))
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn generated_keys_validate() {
        for _ in 0..20 {
            let key = generate_key();
            assert_eq!(key.len(), SEGMENTS * SEGMENT_LEN + SEGMENTS - 1);
            validate_key(&key).unwrap();
        }
    }

    #[test]
    fn tampered_key_fails_checksum() {
        let key = generate_key();
        let mut segments: Vec<String> = key.split('-').map(String::from).collect();
        segments[0] = if segments[0] == "AAAA" { "BBBB".into() } else { "AAAA".into() };
        let tampered = segments.join("-");
        assert!(matches!(
            validate_key(&tampered),
            Err(LicenseError::ChecksumMismatch)
        ));
    }

    #[test]
    fn malformed_keys_fail_format() {
        for key in ["", "ABCD", "ABCD-EFGH-IJKL", "abcd-efgh-ijkl-mnop", "ABCDE-FGH-IJKL-MNOP"] {
            assert!(matches!(
                validate_key(key),
                Err(LicenseError::InvalidKeyFormat)
            ));
        }
    }

    #[test]
    fn activate_then_validate_on_same_machine() {
        let now = Utc::now();
        let mut state = LicenseState::default();
        state
            .activate(&generate_key(), CustomerInfo::default(), None, "machine-a", now)
            .unwrap();
        let activation = state.validate("machine-a", now).unwrap();
        assert_eq!(activation.machine_id, "machine-a");
    }

    #[test]
    fn validate_rejects_other_machines() {
        let now = Utc::now();
        let mut state = LicenseState::default();
        state
            .activate(&generate_key(), CustomerInfo::default(), None, "machine-a", now)
            .unwrap();
        assert!(matches!(
            state.validate("machine-b", now),
            Err(LicenseError::MachineMismatch)
        ));
    }

    #[test]
    fn expired_license_is_rejected() {
        let now = Utc::now();
        let expiry = now - Duration::days(1);
        let mut state = LicenseState::default();
        state
            .activate(&generate_key(), CustomerInfo::default(), Some(expiry), "m", now - Duration::days(2))
            .unwrap();
        assert!(matches!(state.validate("m", now), Err(LicenseError::Expired(_))));
        assert_eq!(state.remaining_days(now), Some(0));
    }

    #[test]
    fn offline_grace_expires_after_seven_days() {
        let activated_at = Utc::now();
        let mut state = LicenseState::default();
        state
            .activate(&generate_key(), CustomerInfo::default(), None, "m", activated_at)
            .unwrap();

        let within = activated_at + Duration::days(7);
        state.validate("m", within).unwrap();

        let beyond = activated_at + Duration::days(8);
        assert!(matches!(
            state.validate("m", beyond),
            Err(LicenseError::GraceExpired { days: 8 })
        ));

        // A fresh check restarts the window.
        state.touch(beyond - Duration::days(1));
        state.validate("m", beyond).unwrap();
    }

    #[test]
    fn passing_check_plus_touch_restarts_the_grace_window() {
        let t0 = Utc::now();
        let mut state = LicenseState::default();
        state
            .activate(&generate_key(), CustomerInfo::default(), None, "m", t0)
            .unwrap();

        // Day 5: check passes and the check date is refreshed, so day
        // 10 is only 5 days offline.
        let day5 = t0 + Duration::days(5);
        state.validate("m", day5).unwrap();
        state.touch(day5);
        state.validate("m", t0 + Duration::days(10)).unwrap();

        // Without the refresh, day 10 would have been out of grace.
        let mut stale = LicenseState::default();
        stale
            .activate(&generate_key(), CustomerInfo::default(), None, "m", t0)
            .unwrap();
        assert!(matches!(
            stale.validate("m", t0 + Duration::days(10)),
            Err(LicenseError::GraceExpired { .. })
        ));
    }

    #[test]
    fn three_failures_lock_activation_for_thirty_minutes() {
        let now = Utc::now();
        let mut state = LicenseState::default();
        for _ in 0..3 {
            assert!(state
                .activate("XXXX-XXXX-XXXX-XXXX", CustomerInfo::default(), None, "m", now)
                .is_err());
        }
        assert!(matches!(
            state.activate(&generate_key(), CustomerInfo::default(), None, "m", now),
            Err(LicenseError::TooManyAttempts { .. })
        ));

        // After the timeout even a previously locked state accepts a
        // valid key.
        let later = now + Duration::minutes(31);
        state
            .activate(&generate_key(), CustomerInfo::default(), None, "m", later)
            .unwrap();
        assert!(state.activation.is_some());
        assert_eq!(state.failed_attempts, 0);
    }

    #[test]
    fn deactivate_clears_the_activation() {
        let now = Utc::now();
        let mut state = LicenseState::default();
        state
            .activate(&generate_key(), CustomerInfo::default(), None, "m", now)
            .unwrap();
        state.deactivate();
        assert!(matches!(
            state.validate("m", now),
            Err(LicenseError::NotActivated)
        ));
    }

    #[test]
    fn fingerprint_is_stable_within_a_process() {
        assert_eq!(machine_fingerprint(), machine_fingerprint());
        assert_eq!(machine_fingerprint().len(), 64);
    }
}
