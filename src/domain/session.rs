use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;

use crate::config::SessionConfig;
use crate::error::{Result, TrailgateError};

/// Daily no-trade window in venue-local time.
///
/// Signals are rejected, quote streams are stopped and tick delivery is
/// suppressed while `is_paused` holds.
#[derive(Debug, Clone, Copy)]
pub struct TradingSession {
    tz: Tz,
    pause_start_hour: u32,
    pause_end_hour: u32,
    enabled: bool,
}

impl TradingSession {
    pub fn new(tz: Tz, pause_start_hour: u32, pause_end_hour: u32) -> Self {
        Self {
            tz,
            pause_start_hour,
            pause_end_hour,
            enabled: true,
        }
    }

    pub fn from_config(cfg: &SessionConfig) -> Result<Self> {
        let tz: Tz = cfg.timezone.parse().map_err(|_| {
            TrailgateError::Validation(format!("unknown timezone '{}'", cfg.timezone))
        })?;
        Ok(Self::new(tz, cfg.pause_start_hour, cfg.pause_end_hour))
    }

    /// A session that never pauses.
    pub fn always_open() -> Self {
        Self {
            tz: chrono_tz::America::New_York,
            pause_start_hour: 0,
            pause_end_hour: 0,
            enabled: false,
        }
    }

    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        let hour = now.with_timezone(&self.tz).hour();
        if self.pause_start_hour <= self.pause_end_hour {
            hour >= self.pause_start_hour && hour < self.pause_end_hour
        } else {
            // window wraps midnight
            hour >= self.pause_start_hour || hour < self.pause_end_hour
        }
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        !self.is_paused(now)
    }
}

impl Default for TradingSession {
    fn default() -> Self {
        Self::new(chrono_tz::America::New_York, 16, 18)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_pause_window_edges_in_winter() {
        let session = TradingSession::default();
        // EST is UTC-5 in January
        let before = Utc.with_ymd_and_hms(2025, 1, 15, 20, 59, 59).unwrap();
        let start = Utc.with_ymd_and_hms(2025, 1, 15, 21, 0, 0).unwrap();
        let last = Utc.with_ymd_and_hms(2025, 1, 15, 22, 59, 59).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 1, 15, 23, 0, 0).unwrap();

        assert!(!session.is_paused(before));
        assert!(session.is_paused(start));
        assert!(session.is_paused(last));
        assert!(!session.is_paused(end));
    }

    #[test]
    fn test_pause_window_follows_dst() {
        let session = TradingSession::default();
        // EDT is UTC-4 in July: 16:30 local is 20:30 UTC
        let summer = Utc.with_ymd_and_hms(2025, 7, 15, 20, 30, 0).unwrap();
        assert!(session.is_paused(summer));
        let winter_same_utc = Utc.with_ymd_and_hms(2025, 1, 15, 20, 30, 0).unwrap();
        assert!(!session.is_paused(winter_same_utc));
    }

    #[test]
    fn test_always_open_never_pauses() {
        let session = TradingSession::always_open();
        let t = Utc.with_ymd_and_hms(2025, 1, 15, 21, 30, 0).unwrap();
        assert!(session.is_open(t));
    }

    #[test]
    fn test_from_config_rejects_unknown_zone() {
        let cfg = SessionConfig {
            timezone: "Nowhere/Special".into(),
            ..SessionConfig::default()
        };
        assert!(TradingSession::from_config(&cfg).is_err());
    }
}
