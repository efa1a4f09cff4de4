//! Process-wide throttle for new-host creation
//!
//! The controller owns the single lock that serializes host creation. A
//! [`CreationGuard`] is that lock held: the engine keeps it for the whole
//! creation sequence so the spacing check, the filesystem work, the registry
//! insert and the counter increment are never interleaved with another
//! creation. State lives in memory only and starts over with the process.

use parking_lot::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Reason a creation slot was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ThrottleDenial {
    /// The previous creation was reserved less than the configured spacing ago
    #[error("time between host creations has not elapsed, retry in {}ms", .retry_after.as_millis())]
    TooSoon { retry_after: Duration },
    /// The process has already created its maximum number of hosts
    #[error("maximum number of host creations ({max}) reached")]
    LimitReached { max: u32 },
}

#[derive(Debug, Default)]
struct ThrottleState {
    /// When the most recent creation slot was reserved
    last_creation: Option<Instant>,
    /// Hosts actually added to the registry since startup
    created: u32,
}

/// Point-in-time copy of the throttle counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleSnapshot {
    pub last_creation: Option<Instant>,
    pub created: u32,
}

pub struct ThrottleController {
    state: Mutex<ThrottleState>,
    time_between_creations: Duration,
    max_creations: u32,
}

impl ThrottleController {
    pub fn new(time_between_creations: Duration, max_creations: u32) -> Self {
        Self {
            state: Mutex::new(ThrottleState::default()),
            time_between_creations,
            max_creations,
        }
    }

    /// Acquire the creation lock.
    ///
    /// Blocks while another thread holds it. The returned guard must be kept
    /// for the full creation sequence.
    pub fn lock(&self) -> CreationGuard<'_> {
        CreationGuard {
            state: self.state.lock(),
            time_between_creations: self.time_between_creations,
            max_creations: self.max_creations,
        }
    }

    pub fn snapshot(&self) -> ThrottleSnapshot {
        let state = self.state.lock();
        ThrottleSnapshot {
            last_creation: state.last_creation,
            created: state.created,
        }
    }
}

/// The throttle lock, held
pub struct CreationGuard<'a> {
    state: MutexGuard<'a, ThrottleState>,
    time_between_creations: Duration,
    max_creations: u32,
}

impl CreationGuard<'_> {
    /// Check spacing and the creation limit, then stamp the reservation time.
    ///
    /// The timestamp is recorded on reservation, before any slow work, so
    /// racing requests for different hosts are still spaced apart.
    pub fn try_reserve(&mut self, now: Instant) -> Result<(), ThrottleDenial> {
        if let Some(last) = self.state.last_creation {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.time_between_creations {
                return Err(ThrottleDenial::TooSoon {
                    retry_after: self.time_between_creations - elapsed,
                });
            }
        }

        if self.state.created >= self.max_creations {
            return Err(ThrottleDenial::LimitReached {
                max: self.max_creations,
            });
        }

        self.state.last_creation = Some(now);
        Ok(())
    }

    /// Count a host that was actually added to the registry
    pub fn record_created(&mut self) -> u32 {
        self.state.created = self.state.created.saturating_add(1);
        self.state.created
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_first_reservation_allowed() {
        let throttle = ThrottleController::new(Duration::from_secs(30), 10);
        assert!(throttle.lock().try_reserve(Instant::now()).is_ok());
        let snapshot = throttle.snapshot();
        assert!(snapshot.last_creation.is_some());
        assert_eq!(snapshot.created, 0);
    }

    #[test]
    fn test_reservation_too_soon() {
        let throttle = ThrottleController::new(Duration::from_secs(30), 10);
        let start = Instant::now();

        let mut guard = throttle.lock();
        assert!(guard.try_reserve(start).is_ok());

        let denial = guard.try_reserve(start + Duration::from_secs(10)).unwrap_err();
        assert_eq!(
            denial,
            ThrottleDenial::TooSoon {
                retry_after: Duration::from_secs(20)
            }
        );

        assert!(guard.try_reserve(start + Duration::from_secs(30)).is_ok());
    }

    #[test]
    fn test_denied_reservation_keeps_previous_timestamp() {
        let throttle = ThrottleController::new(Duration::from_secs(30), 10);
        let start = Instant::now();
        {
            let mut guard = throttle.lock();
            guard.try_reserve(start).unwrap();
            guard.try_reserve(start + Duration::from_secs(5)).unwrap_err();
        }
        assert_eq!(throttle.snapshot().last_creation, Some(start));
    }

    #[test]
    fn test_limit_reached_counts_created_hosts_only() {
        let throttle = ThrottleController::new(Duration::ZERO, 2);
        let now = Instant::now();
        let mut guard = throttle.lock();

        // Reservations without a completed creation do not consume the limit
        for _ in 0..5 {
            assert!(guard.try_reserve(now).is_ok());
        }

        assert_eq!(guard.record_created(), 1);
        assert_eq!(guard.record_created(), 2);
        assert_eq!(
            guard.try_reserve(now).unwrap_err(),
            ThrottleDenial::LimitReached { max: 2 }
        );
    }

    #[test]
    fn test_zero_max_creations_denies_everything() {
        let throttle = ThrottleController::new(Duration::ZERO, 0);
        assert_eq!(
            throttle.lock().try_reserve(Instant::now()).unwrap_err(),
            ThrottleDenial::LimitReached { max: 0 }
        );
    }

    #[test]
    fn test_concurrent_reservations_respect_spacing() {
        let throttle = Arc::new(ThrottleController::new(Duration::from_secs(60), 100));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let throttle = Arc::clone(&throttle);
                std::thread::spawn(move || throttle.lock().try_reserve(Instant::now()).is_ok())
            })
            .collect();

        let allowed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(allowed, 1);
    }

    #[test]
    fn test_denial_messages() {
        let too_soon = ThrottleDenial::TooSoon {
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(
            too_soon.to_string(),
            "time between host creations has not elapsed, retry in 1500ms"
        );
        assert_eq!(
            ThrottleDenial::LimitReached { max: 3 }.to_string(),
            "maximum number of host creations (3) reached"
        );
    }
}
