//! # Tempo
//!
//! Transmission speed control. The current speed lives in a `watch` channel
//! so the sender wakes up as soon as it changes. [`Pacer`] turns the speed
//! into a slot clock: every data parcel is charged against the clock and the
//! next one waits until its slot is due. Signals are never paced.
//!
//! Speeds are bytes per second; [`TEMPO_UNLIMITED`] disables pacing and zero
//! pauses data entirely.

use crate::config::TEMPO_UNLIMITED;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Shared transmission speed of one connection
#[derive(Debug)]
pub(crate) struct TempoController {
    tx: watch::Sender<i64>,
}

impl TempoController {
    pub(crate) fn new(speed: i64) -> Self {
        let (tx, _) = watch::channel(normalize(speed));
        Self { tx }
    }

    pub(crate) fn speed(&self) -> i64 {
        *self.tx.borrow()
    }

    /// Set a new speed, returning whether it changed
    pub(crate) fn set(&self, speed: i64) -> bool {
        let speed = normalize(speed);
        self.tx.send_if_modified(|current| {
            if *current == speed {
                false
            } else {
                *current = speed;
                true
            }
        })
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<i64> {
        self.tx.subscribe()
    }
}

/// Map every negative speed to [`TEMPO_UNLIMITED`]
pub(crate) fn normalize(speed: i64) -> i64 {
    if speed < 0 {
        TEMPO_UNLIMITED
    } else {
        speed
    }
}

/// Whether the sender may emit a data parcel now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Ready,
    Wait(Instant),
    Paused,
}

/// Slot clock of the sender
#[derive(Debug)]
pub(crate) struct Pacer {
    next_slot: Instant,
}

impl Pacer {
    pub(crate) fn new() -> Self {
        Self {
            next_slot: Instant::now(),
        }
    }

    pub(crate) fn admission(&self, speed: i64, now: Instant) -> Admission {
        match speed {
            s if s < 0 => Admission::Ready,
            0 => Admission::Paused,
            _ if now >= self.next_slot => Admission::Ready,
            _ => Admission::Wait(self.next_slot),
        }
    }

    /// Account for `bytes` just written
    pub(crate) fn charge(&mut self, bytes: usize, speed: i64, now: Instant) {
        if speed <= 0 {
            self.next_slot = now;
            return;
        }
        let start = self.next_slot.max(now);
        let cost = Duration::from_secs_f64(bytes as f64 / speed as f64);
        self.next_slot = start + cost;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_and_paused() {
        let pacer = Pacer::new();
        let now = Instant::now();
        assert_eq!(pacer.admission(-1, now), Admission::Ready);
        assert_eq!(pacer.admission(0, now), Admission::Paused);
    }

    #[test]
    fn test_slot_clock() {
        let mut pacer = Pacer::new();
        let now = Instant::now();
        assert_eq!(pacer.admission(1000, now), Admission::Ready);
        pacer.charge(500, 1000, now);
        assert_eq!(
            pacer.admission(1000, now),
            Admission::Wait(now + Duration::from_millis(500))
        );
        assert_eq!(
            pacer.admission(1000, now + Duration::from_millis(500)),
            Admission::Ready
        );
    }

    #[test]
    fn test_charges_accumulate() {
        let mut pacer = Pacer::new();
        let now = Instant::now();
        pacer.charge(1000, 2000, now);
        pacer.charge(1000, 2000, now);
        assert_eq!(pacer.admission(2000, now), Admission::Wait(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_controller_normalizes() {
        let tempo = TempoController::new(-50);
        assert_eq!(tempo.speed(), TEMPO_UNLIMITED);
        assert!(tempo.set(100));
        assert!(!tempo.set(100));
        assert_eq!(tempo.speed(), 100);
        assert!(tempo.set(-7));
        assert_eq!(tempo.speed(), TEMPO_UNLIMITED);
    }
}
