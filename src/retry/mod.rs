//! Retry & Fallback Controller
//!
//! Entscheidet nach einem ICE-Failure ob ein Restart mit Backoff, ein
//! Audio-only-Fallback oder das terminale Aufgeben folgt. Der Controller
//! ist reiner Zustand plus Entscheidungsfunktion; das Scheduling (Timer,
//! Offer-Publish) liegt bei der Session. Ein fehlschlagender Restart
//! läuft durch dieselbe begrenzte Schleife statt zu rekursieren.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Basis des exponentiellen Backoffs
const BACKOFF_BASE: Duration = Duration::from_millis(2000);

/// Nächster Schritt nach einem ICE-Failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// ICE Restart nach Ablauf der Wartezeit
    RestartAfter(Duration),

    /// Lokales Video deaktivieren, Zähler zurücksetzen, ein weiterer
    /// Restart im Audio-only-Modus
    AudioOnlyFallback,

    /// Versuche erschöpft, Session terminal fehlschlagen lassen
    GiveUp,
}

/// Zustand des Controllers über die Lebensdauer einer Session
#[derive(Debug, Clone)]
pub struct RetryState {
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub audio_only_fallback_applied: bool,
}

impl Default for RetryState {
    fn default() -> Self {
        Self {
            attempt_count: 0,
            max_attempts: 3,
            last_attempt_at: None,
            audio_only_fallback_applied: false,
        }
    }
}

impl RetryState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Entscheidet den nächsten Schritt und schreibt ihn fort.
    ///
    /// `is_video`: trägt die Session gerade ein lokales Video-Track-Flag.
    /// Der Fallback setzt den Zähler zurück und markiert sich selbst,
    /// damit er höchstens einmal greift.
    pub fn on_ice_failed(&mut self, is_video: bool) -> RetryDecision {
        if self.attempt_count < self.max_attempts {
            let delay = BACKOFF_BASE * 2u32.pow(self.attempt_count);
            self.attempt_count += 1;
            self.last_attempt_at = Some(Utc::now());
            return RetryDecision::RestartAfter(delay);
        }

        if is_video && !self.audio_only_fallback_applied {
            self.audio_only_fallback_applied = true;
            self.attempt_count = 0;
            return RetryDecision::AudioOnlyFallback;
        }

        RetryDecision::GiveUp
    }

    /// Erfolgreiche Reconnection setzt den Zähler bedingungslos zurück
    pub fn on_connected(&mut self) {
        self.attempt_count = 0;
        self.last_attempt_at = None;
    }
}
