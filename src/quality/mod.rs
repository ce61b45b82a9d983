//! Connection Quality Monitor
//!
//! Zwei getrennte Signale:
//! - `ConnectionQualitySample`/`QualityTier`: feingranular, aus den
//!   Transport-Countern des laufenden Calls abgeleitet (2s-Intervall,
//!   Deltas gegen das vorherige Sample).
//! - `NetworkQuality`: grob, aus OS-gemeldetem Transporttyp und
//!   Link-Bandbreite, unabhängig vom aktiven Call. Ein Netzwechsel
//!   während eines Calls triggert proaktiv einen ICE Restart.

use crate::engine::{EngineError, MediaEngine, TransportCounters};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Sampling-Intervall während State = Connected
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

// ============================================================================
// CALL QUALITY
// ============================================================================

/// Qualitätsstufe, top-down geprüft, erster Treffer gewinnt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityTier {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl QualityTier {
    /// Klassifiziert RTT und Paketverlust in eine Stufe.
    ///
    /// Beide Schwellen müssen gleichzeitig erfüllt sein.
    pub fn classify(rtt_ms: f64, loss_percent: f64) -> Self {
        if rtt_ms < 100.0 && loss_percent < 1.0 {
            QualityTier::Excellent
        } else if rtt_ms < 200.0 && loss_percent < 3.0 {
            QualityTier::Good
        } else if rtt_ms < 400.0 && loss_percent < 5.0 {
            QualityTier::Fair
        } else {
            QualityTier::Poor
        }
    }

    /// Nutzerlesbare Begründung für terminale Failure-Meldungen
    pub fn failure_reason(&self) -> &'static str {
        match self {
            QualityTier::Excellent | QualityTier::Good => {
                "connection lost despite good network conditions"
            }
            QualityTier::Fair => "connection lost, network quality was degraded",
            QualityTier::Poor => "connection lost, network quality was too poor",
        }
    }
}

/// Ein ausgewertetes Sample inklusive Stufe
#[derive(Debug, Clone)]
pub struct ConnectionQualitySample {
    pub rtt_ms: f64,
    pub packet_loss_percent: f64,
    pub jitter_ms: Option<f64>,
    pub bandwidth_sent_kbps: f64,
    pub bandwidth_recv_kbps: f64,
    pub tier: QualityTier,
    pub sampled_at: DateTime<Utc>,
}

/// Delta-Auswertung zweier Counter-Stände.
///
/// Die Counter sind monoton; Verlust und Bandbreite beziehen sich nur
/// auf das Intervall zwischen `previous` und `current`.
pub fn evaluate_sample(
    previous: &TransportCounters,
    current: &TransportCounters,
    elapsed: Duration,
) -> ConnectionQualitySample {
    let lost = current.packets_lost.saturating_sub(previous.packets_lost);
    let received = current
        .packets_received
        .saturating_sub(previous.packets_received);
    let loss_percent = if lost + received > 0 {
        lost as f64 / (lost + received) as f64 * 100.0
    } else {
        0.0
    };

    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    let sent_kbps =
        current.bytes_sent.saturating_sub(previous.bytes_sent) as f64 * 8.0 / secs / 1000.0;
    let recv_kbps = current
        .bytes_received
        .saturating_sub(previous.bytes_received) as f64
        * 8.0
        / secs
        / 1000.0;

    // RTT-Messungen können einzelne Intervalle aussetzen; der letzte
    // bekannte Wert trägt weiter
    let rtt_ms = current.rtt_ms.or(previous.rtt_ms).unwrap_or(0.0);

    ConnectionQualitySample {
        rtt_ms,
        packet_loss_percent: loss_percent,
        jitter_ms: current.jitter_ms,
        bandwidth_sent_kbps: sent_kbps,
        bandwidth_recv_kbps: recv_kbps,
        tier: QualityTier::classify(rtt_ms, loss_percent),
        sampled_at: Utc::now(),
    }
}

// ============================================================================
// MONITOR LOOP
// ============================================================================

/// Periodischer Sampler über dem aktiven Engine-Transport.
///
/// Läuft nur solange die Session Connected ist; der Besitzer startet
/// und stoppt ihn über die State-Transitionen.
pub struct QualityMonitor {
    handle: Option<JoinHandle<()>>,
}

impl QualityMonitor {
    /// Startet die Sampling-Loop; Samples gehen an `samples`.
    ///
    /// Die Loop endet wenn der Receiver gedroppt wird oder der Engine
    /// keine Stats mehr liefert (Peer Connection geschlossen).
    pub fn start(
        engine: Arc<dyn MediaEngine>,
        samples: mpsc::Sender<ConnectionQualitySample>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut previous: Option<TransportCounters> = None;
            let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Erster Tick feuert sofort und liefert nur die Baseline
            loop {
                ticker.tick().await;
                let mut current = match engine.transport_counters().await {
                    Ok(counters) => counters,
                    Err(EngineError::StatsUnavailable) => continue,
                    Err(e) => {
                        tracing::debug!("Stats sampling stopped: {}", e);
                        break;
                    }
                };
                if current.rtt_ms.is_none() {
                    current.rtt_ms = previous.as_ref().and_then(|p| p.rtt_ms);
                }
                if let Some(prev) = previous.replace(current.clone()) {
                    if current.rtt_ms.is_none() {
                        // Noch keine RTT-Messung, keine Einstufung
                        continue;
                    }
                    let sample = evaluate_sample(&prev, &current, SAMPLE_INTERVAL);
                    if samples.send(sample).await.is_err() {
                        break;
                    }
                }
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for QualityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// NETWORK WATCHER
// ============================================================================

/// OS-gemeldeter Transporttyp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkTransport {
    Ethernet,
    Wifi,
    Cellular,
    Other,
    None,
}

/// Momentaufnahme des aktiven Netzwerks
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkInfo {
    pub transport: NetworkTransport,
    /// Link-Bandbreite laut OS, falls gemeldet
    pub link_kbps: Option<u64>,
}

/// Grobe Netzwerk-Einstufung, unabhängig vom aktiven Call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkQuality {
    Good,
    Moderate,
    Weak,
    Offline,
}

/// Stuft Transporttyp und Link-Bandbreite ein
pub fn classify_network(info: &NetworkInfo) -> NetworkQuality {
    match info.transport {
        NetworkTransport::None => NetworkQuality::Offline,
        NetworkTransport::Ethernet => NetworkQuality::Good,
        NetworkTransport::Wifi => match info.link_kbps {
            Some(kbps) if kbps < 1_000 => NetworkQuality::Weak,
            Some(kbps) if kbps < 5_000 => NetworkQuality::Moderate,
            _ => NetworkQuality::Good,
        },
        NetworkTransport::Cellular => match info.link_kbps {
            Some(kbps) if kbps < 2_000 => NetworkQuality::Weak,
            _ => NetworkQuality::Moderate,
        },
        NetworkTransport::Other => NetworkQuality::Moderate,
    }
}

/// Liefert das aktive Netzwerk und meldet Wechsel.
///
/// Die Plattform-Anbindung ist Sache des Embedders; `changes()` muss
/// bei jedem Wechsel des aktiven Netzwerks ein Event liefern.
#[async_trait]
pub trait NetworkWatcher: Send + Sync {
    fn current(&self) -> NetworkInfo;

    fn changes(&self) -> broadcast::Receiver<NetworkInfo>;
}
