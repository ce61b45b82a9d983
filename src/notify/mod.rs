//! Wakeup Notification
//!
//! Best-effort Push an die Gegenseite beim Call-Aufbau, damit deren
//! Client aufwacht und den eingehenden Call sieht. Ein fehlgeschlagener
//! Dispatch blockiert den Aufbau nie.

use crate::signaling::CallRecord;
use async_trait::async_trait;

/// Zustellung eines Wakeup-Pushes an die Gegenseite
#[async_trait]
pub trait WakeupNotifier: Send + Sync {
    /// Fehler werden vom Aufrufer nur geloggt, nie propagiert
    async fn notify_incoming_call(&self, record: &CallRecord) -> Result<(), String>;
}

/// Standard-Notifier für Deployments ohne Push-Infrastruktur
pub struct NoopNotifier;

#[async_trait]
impl WakeupNotifier for NoopNotifier {
    async fn notify_incoming_call(&self, record: &CallRecord) -> Result<(), String> {
        tracing::debug!("No push transport configured, skipping wakeup for {}", record.callee);
        Ok(())
    }
}
