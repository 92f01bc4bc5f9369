// SPDX-License-Identifier: GPL-3.0-or-later

//! Periodic provider health probing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use harmony_config::ProviderHealthConfig;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::gateway::{Provider, ProviderGateway};
use crate::models::ProbeStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallHealth {
    Ok,
    Degraded,
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub overall: OverallHealth,
    pub metadata: ProbeStatus,
    pub peer: ProbeStatus,
    pub checked_at: DateTime<Utc>,
}

impl HealthSnapshot {
    fn unknown() -> Self {
        Self {
            overall: OverallHealth::Degraded,
            metadata: ProbeStatus::Degraded,
            peer: ProbeStatus::Degraded,
            checked_at: Utc::now(),
        }
    }
}

pub struct ProviderHealthMonitor {
    gateway: Arc<ProviderGateway>,
    config: ProviderHealthConfig,
    tx: watch::Sender<HealthSnapshot>,
}

impl ProviderHealthMonitor {
    pub fn new(gateway: Arc<ProviderGateway>, config: ProviderHealthConfig) -> Self {
        let (tx, _) = watch::channel(HealthSnapshot::unknown());
        Self {
            gateway,
            config,
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthSnapshot> {
        self.tx.subscribe()
    }

    /// Probe both providers once and publish the verdict.
    pub async fn probe_once(&self) -> HealthSnapshot {
        let metadata = probe(&self.gateway, Provider::Metadata).await;
        let peer = probe(&self.gateway, Provider::Peer).await;

        let overall = overall_verdict(&self.config.critical, metadata, peer);
        let snapshot = HealthSnapshot {
            overall,
            metadata,
            peer,
            checked_at: Utc::now(),
        };

        debug!(
            target: "providers",
            overall = ?snapshot.overall,
            metadata = ?snapshot.metadata,
            peer = ?snapshot.peer,
            "provider health probed"
        );
        let _ = self.tx.send(snapshot.clone());
        snapshot
    }

    /// Run probes on the configured interval until `stop` flips to true.
    pub fn start(self: Arc<Self>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval = std::time::Duration::from_secs(self.config.interval_s.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.probe_once().await;
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            debug!(target: "providers", "health monitor stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

async fn probe(gateway: &ProviderGateway, provider: Provider) -> ProbeStatus {
    match gateway.check_health(provider).await {
        Ok(health) => health.status,
        Err(error) => {
            warn!(
                target: "providers",
                provider = provider.as_str(),
                %error,
                "health probe failed"
            );
            ProbeStatus::Down
        }
    }
}

/// An empty critical list means every provider is critical.
fn overall_verdict(critical: &[String], metadata: ProbeStatus, peer: ProbeStatus) -> OverallHealth {
    let is_critical = |name: &str| critical.is_empty() || critical.iter().any(|c| c == name);

    let down = (metadata == ProbeStatus::Down && is_critical("metadata"))
        || (peer == ProbeStatus::Down && is_critical("peer"));
    if down {
        return OverallHealth::Down;
    }
    if metadata != ProbeStatus::Ok || peer != ProbeStatus::Ok {
        return OverallHealth::Degraded;
    }
    OverallHealth::Ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_critical_list_treats_all_as_critical() {
        assert_eq!(
            overall_verdict(&[], ProbeStatus::Ok, ProbeStatus::Down),
            OverallHealth::Down
        );
        assert_eq!(
            overall_verdict(&[], ProbeStatus::Down, ProbeStatus::Ok),
            OverallHealth::Down
        );
    }

    #[test]
    fn non_critical_outage_is_degraded() {
        let critical = vec!["metadata".to_string()];
        assert_eq!(
            overall_verdict(&critical, ProbeStatus::Ok, ProbeStatus::Down),
            OverallHealth::Degraded
        );
        assert_eq!(
            overall_verdict(&critical, ProbeStatus::Down, ProbeStatus::Ok),
            OverallHealth::Down
        );
    }

    #[test]
    fn degraded_probe_degrades_overall() {
        assert_eq!(
            overall_verdict(&[], ProbeStatus::Degraded, ProbeStatus::Ok),
            OverallHealth::Degraded
        );
        assert_eq!(
            overall_verdict(&[], ProbeStatus::Ok, ProbeStatus::Ok),
            OverallHealth::Ok
        );
    }
}
