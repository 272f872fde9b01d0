//! Endpoint latency probing and ranking.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info};

use gxb_core::types::{Endpoint, EndpointHealth};

use crate::session::WitnessConnector;

/// Probes every configured endpoint concurrently.
pub struct EndpointProbe {
    connector: Arc<dyn WitnessConnector>,
    timeout: Duration,
}

impl EndpointProbe {
    pub fn new(connector: Arc<dyn WitnessConnector>, timeout: Duration) -> Self {
        Self { connector, timeout }
    }

    /// Probe all endpoints. The result is in input order; a probe that fails
    /// or exceeds the timeout yields an unreachable entry.
    pub async fn probe_all(&self, endpoints: &[Endpoint]) -> Vec<EndpointHealth> {
        let mut set = JoinSet::new();
        for (index, endpoint) in endpoints.iter().cloned().enumerate() {
            let connector = Arc::clone(&self.connector);
            let timeout = self.timeout;
            set.spawn(async move {
                let latency = match tokio::time::timeout(timeout, connector.probe(&endpoint)).await {
                    Ok(Ok(latency)) => Some(latency),
                    Ok(Err(e)) => {
                        debug!(endpoint = %endpoint, error = %e, "probe failed");
                        None
                    }
                    Err(_) => {
                        debug!(endpoint = %endpoint, timeout_ms = timeout.as_millis() as u64, "probe timed out");
                        None
                    }
                };
                (index, EndpointHealth { endpoint, latency })
            });
        }

        let mut results: Vec<Option<EndpointHealth>> = vec![None; endpoints.len()];
        while let Some(joined) = set.join_next().await {
            if let Ok((index, health)) = joined {
                results[index] = Some(health);
            }
        }

        // A panicked probe task counts as unreachable.
        results
            .into_iter()
            .zip(endpoints)
            .map(|(health, endpoint)| {
                health.unwrap_or_else(|| EndpointHealth::unreachable(endpoint.clone()))
            })
            .collect()
    }

    /// Probe and rank in one step.
    pub async fn ranked(&self, endpoints: &[Endpoint]) -> Vec<Endpoint> {
        let health = self.probe_all(endpoints).await;
        for h in &health {
            match h.latency {
                Some(latency) => {
                    info!(endpoint = %h.endpoint, latency_ms = latency.as_millis() as u64, "endpoint reachable")
                }
                None => info!(endpoint = %h.endpoint, "endpoint unreachable"),
            }
        }
        rank_endpoints(&health)
    }
}

/// Drop unreachable endpoints and order the rest by ascending latency.
///
/// The sort is stable, so equal latencies keep their configured order.
pub fn rank_endpoints(health: &[EndpointHealth]) -> Vec<Endpoint> {
    let mut reachable: Vec<(&Endpoint, Duration)> = health
        .iter()
        .filter_map(|h| h.latency.map(|l| (&h.endpoint, l)))
        .collect();
    reachable.sort_by_key(|(_, latency)| *latency);
    reachable.into_iter().map(|(e, _)| e.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gxb_core::error::{ConnectionError, GxbError};
    use std::collections::HashMap;

    use crate::session::{StatusSink, WitnessSession};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    /// Answers probes with a fixed latency per endpoint; missing means down.
    struct FixedLatency(HashMap<String, Duration>);

    #[async_trait]
    impl WitnessConnector for FixedLatency {
        async fn probe(&self, endpoint: &Endpoint) -> Result<Duration, GxbError> {
            match self.0.get(&endpoint.url) {
                Some(latency) => {
                    tokio::time::sleep(*latency).await;
                    Ok(*latency)
                }
                None => Err(ConnectionError::ProbeTimeout(endpoint.url.clone()).into()),
            }
        }

        async fn connect(
            &self,
            endpoint: &Endpoint,
            _status: StatusSink,
        ) -> Result<Arc<dyn WitnessSession>, GxbError> {
            Err(ConnectionError::ConnectFailed {
                endpoint: endpoint.url.clone(),
                reason: "probe-only connector".into(),
            }
            .into())
        }
    }

    #[test]
    fn ranks_by_latency_and_drops_unreachable() {
        let health = vec![
            EndpointHealth::reachable("A".into(), ms(50)),
            EndpointHealth::unreachable("B".into()),
            EndpointHealth::reachable("C".into(), ms(10)),
        ];
        assert_eq!(rank_endpoints(&health), vec![Endpoint::from("C"), Endpoint::from("A")]);
    }

    #[test]
    fn ties_keep_configured_order() {
        let health = vec![
            EndpointHealth::reachable("x".into(), ms(20)),
            EndpointHealth::reachable("y".into(), ms(5)),
            EndpointHealth::reachable("z".into(), ms(20)),
        ];
        assert_eq!(
            rank_endpoints(&health),
            vec![Endpoint::from("y"), Endpoint::from("x"), Endpoint::from("z")]
        );
    }

    #[test]
    fn nothing_reachable_ranks_empty() {
        let health = vec![EndpointHealth::unreachable("a".into())];
        assert!(rank_endpoints(&health).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_all_preserves_input_order() {
        let connector = FixedLatency(HashMap::from([
            ("A".to_string(), ms(50)),
            ("C".to_string(), ms(10)),
        ]));
        let probe = EndpointProbe::new(Arc::new(connector), ms(1_000));
        let endpoints: Vec<Endpoint> = vec!["A".into(), "B".into(), "C".into()];

        let health = probe.probe_all(&endpoints).await;
        assert_eq!(health.len(), 3);
        assert_eq!(health[0], EndpointHealth::reachable("A".into(), ms(50)));
        assert!(!health[1].is_reachable());
        assert_eq!(health[2].endpoint, Endpoint::from("C"));

        assert_eq!(probe.ranked(&endpoints).await, vec![Endpoint::from("C"), Endpoint::from("A")]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_counts_as_unreachable() {
        let connector = FixedLatency(HashMap::from([
            ("slow".to_string(), ms(10_000)),
            ("fast".to_string(), ms(10)),
        ]));
        let probe = EndpointProbe::new(Arc::new(connector), ms(500));
        let endpoints: Vec<Endpoint> = vec!["slow".into(), "fast".into()];

        let health = probe.probe_all(&endpoints).await;
        assert!(!health[0].is_reachable());
        assert!(health[1].is_reachable());
    }
}
