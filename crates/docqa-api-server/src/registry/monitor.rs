use super::registry::InstanceRegistry;
use crate::config::HealthConfig;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct ModelTagsResponse {
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

/// Background prober. Every probe interval it issues a lightweight
/// model-list call (`GET /api/tags`) to each instance, refreshing the
/// live model set and feeding the health state machine.
pub struct HealthMonitor {
    registry: Arc<InstanceRegistry>,
    client: reqwest::Client,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(registry: Arc<InstanceRegistry>, config: &HealthConfig) -> Self {
        Self {
            registry,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            interval: Duration::from_secs(config.probe_interval_s),
        }
    }

    /// Spawn the probe loop. An initial sweep runs immediately so the
    /// pool leaves Degraded as soon as instances respond.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                self.probe_all().await;
            }
        })
    }

    pub async fn probe_all(&self) {
        let instances = self.registry.all();
        let threshold = self.registry.failure_threshold();

        let probes = instances.into_iter().map(|instance| {
            let client = self.client.clone();
            async move {
                let ok = match Self::probe_once(&client, &instance.url).await {
                    Ok(models) => {
                        instance.set_models(models);
                        true
                    }
                    Err(first_err) => {
                        // One retry with a short backoff
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        match Self::probe_once(&client, &instance.url).await {
                            Ok(models) => {
                                instance.set_models(models);
                                true
                            }
                            Err(retry_err) => {
                                warn!(
                                    instance = %instance.name,
                                    first = %first_err,
                                    retry = %retry_err,
                                    "health probe failed"
                                );
                                false
                            }
                        }
                    }
                };

                instance.mark_probed();
                instance.record_outcome(None, None, ok, threshold);
                debug!(instance = %instance.name, ok, "probe complete");
            }
        });

        futures::future::join_all(probes).await;
    }

    async fn probe_once(client: &reqwest::Client, base_url: &str) -> anyhow::Result<Vec<String>> {
        let url = format!("{}/api/tags", base_url.trim_end_matches('/'));
        let response = client.get(&url).send().await?;

        if !response.status().is_success() {
            anyhow::bail!("probe returned {}", response.status());
        }

        let tags: ModelTagsResponse = response.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}
