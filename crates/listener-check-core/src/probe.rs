//! Control-plane probe: metadata, cluster identity, controller identity.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::broker::{BrokerConnector, BrokerNode, OriginatingBroker};
use crate::config::DiagnosticConfig;
use crate::endpoint::BrokerEndpoint;
use crate::error::{classify, BrokerResult, DiagnosticError, Result};
use crate::obs;

const COMPONENT: &str = "admin client";

/// Extra wait past a query's client-side timeout, so the client's own error
/// (for example a transport failure) arrives before our timer gives up.
pub const QUERY_GRACE: Duration = Duration::from_secs(1);

/// Everything the probe learned about the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub originating_broker: OriginatingBroker,
    /// Advertised listeners, as returned in metadata.
    pub advertised: Vec<BrokerNode>,
    pub cluster_id: String,
    pub controller_id: i32,
    /// Set when no advertised listener matches the bootstrap endpoint.
    /// A warning, not a failure: the probe itself still passed.
    pub listener_warning: Option<String>,
}

impl ProbeReport {
    pub fn has_listener_mismatch(&self) -> bool {
        self.listener_warning.is_some()
    }
}

/// Issues the three control-plane queries against one endpoint.
pub struct ClusterProbe;

impl ClusterProbe {
    /// Connect, then query metadata, cluster id and controller id in that
    /// order. Each query gets its own fresh timeout window.
    ///
    /// The admin session is owned by this call and released on every return
    /// path, including early failures.
    pub async fn run(
        connector: &dyn BrokerConnector,
        config: &DiagnosticConfig,
    ) -> Result<ProbeReport> {
        let endpoint = config.endpoint.to_string();

        let admin = connector
            .admin(&config.endpoint)
            .map_err(|e| classify(e, &endpoint, COMPONENT, "create admin client", None))?;
        info!(endpoint = %endpoint, "Created admin client");

        let metadata = bounded(
            &endpoint,
            "metadata query",
            config.metadata_timeout,
            admin.metadata(config.metadata_timeout),
        )
        .await?;
        info!(
            broker_id = metadata.originating_broker.id,
            broker = %metadata.originating_broker.name,
            "Metadata served by originating broker"
        );
        for node in &metadata.brokers {
            info!(broker = %node, "Advertised listener");
        }

        let listener_warning = listener_mismatch(&config.endpoint, &metadata.brokers);
        if listener_warning.is_some() {
            let advertised: Vec<String> = metadata
                .brokers
                .iter()
                .map(|b| format!("{}:{}", b.host, b.port))
                .collect();
            obs::emit_listener_mismatch(&endpoint, &advertised);
        }

        let cluster_id = bounded(
            &endpoint,
            "cluster id query",
            config.cluster_id_timeout,
            admin.cluster_id(config.cluster_id_timeout),
        )
        .await?;
        info!(cluster_id = %cluster_id, "Fetched cluster id");

        let controller_id = bounded(
            &endpoint,
            "controller id query",
            config.controller_id_timeout,
            admin.controller_id(config.controller_id_timeout),
        )
        .await?;
        info!(controller_id = controller_id, "Fetched controller id");

        debug!("Releasing admin client");
        drop(admin);

        Ok(ProbeReport {
            originating_broker: metadata.originating_broker,
            advertised: metadata.brokers,
            cluster_id,
            controller_id,
            listener_warning,
        })
    }
}

/// Run one admin query under its own timeout window and classify failures.
///
/// `timeout` is the bound already handed to the client; the outer wait adds
/// [`QUERY_GRACE`] on top of it.
async fn bounded<T, F>(
    endpoint: &str,
    operation: &str,
    timeout: Duration,
    query: F,
) -> Result<T>
where
    F: Future<Output = BrokerResult<T>>,
{
    match tokio::time::timeout(timeout + QUERY_GRACE, query).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(classify(e, endpoint, COMPONENT, operation, Some(timeout))),
        Err(_) => Err(DiagnosticError::Timeout {
            operation: operation.to_string(),
            timeout,
        }),
    }
}

/// Warning text when none of `advertised` is the endpoint we bootstrapped from.
pub fn listener_mismatch(endpoint: &BrokerEndpoint, advertised: &[BrokerNode]) -> Option<String> {
    if advertised
        .iter()
        .any(|b| endpoint.matches(&b.host, b.port))
    {
        return None;
    }

    Some(format!(
        "None of the advertised listeners on the cluster match the broker ({}) to which you're connecting.\n\
         Producing or consuming with this configuration is likely to fail once the client follows the advertised addresses.\n\
         See https://www.confluent.io/blog/kafka-client-cannot-connect-to-broker-on-aws-on-docker-etc",
        endpoint
    ))
}
