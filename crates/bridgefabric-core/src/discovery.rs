//! Discovery Client: locates a specific, verified-live instance from a
//! nominal endpoint, then dispatches a payload directly to it.
//!
//! Grounded in the teacher's own use of `reqwest` for outbound HTTP
//! (`incoming_webhook.rs`'s dispatch to external webhook URLs), adapted to
//! loopback-only targets and a fan-out range scan per §4.F.

use std::net::Ipv4Addr;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::identity::InstanceRecord;

const RANGE_SCAN_TIMEOUT: Duration = Duration::from_millis(500);
const VERIFY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstancesResponse {
    instances: Vec<InstanceRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    instance_id: String,
}

#[derive(Debug, Serialize)]
struct SendRequestBody {
    content: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("no instance responded on the nominal endpoint or the range scan")]
    NoResponders,
    #[error("instance {id} was not found among verified-live instances")]
    InstanceNotVerified { id: String },
    #[error("dispatch to instance {id} failed: {source}")]
    DispatchFailed {
        id: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("could not build HTTP client: {0}")]
    ClientBuildFailed(#[source] reqwest::Error),
}

/// A loopback port range to fall back to when the nominal endpoint doesn't
/// answer `/instances`.
#[derive(Debug, Clone, Copy)]
pub struct PortRange {
    pub base: u16,
    pub size: u16,
}

/// Fetch the set of verified-live instances, starting from `nominal_port`
/// and falling back to a parallel scan of `range` if that port is
/// unreachable.
pub async fn discover(nominal_port: u16, range: PortRange) -> Result<Vec<InstanceRecord>, DiscoveryError> {
    let records = match fetch_instances(nominal_port).await {
        Some(records) => records,
        None => scan_for_instances(range).await.ok_or(DiscoveryError::NoResponders)?,
    };

    let verify_client = reqwest::Client::builder()
        .timeout(VERIFY_TIMEOUT)
        .build()
        .map_err(DiscoveryError::ClientBuildFailed)?;

    let verifications = join_all(
        records
            .into_iter()
            .map(|record| verify_record(&verify_client, record)),
    )
    .await;

    Ok(verifications.into_iter().flatten().collect())
}

/// Locate `id` among the verified-live instances, then POST `content`
/// directly to its own port.
pub async fn dispatch(
    nominal_port: u16,
    range: PortRange,
    id: &str,
    content: String,
) -> Result<(), DiscoveryError> {
    let verified = discover(nominal_port, range).await?;
    let target = verified
        .into_iter()
        .find(|r| r.id == id)
        .ok_or_else(|| DiscoveryError::InstanceNotVerified { id: id.to_string() })?;

    let client = reqwest::Client::builder()
        .timeout(VERIFY_TIMEOUT)
        .build()
        .map_err(DiscoveryError::ClientBuildFailed)?;

    client
        .post(format!(
            "http://{}:{}/instance/{}/send",
            Ipv4Addr::LOCALHOST,
            target.port,
            target.id
        ))
        .json(&SendRequestBody { content })
        .send()
        .await
        .and_then(|resp| resp.error_for_status())
        .map_err(|e| DiscoveryError::DispatchFailed {
            id: id.to_string(),
            source: e,
        })?;

    Ok(())
}

async fn fetch_instances(port: u16) -> Option<Vec<InstanceRecord>> {
    let client = reqwest::Client::builder()
        .timeout(RANGE_SCAN_TIMEOUT)
        .build()
        .ok()?;
    let resp = client
        .get(format!("http://{}:{}/instances", Ipv4Addr::LOCALHOST, port))
        .send()
        .await
        .ok()?;
    resp.json::<InstancesResponse>().await.ok().map(|r| r.instances)
}

/// Parallel fan-out across the reserved range, probing `/health` with a
/// short timeout. The first responder's view of the registry wins; the
/// fabric itself self-heals any divergence through the heartbeat loop.
async fn scan_for_instances(range: PortRange) -> Option<Vec<InstanceRecord>> {
    let client = reqwest::Client::builder()
        .timeout(RANGE_SCAN_TIMEOUT)
        .build()
        .ok()?;

    let probes = (0..range.size).map(|offset| {
        let client = client.clone();
        let port = range.base.saturating_add(offset);
        async move {
            let resp = client
                .get(format!("http://{}:{}/health", Ipv4Addr::LOCALHOST, port))
                .send()
                .await
                .ok()?;
            if resp.status().is_success() {
                Some(port)
            } else {
                None
            }
        }
    });

    let responder_port = join_all(probes).await.into_iter().flatten().next()?;
    fetch_instances(responder_port).await
}

/// Probe a record's own port; accept only if it answers and its reported
/// id matches.
async fn verify_record(client: &reqwest::Client, record: InstanceRecord) -> Option<InstanceRecord> {
    let resp = client
        .get(format!(
            "http://{}:{}/health",
            Ipv4Addr::LOCALHOST,
            record.port
        ))
        .send()
        .await
        .ok()?;
    let health: HealthResponse = resp.json().await.ok()?;
    if health.instance_id == record.id {
        Some(record)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range_offsets_saturate_instead_of_wrapping() {
        let range = PortRange {
            base: u16::MAX - 1,
            size: 10,
        };
        for offset in 0..range.size {
            let _ = range.base.saturating_add(offset);
        }
    }
}
