//! Periodic refresh of the pool's host list from the cluster's own tables.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use kestrel_cql::value::Unmarshal;
use kestrel_cql::Consistency;
use tracing::{debug, warn};

use super::HostInfo;
use crate::client::session_builder::SessionConfig;
use crate::errors::QueryError;
use crate::network::{addr_host, ConnectionPool};
use crate::statement::query::Query;

const LOCAL_QUERY: &str = "SELECT data_center, rack, host_id, tokens FROM system.local";
const PEERS_QUERY: &str = "SELECT peer, data_center, rack, host_id, tokens FROM system.peers";

/// Options of host discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Only nodes of this data center are used. The node answering the
    /// query is always kept.
    pub dc_filter: Option<String>,
    /// Only nodes of this rack are used.
    pub rack_filter: Option<String>,
    /// Interval between refreshes.
    pub sleep: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            dc_filter: None,
            rack_filter: None,
            sleep: Duration::from_secs(30),
        }
    }
}

/// Reads the ring from `system.local` and `system.peers` and keeps the pool
/// connected to the nodes it lists.
pub struct RingDescriber {
    pool: Arc<dyn ConnectionPool>,
    consistency: Consistency,
    dc_filter: Option<String>,
    rack_filter: Option<String>,
    previous: StdMutex<Vec<HostInfo>>,
}

impl RingDescriber {
    /// Creates a describer reading through connections of `pool`.
    pub fn new(pool: Arc<dyn ConnectionPool>, config: &SessionConfig) -> Self {
        RingDescriber {
            pool,
            consistency: config.consistency,
            dc_filter: config.discovery.dc_filter.clone(),
            rack_filter: config.discovery.rack_filter.clone(),
            previous: StdMutex::new(Vec::new()),
        }
    }

    fn matches_filter(&self, host: &HostInfo) -> bool {
        let dc_matches = self
            .dc_filter
            .as_ref()
            .is_none_or(|dc| dc.is_empty() || *dc == host.data_center);
        let rack_matches = self
            .rack_filter
            .as_ref()
            .is_none_or(|rack| rack.is_empty() || *rack == host.rack);
        dc_matches && rack_matches
    }

    /// Lists the nodes of the ring. The node queried comes first.
    ///
    /// Returns the previous list when the pool has no connection to ask.
    pub async fn get_hosts(&self) -> Result<Vec<HostInfo>, QueryError> {
        let Some(connection) = self.pool.pick(None).await else {
            return Ok(self.previous.lock().unwrap().clone());
        };

        let local_query = Query::new(LOCAL_QUERY).consistency(self.consistency);
        let mut iter = connection.execute_query(&local_query).await?;
        let mut local = HostInfo::new(addr_host(connection.address()));
        iter.scan(&mut [
            &mut local.data_center as &mut dyn Unmarshal,
            &mut local.rack,
            &mut local.host_id,
            &mut local.tokens,
        ])
        .await;
        iter.close()?;

        let mut hosts = vec![local];

        let peers_query = Query::new(PEERS_QUERY).consistency(self.consistency);
        let mut iter = connection.execute_query(&peers_query).await?;
        let mut peer = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        let mut host = HostInfo::default();
        while iter
            .scan(&mut [
                &mut peer as &mut dyn Unmarshal,
                &mut host.data_center,
                &mut host.rack,
                &mut host.host_id,
                &mut host.tokens,
            ])
            .await
        {
            host.peer = peer.to_string();
            if self.matches_filter(&host) {
                hosts.push(std::mem::take(&mut host));
            }
        }
        iter.close()?;

        *self.previous.lock().unwrap() = hosts.clone();
        Ok(hosts)
    }

    /// Refreshes the pool every `sleep` until the returned future is dropped.
    pub async fn run(self, sleep: Duration) {
        let sleep = if sleep.is_zero() {
            DiscoveryConfig::default().sleep
        } else {
            sleep
        };
        loop {
            match self.get_hosts().await {
                Ok(hosts) => {
                    debug!("Discovered {} hosts", hosts.len());
                    self.pool.set_hosts(hosts).await;
                }
                Err(err) => warn!("Unable to get ring topology: {}", err),
            }
            tokio::time::sleep(sleep).await;
        }
    }
}
