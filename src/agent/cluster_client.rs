//! Database administrative API client
//!
//! Form-encoded HTTP against the management port every node exposes, with
//! one shared administrative credential. Rebalance and failover are
//! asynchronous on the server side; both are bracketed by bounded waits on
//! the progress endpoint so a call returns only once the cluster has
//! settled, or times out with a typed error.

use crate::common::config::ClusterApiConfig;
use crate::common::{poll_until, Error, Result};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct RebalanceStatus {
    status: String,
}

#[derive(Debug, Deserialize)]
struct PoolNode {
    #[serde(rename = "otpNode")]
    otp_node: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PoolInfo {
    #[serde(default)]
    nodes: Vec<PoolNode>,
}

/// Client for one cluster's administrative endpoint.
#[derive(Clone)]
pub struct ClusterApi {
    client: reqwest::Client,
    config: ClusterApiConfig,
}

impl ClusterApi {
    pub fn new(config: ClusterApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, host: &str, path: &str) -> String {
        format!("http://{}:{}{}", host, self.config.port, path)
    }

    async fn get(&self, host: &str, path: &str) -> Result<reqwest::Response> {
        let endpoint = self.endpoint(host, path);
        let resp = self
            .client
            .get(&endpoint)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::ClusterApi {
                endpoint,
                status: resp.status().as_u16(),
            });
        }
        Ok(resp)
    }

    async fn post_form(
        &self,
        host: &str,
        path: &str,
        form: &[(&str, String)],
    ) -> Result<reqwest::Response> {
        let endpoint = self.endpoint(host, path);
        tracing::debug!("POST {}", endpoint);
        let resp = self
            .client
            .post(&endpoint)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .form(form)
            .send()
            .await?;
        Ok(resp)
    }

    /// The cluster's internal name for `node_host`, from the master's node
    /// listing.
    async fn otp_node(&self, live_host: &str, node_host: &str) -> Result<String> {
        let list = self.otp_node_list(live_host).await?;
        list.iter()
            .find(|otp| otp.contains(node_host))
            .cloned()
            .ok_or_else(|| {
                Error::Internal(format!("no otp node with address {} in {:?}", node_host, list))
            })
    }

    async fn otp_node_list(&self, live_host: &str) -> Result<Vec<String>> {
        let info: PoolInfo = self.get(live_host, "/pools/default").await?.json().await?;
        Ok(info
            .nodes
            .into_iter()
            .filter_map(|node| node.otp_node)
            .collect())
    }

    async fn rebalance_running(&self, master_host: &str) -> Result<bool> {
        let status: RebalanceStatus = self
            .get(master_host, "/pools/default/rebalanceProgress")
            .await?
            .json()
            .await?;
        tracing::debug!("rebalance status: {}", status.status);
        Ok(status.status == "running")
    }

    /// Wait until no rebalance/failover is in flight, bounded by the
    /// configured progress timeout.
    async fn wait_settled(&self, master_host: &str) -> Result<()> {
        poll_until(
            self.config.progress_poll(),
            self.config.progress_timeout(),
            "rebalance",
            || async move { Ok(!self.rebalance_running(master_host).await?) },
        )
        .await
    }

    /// Add `node_host` to the cluster under `master_host`.
    ///
    /// Returns `true` when the node was already a member; the server reports
    /// that as a failure but it is an already-satisfied precondition here.
    pub async fn add_node(&self, master_host: &str, node_host: &str) -> Result<bool> {
        let form = [
            ("hostname", node_host.to_string()),
            ("user", self.config.username.clone()),
            ("password", self.config.password.clone()),
            ("services", self.config.services.clone()),
        ];
        let resp = self.post_form(master_host, "/controller/addNode", &form).await?;

        if resp.status().is_success() {
            return Ok(false);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        if body.contains("Node is already part of cluster") {
            return Ok(true);
        }
        tracing::warn!("addNode failed ({}): {}", status, body);
        Err(Error::ClusterApi {
            endpoint: self.endpoint(master_host, "/controller/addNode"),
            status,
        })
    }

    /// Rebalance the cluster so `node_host` carries its share of data.
    ///
    /// Waits out any in-flight operation, triggers the rebalance across the
    /// full known-node set, then waits for it to settle.
    pub async fn rebalance(&self, master_host: &str, node_host: &str) -> Result<()> {
        self.wait_settled(master_host).await?;

        let known = self.otp_node_list(master_host).await?.join(",");
        tracing::info!("rebalancing {} into cluster of [{}]", node_host, known);
        let form = [
            ("ejectedNodes", String::new()),
            ("knownNodes", known),
        ];
        let resp = self
            .post_form(master_host, "/controller/rebalance", &form)
            .await?;
        if !resp.status().is_success() {
            return Err(Error::ClusterApi {
                endpoint: self.endpoint(master_host, "/controller/rebalance"),
                status: resp.status().as_u16(),
            });
        }

        self.wait_settled(master_host).await
    }

    /// Request delta recovery for a node rejoining after a failover.
    pub async fn recover_node(&self, master_host: &str, node_host: &str) -> Result<()> {
        let otp = self.otp_node(master_host, node_host).await?;
        let form = [
            ("otpNode", otp),
            ("recoveryType", "delta".to_string()),
        ];
        let resp = self
            .post_form(master_host, "/controller/setRecoveryType", &form)
            .await?;
        if !resp.status().is_success() {
            return Err(Error::ClusterApi {
                endpoint: self.endpoint(master_host, "/controller/setRecoveryType"),
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }

    /// Gracefully fail `node_host` out of the cluster.
    pub async fn graceful_failover(&self, master_host: &str, node_host: &str) -> Result<()> {
        self.wait_settled(master_host).await?;

        let otp = self.otp_node(master_host, node_host).await?;
        tracing::info!("graceful failover of {}", otp);
        let form = [("otpNode", otp)];
        let resp = self
            .post_form(master_host, "/controller/startGracefulFailover", &form)
            .await?;
        if !resp.status().is_success() {
            return Err(Error::ClusterApi {
                endpoint: self.endpoint(master_host, "/controller/startGracefulFailover"),
                status: resp.status().as_u16(),
            });
        }

        self.wait_settled(master_host).await
    }

    /// Enable automatic failover with the given timeout.
    pub async fn set_auto_failover(&self, master_host: &str, timeout_secs: u64) -> Result<()> {
        let form = [
            ("enabled", "true".to_string()),
            ("timeout", timeout_secs.to_string()),
        ];
        let resp = self
            .post_form(master_host, "/settings/autoFailover", &form)
            .await?;
        if !resp.status().is_success() {
            return Err(Error::ClusterApi {
                endpoint: self.endpoint(master_host, "/settings/autoFailover"),
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }
}
