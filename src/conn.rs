//! Connection management
//!
//! One owned handle per database endpoint. Connecting probes replica-set
//! status first: replica-set members are bound by set name with primary
//! read preference, standalone nodes directly. The handle holds at most one
//! live client; reconnect always tears the old transport down before
//! opening a new one, and retries forever at a fixed interval, because the
//! alternative to eventually reconnecting is a silent replication stall.

use crate::config::{MongoEndpoint, SyncOptions};
use crate::error::{Result, SyncError};
use crate::introspect;
use mongodb::bson::doc;
use mongodb::options::{
    Acknowledgment, ClientOptions, ReadPreference, SelectionCriteria, WriteConcern,
};
use mongodb::Client;
use tokio::time::sleep;
use tracing::{error, info};

/// Owned handle to one database endpoint.
pub struct MongoConn {
    endpoint: MongoEndpoint,
    options: SyncOptions,
    client: Option<Client>,
}

impl MongoConn {
    /// Create a disconnected handle for a validated endpoint.
    pub fn new(endpoint: MongoEndpoint, options: SyncOptions) -> Result<Self> {
        endpoint.validate()?;
        Ok(Self {
            endpoint,
            options,
            client: None,
        })
    }

    /// The endpoint this handle is bound to.
    pub fn endpoint(&self) -> &MongoEndpoint {
        &self.endpoint
    }

    /// The live client, or [`SyncError::NotConnected`].
    pub fn client(&self) -> Result<&Client> {
        self.client.as_ref().ok_or(SyncError::NotConnected)
    }

    /// Whether a transport is currently open.
    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Connect to the endpoint, detecting replica-set topology.
    ///
    /// Fails fast on unreachable hosts (bounded selection timeout) and on
    /// authentication failures. Verifies liveness with a `ping` before the
    /// handle is considered connected.
    pub async fn connect(&mut self) -> Result<()> {
        self.close().await;

        let set_name = self.probe_replica_set().await?;
        let mut options = self.base_options().await?;
        match set_name {
            Some(name) => {
                info!("Binding to replica set '{}' at {}", name, self.endpoint.hosts.join(","));
                options.repl_set_name = Some(name);
                options.direct_connection = Some(false);
                options.selection_criteria =
                    Some(SelectionCriteria::ReadPreference(ReadPreference::Primary));
            }
            None => {
                info!("Binding directly to {}", self.endpoint.hosts.join(","));
                if self.endpoint.hosts.len() == 1 {
                    options.direct_connection = Some(true);
                }
            }
        }

        let client = Client::with_options(options)?;
        if let Err(e) = client.database("admin").run_command(doc! { "ping": 1 }).await {
            client.shutdown().await;
            return Err(e.into());
        }

        self.client = Some(client);
        Ok(())
    }

    /// Close, connect, and verify liveness until success.
    ///
    /// This loop has no exit other than success. Failures are logged and
    /// followed by a fixed wait.
    pub async fn reconnect(&mut self) {
        loop {
            self.close().await;
            match self.connect().await {
                Ok(()) => {
                    info!("Reconnected to {}", self.endpoint.hosts.join(","));
                    return;
                }
                Err(e) => {
                    error!("Reconnect failed: {}", e);
                    sleep(self.options.reconnect_interval).await;
                }
            }
        }
    }

    /// Close the connection. Idempotent, safe on a never-opened handle.
    pub async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            client.shutdown().await;
        }
    }

    /// Probe `replSetGetStatus` through a transient client.
    async fn probe_replica_set(&self) -> Result<Option<String>> {
        let options = self.base_options().await?;
        let probe = Client::with_options(options)?;
        let set_name = introspect::replica_set_name(&probe).await;
        probe.shutdown().await;
        set_name
    }

    /// Driver options shared by the probe and the bound client.
    async fn base_options(&self) -> Result<ClientOptions> {
        let mut options = ClientOptions::parse(self.endpoint.uri()).await?;
        options.server_selection_timeout = Some(self.options.connect_timeout);
        options.connect_timeout = Some(self.options.connect_timeout);
        options.write_concern = Some(
            WriteConcern::builder()
                .w(Acknowledgment::Nodes(self.endpoint.write_acks))
                .build(),
        );
        Ok(options)
    }
}

impl std::fmt::Debug for MongoConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoConn")
            .field("hosts", &self.endpoint.hosts)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> MongoConn {
        MongoConn::new(
            MongoEndpoint::single("localhost:27017"),
            SyncOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_new_validates_endpoint() {
        let bad = MongoEndpoint::new(vec![]);
        assert!(MongoConn::new(bad, SyncOptions::default()).is_err());
    }

    #[test]
    fn test_unconnected_handle_has_no_client() {
        let conn = conn();
        assert!(!conn.is_connected());
        assert!(matches!(conn.client(), Err(SyncError::NotConnected)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_on_unopened_handle() {
        let mut conn = conn();
        conn.close().await;
        conn.close().await;
        assert!(!conn.is_connected());
    }
}
