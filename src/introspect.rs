//! Replica-set introspection
//!
//! Queries `replSetGetStatus` and `buildInfo` to discover the set name, the
//! current primary, its last-applied optime, and the server version. The
//! parsing is split out into pure helpers over the status document so the
//! two optime wire formats (bare timestamp for protocolVersion 0, `{ts, t}`
//! document for protocolVersion 1) stay unit-testable.

use crate::checkpoint::Optime;
use crate::error::{Result, SyncError};
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::ErrorKind;
use mongodb::options::ClientOptions;
use mongodb::Client;
use std::time::Duration;
use tracing::info;

/// Identity of the current replica-set primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryInfo {
    pub host: String,
    pub port: u16,
    pub set_name: String,
}

/// Fetch the raw `replSetGetStatus` document.
pub async fn replica_set_status(client: &Client) -> Result<Document> {
    let status = client
        .database("admin")
        .run_command(doc! { "replSetGetStatus": 1 })
        .await?;
    Ok(status)
}

/// Get the replica set name, or `None` if the node is not part of one.
///
/// "Not a replica set" is a recognized outcome, reported by the server as a
/// command failure; transport errors still propagate.
pub async fn replica_set_name(client: &Client) -> Result<Option<String>> {
    match replica_set_status(client).await {
        Ok(status) => Ok(status.get_str("set").ok().map(String::from)),
        Err(SyncError::Mongo(e)) if matches!(&*e.kind, ErrorKind::Command(_)) => {
            info!("Node is not a replica set member");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Get host, port, and set name of the current primary.
pub async fn primary(client: &Client) -> Result<PrimaryInfo> {
    let status = replica_set_status(client).await?;
    parse_primary(&status)
}

/// Get the primary's last-applied oplog position.
pub async fn last_optime(client: &Client) -> Result<Optime> {
    let status = replica_set_status(client).await?;
    parse_primary_optime(&status)
}

/// Get the server version string from a live handle.
pub async fn server_version(client: &Client) -> Result<String> {
    let info = client
        .database("admin")
        .run_command(doc! { "buildInfo": 1 })
        .await?;
    Ok(info
        .get_str("version")
        .map_err(|_| SyncError::introspection("buildInfo reply without version"))?
        .to_string())
}

/// Get the server version from an address, opening a transient client.
pub async fn server_version_at(addr: &str, timeout: Duration) -> Result<String> {
    let mut options = ClientOptions::parse(format!("mongodb://{}", addr)).await?;
    options.server_selection_timeout = Some(timeout);
    options.connect_timeout = Some(timeout);
    options.direct_connection = Some(true);
    let client = Client::with_options(options)?;
    let version = server_version(&client).await;
    client.shutdown().await;
    version
}

/// Find the PRIMARY member in a status document.
pub fn parse_primary(status: &Document) -> Result<PrimaryInfo> {
    let set_name = status
        .get_str("set")
        .map_err(|_| SyncError::introspection("status without set name"))?
        .to_string();
    let member = primary_member(status)?;
    let name = member
        .get_str("name")
        .map_err(|_| SyncError::introspection("primary member without name"))?;
    let (host, port) = parse_hostport(name)?;
    Ok(PrimaryInfo {
        host,
        port,
        set_name,
    })
}

/// Extract the primary's optime from a status document.
///
/// Handles both wire formats: a bare timestamp, or a `{ts, t}` document
/// whose term is preserved for term-aware resumption.
pub fn parse_primary_optime(status: &Document) -> Result<Optime> {
    let member = primary_member(status)?;
    let optime = member
        .get("optime")
        .ok_or_else(|| SyncError::introspection("primary member without optime"))?;
    parse_optime(optime)
}

/// Parse one optime value in either wire format.
pub fn parse_optime(value: &Bson) -> Result<Optime> {
    match value {
        Bson::Timestamp(ts) => Ok(Optime::new(*ts)),
        Bson::Document(d) => {
            let ts = match d.get("ts") {
                Some(Bson::Timestamp(ts)) => *ts,
                _ => return Err(SyncError::introspection("optime document without ts")),
            };
            match d.get("t").and_then(Bson::as_i64) {
                Some(term) => Ok(Optime::with_term(ts, term)),
                None => Ok(Optime::new(ts)),
            }
        }
        _ => Err(SyncError::introspection("unrecognized optime format")),
    }
}

/// Compare dotted version strings numerically.
///
/// Missing components count as zero, so `"3.2"` and `"3.2.0"` compare
/// equal.
pub fn version_at_least(version: &str, minimum: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| {
                part.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let mut lhs = parse(version);
    let mut rhs = parse(minimum);
    let len = lhs.len().max(rhs.len());
    lhs.resize(len, 0);
    rhs.resize(len, 0);
    lhs >= rhs
}

/// Parse a `host:port` string.
pub fn parse_hostport(addr: &str) -> Result<(String, u16)> {
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse()
                .map_err(|_| SyncError::introspection(format!("invalid port in '{}'", addr)))?;
            Ok((host.to_string(), port))
        }
        _ => Err(SyncError::introspection(format!(
            "invalid host:port '{}'",
            addr
        ))),
    }
}

fn primary_member(status: &Document) -> Result<&Document> {
    let members = status
        .get_array("members")
        .map_err(|_| SyncError::introspection("status without members"))?;
    members
        .iter()
        .filter_map(Bson::as_document)
        .find(|m| m.get_str("stateStr") == Ok("PRIMARY"))
        .ok_or_else(|| SyncError::introspection("no primary in replica set"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::Timestamp;

    fn status_with_primary(optime: Bson) -> Document {
        doc! {
            "set": "rs0",
            "members": [
                {
                    "name": "replica-a:27017",
                    "stateStr": "SECONDARY",
                },
                {
                    "name": "replica-b:27018",
                    "stateStr": "PRIMARY",
                    "optime": optime,
                },
            ],
            "ok": 1.0,
        }
    }

    #[test]
    fn test_parse_primary() {
        let status = status_with_primary(Bson::Timestamp(Timestamp {
            time: 10,
            increment: 1,
        }));
        let primary = parse_primary(&status).unwrap();
        assert_eq!(
            primary,
            PrimaryInfo {
                host: "replica-b".into(),
                port: 27018,
                set_name: "rs0".into(),
            }
        );
    }

    #[test]
    fn test_parse_primary_none() {
        let status = doc! {
            "set": "rs0",
            "members": [{ "name": "a:1", "stateStr": "SECONDARY" }],
        };
        let err = parse_primary(&status).unwrap_err();
        assert!(err.to_string().contains("no primary"));
    }

    #[test]
    fn test_parse_optime_bare_timestamp() {
        let ts = Timestamp {
            time: 100,
            increment: 2,
        };
        let status = status_with_primary(Bson::Timestamp(ts));
        let optime = parse_primary_optime(&status).unwrap();
        assert_eq!(optime, Optime::new(ts));
    }

    #[test]
    fn test_parse_optime_structured() {
        let ts = Timestamp {
            time: 100,
            increment: 2,
        };
        let status = status_with_primary(Bson::Document(doc! { "ts": ts, "t": 4_i64 }));
        let optime = parse_primary_optime(&status).unwrap();
        assert_eq!(optime, Optime::with_term(ts, 4));
    }

    #[test]
    fn test_parse_optime_rejects_garbage() {
        assert!(parse_optime(&Bson::Int32(5)).is_err());
        assert!(parse_optime(&Bson::Document(doc! { "t": 4_i64 })).is_err());
    }

    #[test]
    fn test_version_at_least() {
        assert!(version_at_least("3.2.0", "3.2.0"));
        assert!(version_at_least("3.10.1", "3.2.0"));
        assert!(version_at_least("4.0", "3.6.9"));
        assert!(!version_at_least("3.1.9", "3.2.0"));
        assert!(version_at_least("4.0.0-rc1", "4.0.0"));
    }

    #[test]
    fn test_version_at_least_pads_missing_components() {
        assert!(version_at_least("3.2", "3.2.0"));
        assert!(version_at_least("3.2.0", "3.2"));
        assert!(!version_at_least("3.2", "3.2.1"));
        assert!(!version_at_least("3", "3.0.1"));
    }

    #[test]
    fn test_parse_hostport() {
        assert_eq!(
            parse_hostport("db.example.com:27017").unwrap(),
            ("db.example.com".to_string(), 27017)
        );
        assert!(parse_hostport("nohost").is_err());
        assert!(parse_hostport(":27017").is_err());
        assert!(parse_hostport("host:notaport").is_err());
    }
}
