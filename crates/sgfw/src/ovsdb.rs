//! OVSDB JSON-RPC client for VIF resolution
//! Talks directly to /var/run/openvswitch/db.sock

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// How long to wait for one OVSDB response.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// One Interface row, reduced to the columns the firewall needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRecord {
    pub name: String,
    pub ofport: Option<u32>,
    pub mac: Option<String>,
}

/// Direct OVSDB JSON-RPC client
pub struct OvsdbClient {
    socket_path: String,
}

impl OvsdbClient {
    /// Connect to OVSDB unix socket
    pub fn new() -> Self {
        let paths = ["/var/run/openvswitch/db.sock", "/run/openvswitch/db.sock"];
        let socket_path = paths
            .iter()
            .find(|p| Path::new(p).exists())
            .unwrap_or(&"/var/run/openvswitch/db.sock")
            .to_string();

        Self { socket_path }
    }

    /// Send JSON-RPC request and get response
    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value> {
        log::debug!("connecting to OVSDB socket: {}", self.socket_path);
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .context("Failed to connect to OVSDB socket")?;

        let request = json!({
            "method": method,
            "params": params,
            "id": 0
        });
        let request_str = serde_json::to_string(&request)?;
        log::debug!("sending OVSDB request: {}", request_str);
        stream.write_all(request_str.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        // Responses are a single JSON document; read until it parses.
        let response = tokio::time::timeout(RPC_TIMEOUT, async {
            let mut data = Vec::new();
            let mut buffer = [0u8; 4096];
            loop {
                let n = stream.read(&mut buffer).await?;
                if n == 0 {
                    anyhow::bail!("OVSDB connection closed by server");
                }
                data.extend_from_slice(&buffer[..n]);
                if let Ok(value) = serde_json::from_slice::<Value>(&data) {
                    return Ok(value);
                }
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("OVSDB response timeout for request: {}", request_str))??;

        if let Some(error) = response.get("error") {
            if !error.is_null() {
                anyhow::bail!("OVSDB error: {}", error);
            }
        }

        Ok(response["result"].clone())
    }

    /// Transact - execute OVSDB operations
    pub async fn transact(&self, operations: Value) -> Result<Value> {
        let mut params = vec![json!("Open_vSwitch")];
        if let Some(ops_array) = operations.as_array() {
            for op in ops_array {
                params.push(op.clone());
            }
        }
        self.rpc_call("transact", json!(params)).await
    }

    /// Find the interface of a VIF by its port id (the `iface-id`
    /// external-id stamped on the Interface row).
    pub async fn find_interface_by_iface_id(
        &self,
        iface_id: &str,
    ) -> Result<Option<InterfaceRecord>> {
        let operations = json!([{
            "op": "select",
            "table": "Interface",
            "where": [["external_ids", "includes", ["map", [["iface-id", iface_id]]]]],
            "columns": ["name", "ofport", "mac_in_use", "external_ids"]
        }]);

        let result = self.transact(operations).await?;
        let rows = result[0]["rows"].as_array().cloned().unwrap_or_default();
        let Some(row) = rows.first() else {
            return Ok(None);
        };

        let name = row["name"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Interface row without a name: {row}"))?
            .to_string();
        // `attached-mac` is the authoritative VIF MAC; mac_in_use is what the
        // datapath currently reports.
        let mac = map_lookup(&row["external_ids"], "attached-mac")
            .or_else(|| row["mac_in_use"].as_str().map(str::to_string));

        Ok(Some(InterfaceRecord {
            name,
            ofport: scalar_ofport(&row["ofport"]),
            mac,
        }))
    }

    /// ofport of an interface by name, if it is attached and has one.
    pub async fn interface_ofport(&self, name: &str) -> Result<Option<u32>> {
        let operations = json!([{
            "op": "select",
            "table": "Interface",
            "where": [["name", "==", name]],
            "columns": ["ofport"]
        }]);

        let result = self.transact(operations).await?;
        let rows = result[0]["rows"].as_array().cloned().unwrap_or_default();
        Ok(rows.first().and_then(|row| scalar_ofport(&row["ofport"])))
    }
}

impl Default for OvsdbClient {
    fn default() -> Self {
        Self::new()
    }
}

/// An OVSDB optional integer is either a bare number or `["set", []]`;
/// a negative ofport means the port is not attached.
fn scalar_ofport(value: &Value) -> Option<u32> {
    value.as_i64().and_then(|n| u32::try_from(n).ok())
}

/// Look a key up in an OVSDB map value (`["map", [[k, v], ...]]`).
fn map_lookup(value: &Value, key: &str) -> Option<String> {
    let entries = value.as_array()?;
    if entries.first()?.as_str()? != "map" {
        return None;
    }
    entries
        .get(1)?
        .as_array()?
        .iter()
        .filter_map(|pair| pair.as_array())
        .find(|pair| pair.first().and_then(Value::as_str) == Some(key))
        .and_then(|pair| pair.get(1)?.as_str().map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_lookup() {
        let value = json!(["map", [["iface-id", "port-1"], ["attached-mac", "fa:16:3e:00:00:01"]]]);
        assert_eq!(
            map_lookup(&value, "attached-mac").as_deref(),
            Some("fa:16:3e:00:00:01")
        );
        assert_eq!(map_lookup(&value, "missing"), None);
        assert_eq!(map_lookup(&json!({}), "iface-id"), None);
    }

    #[test]
    fn test_scalar_ofport() {
        assert_eq!(scalar_ofport(&json!(7)), Some(7));
        // Detached interfaces report -1 or an empty set.
        assert_eq!(scalar_ofport(&json!(-1)), None);
        assert_eq!(scalar_ofport(&json!(["set", []])), None);
    }
}
