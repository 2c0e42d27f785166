//! HTTP/JSON plumbing shared by the init and join services.

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result, RpcError};

pub const ROUTE_ACTIVATE_WORKER: &str = "/v1/activate/worker";
pub const ROUTE_ACTIVATE_CONTROL_PLANE: &str = "/v1/activate/control-plane";
pub const ROUTE_INIT: &str = "/v1/init";

/// `http://host:port`, bracketing IPv6 literals.
pub fn base_url(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("http://[{host}]:{port}")
    } else {
        format!("http://{host}:{port}")
    }
}

/// POST `body` as JSON and decode the JSON answer. A non-success status with
/// an [`RpcError`] body comes back as [`Error::Rpc`].
pub async fn post_json<B, R>(client: &Client, url: &str, body: &B) -> Result<R>
where
    B: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
        return response
            .json::<R>()
            .await
            .map_err(|e| Error::Transport(format!("decoding response: {e}")));
    }
    match response.json::<RpcError>().await {
        Ok(rpc) => Err(Error::Rpc(rpc)),
        Err(_) => Err(Error::Transport(format!("unexpected status {status}"))),
    }
}

/// Serde adapter carrying bytes as standard base64 strings.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}
