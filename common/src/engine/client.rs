use super::auth::JwtSecret;
use super::types::{
    ExecutionPayload, ExecutionPayloadEnvelope, ForkchoiceState, ForkchoiceUpdated,
    PayloadAttributes, PayloadId, PayloadStatus,
};
use alloy::primitives::B256;
use anyhow::{Error, anyhow};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use tracing::trace;

const FORKCHOICE_UPDATED: &str = "engine_forkchoiceUpdatedV3";
const GET_PAYLOAD: &str = "engine_getPayloadV4";
const NEW_PAYLOAD: &str = "engine_newPayloadV4";

/// JSON-RPC client for the execution client's authenticated engine port.
/// Every request carries a freshly signed bearer token.
pub struct EngineRpc {
    client: reqwest::Client,
    url: reqwest::Url,
    secret: JwtSecret,
}

impl EngineRpc {
    pub fn new(url: &str, secret: JwtSecret, timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url
                .parse()
                .map_err(|e| anyhow!("Invalid engine RPC URL {url}: {e}"))?,
            secret,
        })
    }

    pub async fn fork_choice_updated(
        &self,
        state: ForkchoiceState,
        attributes: Option<&PayloadAttributes>,
    ) -> Result<ForkchoiceUpdated, Error> {
        self.call(FORKCHOICE_UPDATED, json!([state, attributes]))
            .await
    }

    pub async fn get_payload(
        &self,
        payload_id: PayloadId,
    ) -> Result<ExecutionPayloadEnvelope, Error> {
        self.call(GET_PAYLOAD, json!([payload_id])).await
    }

    pub async fn new_payload(&self, payload: &ExecutionPayload) -> Result<PayloadStatus, Error> {
        // V4 params: payload, blob versioned hashes, parent beacon root,
        // execution requests. Blobs are never produced here.
        let empty: [B256; 0] = [];
        self.call(NEW_PAYLOAD, json!([payload, empty, B256::ZERO, empty]))
            .await
    }

    async fn call<R: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<R, Error> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        trace!("Engine RPC request: {method}");

        let response = self
            .client
            .post(self.url.clone())
            .bearer_auth(self.secret.generate_token()?)
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow!("{method} request failed: {e}"))?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| anyhow!("{method} returned malformed body: {e}"))?;

        if let Some(error) = body.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            return Err(anyhow!("{method} returned error: {message}"));
        }

        let result = body
            .get("result")
            .ok_or_else(|| anyhow!("{method} response has no result"))?;
        serde_json::from_value(result.clone())
            .map_err(|e| anyhow!("{method} result failed to parse: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::PayloadStatusKind;
    use mockito::Matcher;

    fn test_secret() -> JwtSecret {
        JwtSecret::from_hex(&"22".repeat(32)).expect("valid secret")
    }

    #[tokio::test]
    async fn test_fork_choice_updated_returns_payload_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_header("authorization", Matcher::Regex("Bearer .+".to_string()))
            .match_body(Matcher::PartialJson(json!({
                "method": "engine_forkchoiceUpdatedV3",
            })))
            .with_body(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": {
                        "payloadStatus": {"status": "VALID", "latestValidHash": null, "validationError": null},
                        "payloadId": "0x0102030405060708"
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let rpc = EngineRpc::new(&server.url(), test_secret(), Duration::from_secs(5))
            .expect("client");
        let updated = rpc
            .fork_choice_updated(ForkchoiceState::at_head(B256::ZERO), None)
            .await
            .expect("fcu");

        assert_eq!(updated.payload_status.status, PayloadStatusKind::Valid);
        assert_eq!(
            updated.payload_id,
            Some("0x0102030405060708".parse().expect("payload id"))
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rpc_error_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_body(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "error": {"code": -38002, "message": "Invalid forkchoice state"}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let rpc = EngineRpc::new(&server.url(), test_secret(), Duration::from_secs(5))
            .expect("client");
        let err = rpc
            .fork_choice_updated(ForkchoiceState::at_head(B256::ZERO), None)
            .await
            .expect_err("should fail");
        assert!(err.to_string().contains("Invalid forkchoice state"));
    }
}
