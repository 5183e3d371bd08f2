use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use anyhow::Error;

pub async fn create_alloy_provider(url: &str) -> Result<DynProvider, Error> {
    if url.contains("ws://") || url.contains("wss://") {
        let ws = WsConnect::new(url);
        Ok(ProviderBuilder::new()
            .connect_ws(ws.clone())
            .await
            .map_err(|e| Error::msg(format!("Failed to connect to WS: {e}")))?
            .erased())
    } else if url.contains("http://") || url.contains("https://") {
        Ok(ProviderBuilder::new()
            .connect_http(url.parse::<reqwest::Url>()?)
            .erased())
    } else {
        Err(anyhow::anyhow!(
            "Invalid URL, only websocket and http are supported: {}",
            url
        ))
    }
}
