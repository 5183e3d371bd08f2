use anyhow::{Error, anyhow};
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};

/// 32-byte secret shared with the execution client's authenticated RPC port.
#[derive(Clone)]
pub struct JwtSecret([u8; 32]);

impl JwtSecret {
    pub fn from_hex(hex_str: &str) -> Result<Self, Error> {
        let stripped = hex_str.trim().strip_prefix("0x").unwrap_or(hex_str.trim());
        let bytes = hex::decode(stripped)
            .map_err(|e| anyhow!("JWT secret is not valid hex: {e}"))?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow!("JWT secret must be exactly 32 bytes"))?;
        Ok(Self(secret))
    }

    /// Tokens carry only an `iat` claim, signed with HS256. Execution clients
    /// reject tokens older than a minute, so a fresh one is made per request.
    pub fn generate_token(&self) -> Result<String, Error> {
        let header = jsonwebtoken::Header::default();
        let iat = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let claims = json!({"iat": iat});
        let encoding_key = jsonwebtoken::EncodingKey::from_secret(&self.0);
        Ok(jsonwebtoken::encode(&header, &claims, &encoding_key)?)
    }
}

impl std::fmt::Debug for JwtSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JwtSecret(***)")
    }
}
