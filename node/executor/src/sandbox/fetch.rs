use crate::error::SandboxError;
use async_trait::async_trait;

/// Retrieves script source by reference.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, source_ref: &str) -> Result<Vec<u8>, SandboxError>;
}

/// Fetches over HTTP(S), resolving `ipfs://` references through a gateway.
pub struct GatewayFetcher {
    client: reqwest::Client,
    gateway: String,
}

impl GatewayFetcher {
    pub fn new(gateway: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            gateway: gateway.trim_end_matches('/').to_string(),
        }
    }

    pub fn resolve(&self, source_ref: &str) -> String {
        match source_ref.strip_prefix("ipfs://") {
            Some(cid) => format!("{}/ipfs/{}", self.gateway, cid.trim_start_matches('/')),
            None => source_ref.to_string(),
        }
    }
}

#[async_trait]
impl SourceFetcher for GatewayFetcher {
    async fn fetch(&self, source_ref: &str) -> Result<Vec<u8>, SandboxError> {
        let url = self.resolve(source_ref);
        let fetch_error = |reason: String| SandboxError::Fetch {
            url: url.clone(),
            reason,
        };

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        if !response.status().is_success() {
            return Err(fetch_error(format!("status {}", response.status())));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        if body.is_empty() {
            return Err(fetch_error("empty body".to_string()));
        }

        tracing::debug!(url = %url, bytes = body.len(), "Fetched script source");
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_ipfs_references_through_gateway() {
        let fetcher = GatewayFetcher::new("https://ipfs.io/");
        assert_eq!(
            fetcher.resolve("ipfs://bafybeigdyrzt"),
            "https://ipfs.io/ipfs/bafybeigdyrzt"
        );
        assert_eq!(
            fetcher.resolve("https://gateway.example/ipfs/Qm1"),
            "https://gateway.example/ipfs/Qm1"
        );
    }
}
