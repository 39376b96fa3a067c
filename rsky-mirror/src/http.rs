//! Outbound HTTP plumbing shared by the identity resolver and the fetchers.

use crate::types::MirrorError;
use std::time::Duration;

/// Installs the aws-lc rustls provider for the process. reqwest is built
/// without a bundled provider, so this must run before any client exists.
/// Repeated calls are no-ops.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

pub fn client(timeout: Duration) -> Result<reqwest::Client, MirrorError> {
    install_crypto_provider();
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Reads a response body, refusing anything over `limit` bytes whether or
/// not the server announced its length.
pub async fn read_body_capped(
    mut response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, MirrorError> {
    let url = response.url().clone();
    let too_large = || MirrorError::Repo(format!("response from {url} exceeds {limit} bytes"));

    if let Some(len) = response.content_length() {
        if usize::try_from(len).map_or(true, |len| len > limit) {
            return Err(too_large());
        }
    }

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > limit {
            return Err(too_large());
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_builds_without_main() {
        install_crypto_provider();
        assert!(client(Duration::from_secs(1)).is_ok());
        assert!(client(Duration::from_secs(2)).is_ok());
    }

    #[tokio::test]
    async fn test_read_body_capped() {
        let mut server = mockito::Server::new_async().await;
        let _small = server
            .mock("GET", "/small")
            .with_status(200)
            .with_body(vec![7u8; 16])
            .create_async()
            .await;
        let _large = server
            .mock("GET", "/large")
            .with_status(200)
            .with_body(vec![7u8; 4096])
            .create_async()
            .await;

        let http = client(Duration::from_secs(5)).unwrap();
        let small = http
            .get(format!("{}/small", server.url()))
            .send()
            .await
            .unwrap();
        assert_eq!(read_body_capped(small, 1024).await.unwrap().len(), 16);

        let large = http
            .get(format!("{}/large", server.url()))
            .send()
            .await
            .unwrap();
        assert!(matches!(
            read_body_capped(large, 1024).await,
            Err(MirrorError::Repo(_))
        ));
    }
}
