use crate::http;
use crate::types::IdentityError;
use rsky_identity::IdResolver as AtprotoResolver;
use rsky_identity::errors::Error as AtprotoIdentityError;
use rsky_identity::types::{DidDocument, IdentityResolverOpts};
use std::time::Duration;

/// Fetches DID documents over HTTP: `did:plc` from a PLC directory,
/// `did:web` from the host's well-known path. Caching is layered on top
/// by [`crate::identity::IdResolver`].
#[derive(Clone, Debug)]
pub struct DidResolver {
    inner: AtprotoResolver,
}

impl DidResolver {
    pub fn new(plc_url: impl Into<String>, timeout: Duration) -> Self {
        // rsky-identity builds its own reqwest clients
        http::install_crypto_provider();
        let inner = AtprotoResolver::new(IdentityResolverOpts {
            timeout: Some(timeout),
            plc_url: Some(plc_url.into().trim_end_matches('/').to_owned()),
            did_cache: None,
            backup_nameservers: None,
        });
        Self { inner }
    }

    /// `Ok(None)` means positively not found, as opposed to a transport failure.
    pub async fn resolve_no_cache(&self, did: &str) -> Result<Option<DidDocument>, IdentityError> {
        let mut parts = did.splitn(3, ':');
        let (Some("did"), Some(method), Some(id)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(IdentityError::PoorlyFormattedDid);
        };
        if method.is_empty() || id.is_empty() {
            return Err(IdentityError::PoorlyFormattedDid);
        }

        self.inner
            .did
            .resolve_no_cache(&did.to_owned())
            .await
            .map_err(|e| match e.downcast_ref::<AtprotoIdentityError>() {
                Some(AtprotoIdentityError::DidNotFoundError(_)) => IdentityError::DidNotFound,
                Some(AtprotoIdentityError::PoorlyFormattedDidError(_)) => {
                    IdentityError::PoorlyFormattedDid
                }
                Some(
                    AtprotoIdentityError::UnsupportedDidMethodError(_)
                    | AtprotoIdentityError::UnsupportedDidWebPathError(_),
                ) => IdentityError::UnsupportedDidMethod,
                Some(AtprotoIdentityError::PoorlyFormattedDidDocumentError(doc)) => {
                    IdentityError::PoorlyFormattedDidDocument(doc.to_string())
                }
                None => IdentityError::Transport(e.to_string()),
            })
    }
}
