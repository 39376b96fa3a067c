use rsky_crypto::constants::{P256_JWT_ALG, SECP256K1_JWT_ALG};
use rsky_crypto::did::{format_did_key, parse_multikey};
use rsky_identity::types::DidDocument;

/// Extract handle from DID document's alsoKnownAs field
pub fn get_handle(doc: &DidDocument) -> Option<String> {
    doc.also_known_as
        .as_ref()?
        .iter()
        .find_map(|alias| alias.strip_prefix("at://"))
        .map(|handle| handle.trim_end_matches('/').to_ascii_lowercase())
        .filter(|handle| !handle.is_empty())
}

/// Extract PDS endpoint from DID document's services
pub fn get_pds_endpoint(doc: &DidDocument) -> Option<String> {
    doc.service.as_ref()?.iter().find_map(|service| {
        let id_matches = service.id == "#atproto_pds" || service.id.ends_with("#atproto_pds");
        let valid_url = service.service_endpoint.starts_with("http://")
            || service.service_endpoint.starts_with("https://");
        (id_matches && service.r#type == "AtprotoPersonalDataServer" && valid_url)
            .then(|| service.service_endpoint.trim_end_matches('/').to_owned())
    })
}

/// Extract the `#atproto` signing key, normalised to a did:key
pub fn get_signing_key(doc: &DidDocument) -> Option<String> {
    let method = doc
        .verification_method
        .as_ref()?
        .iter()
        .find(|m| m.id == "#atproto" || m.id.ends_with("#atproto"))?;
    let multibase = method.public_key_multibase.clone()?;

    let did_key = match method.r#type.as_str() {
        "Multikey" => parse_multikey(multibase)
            .and_then(|parsed| format_did_key(parsed.jwt_alg, parsed.key_bytes)),
        legacy => {
            // legacy types carry the raw SEC1 point
            let alg = match legacy {
                "EcdsaSecp256k1VerificationKey2019" => SECP256K1_JWT_ALG,
                "EcdsaSecp256r1VerificationKey2019" => P256_JWT_ALG,
                _ => return None,
            };
            let (_, raw) = multibase::decode(&multibase).ok()?;
            format_did_key(alg.to_owned(), raw)
        }
    };
    match did_key {
        Ok(did_key) => Some(did_key),
        Err(e) => {
            tracing::debug!("unusable signing key in {}: {e}", doc.id);
            None
        }
    }
}
