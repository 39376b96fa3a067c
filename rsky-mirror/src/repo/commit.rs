use crate::types::VerificationError;
use lexicon_cid::Cid;
use rsky_crypto::constants::{P256_JWT_ALG, SECP256K1_JWT_ALG};
use rsky_crypto::did::parse_did_key;
use rsky_crypto::verify::verify_signature;
use rsky_repo::types::Commit;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// The signed part of a commit. Fields are declared in DAG-CBOR key order
/// (length first, then bytewise) so the encoding is canonical.
#[derive(Serialize)]
struct UnsignedCommit<'a> {
    did: &'a str,
    rev: &'a str,
    data: Cid,
    prev: Option<Cid>,
    version: u8,
}

pub fn unsigned_bytes(commit: &Commit) -> Result<Vec<u8>, VerificationError> {
    serde_ipld_dagcbor::to_vec(&UnsignedCommit {
        did: &commit.did,
        rev: &commit.rev,
        data: commit.data,
        prev: commit.prev,
        version: commit.version,
    })
    .map_err(|e| VerificationError::MalformedCommit(e.to_string()))
}

/// Returns the JWT algorithm of a did:key, failing for keys we cannot verify with.
pub fn signing_key_alg(did_key: &str) -> Result<String, VerificationError> {
    let parsed = parse_did_key(&did_key.to_owned())
        .map_err(|e| VerificationError::InvalidKey(format!("{did_key}: {e}")))?;
    match parsed.jwt_alg.as_str() {
        SECP256K1_JWT_ALG | P256_JWT_ALG => Ok(parsed.jwt_alg),
        other => Err(VerificationError::UnsupportedKey(other.to_owned())),
    }
}

/// Checks the commit belongs to `did` and is signed by `did_key`.
pub fn verify_commit(commit: &Commit, did: &str, did_key: &str) -> Result<(), VerificationError> {
    if !matches!(commit.version, 2 | 3) {
        return Err(VerificationError::UnsupportedVersion(commit.version));
    }
    if commit.did != did {
        return Err(VerificationError::DidMismatch {
            expected: did.to_owned(),
            got: commit.did.clone(),
        });
    }

    let alg = signing_key_alg(did_key)?;
    let unsigned = unsigned_bytes(commit)?;
    // the secp256k1 verifier takes a prehashed digest, P-256 hashes the message itself
    let data = if alg == SECP256K1_JWT_ALG {
        Sha256::digest(&unsigned).to_vec()
    } else {
        unsigned
    };

    match verify_signature(&did_key.to_owned(), &data, commit.sig.as_slice(), None) {
        Ok(true) => Ok(()),
        Ok(false) => Err(VerificationError::BadSignature),
        Err(e) => {
            tracing::debug!("unverifiable signature on commit for {did}: {e}");
            Err(VerificationError::BadSignature)
        }
    }
}
