pub mod car;
pub mod commit;
pub mod mst;

#[cfg(test)]
pub(crate) mod fixtures;

use crate::types::{MirrorError, VerificationError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use ipld_core::ipld::Ipld;
use lexicon_cid::Cid;
use rsky_repo::block_map::BlockMap;
use rsky_repo::readable_repo::ReadableRepo;
use rsky_repo::storage::memory_blockstore::MemoryBlockstore;
use rsky_repo::types::Commit;
use std::sync::Arc;
use tokio::sync::RwLock;

pub use car::{CarArchive, read_car};
pub use commit::{signing_key_alg, verify_commit};

/// One record leaf of a verified repository.
#[derive(Debug, Clone)]
pub struct RepoEntry {
    pub path: String,
    pub cid: Cid,
    pub value: serde_json::Value,
}

#[derive(Debug)]
pub struct VerifiedRepo {
    pub commit: Commit,
    pub entries: Vec<RepoEntry>,
}

/// Parses a repository CAR and verifies it before decoding any record:
/// block hashes, commit DID, commit signature against `did_key`, then the MST walk.
pub async fn load_verified(
    bytes: Vec<u8>,
    did: &str,
    did_key: &str,
) -> Result<VerifiedRepo, MirrorError> {
    let car = read_car(bytes).await?;
    let commit = load_commit(&car).await?;
    verify_commit(&commit, did, did_key)?;

    let leaves = mst::leaves(&car, commit.data)?;
    let mut entries = Vec::with_capacity(leaves.len());
    for (path, cid) in leaves {
        let block = car.get(&cid)?;
        match serde_ipld_dagcbor::from_slice::<Ipld>(block) {
            Ok(ipld) => entries.push(RepoEntry {
                path,
                cid,
                value: ipld_to_json(&ipld),
            }),
            Err(e) => {
                tracing::warn!("undecodable record block {cid} at {path} in {did}: {e}");
            }
        }
    }

    Ok(VerifiedRepo { commit, entries })
}

/// Decodes the root commit. Only the commit block goes into the store; the
/// MST is walked separately with bounds.
async fn load_commit(car: &CarArchive) -> Result<Commit, MirrorError> {
    let mut blocks = BlockMap::new();
    blocks.set(car.root, car.get(&car.root)?.to_vec());
    let blockstore = MemoryBlockstore::new(Some(blocks))
        .await
        .map_err(|e| MirrorError::Repo(format!("blockstore failed: {e}")))?;
    let repo = ReadableRepo::load(Arc::new(RwLock::new(blockstore)), car.root)
        .await
        .map_err(|e| VerificationError::MalformedCommit(e.to_string()))?;
    Ok(repo.commit)
}

/// Renders DAG-CBOR data in the JSON conventions used on the wire:
/// links as `{"$link": cid}` and bytes as `{"$bytes": base64}`.
pub fn ipld_to_json(ipld: &Ipld) -> serde_json::Value {
    match ipld {
        Ipld::Null => serde_json::Value::Null,
        Ipld::Bool(b) => serde_json::Value::Bool(*b),
        Ipld::Integer(i) => i64::try_from(*i)
            .map(serde_json::Value::from)
            .or_else(|_| u64::try_from(*i).map(serde_json::Value::from))
            .unwrap_or_else(|_| serde_json::Value::String(i.to_string())),
        Ipld::Float(f) => serde_json::Number::from_f64(*f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        Ipld::String(s) => serde_json::Value::String(s.clone()),
        Ipld::Bytes(b) => serde_json::json!({ "$bytes": STANDARD_NO_PAD.encode(b) }),
        Ipld::List(items) => serde_json::Value::Array(items.iter().map(ipld_to_json).collect()),
        Ipld::Map(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), ipld_to_json(v)))
                .collect(),
        ),
        Ipld::Link(cid) => serde_json::json!({ "$link": cid.to_string() }),
    }
}
