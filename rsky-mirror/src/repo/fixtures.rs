use crate::repo::mst::{EntryData, NodeData};
use iroh_car::{CarHeader, CarWriter};
use k256::ecdsa::signature::Signer;
use k256::ecdsa::{Signature, SigningKey};
use lexicon_cid::Cid;
use lexicon_cid::multihash::Multihash;
use rsky_crypto::constants::SECP256K1_JWT_ALG;
use rsky_crypto::did::format_did_key;
use serde::Serialize;
use sha2::{Digest, Sha256};

const DAG_CBOR: u64 = 0x71;
const SHA2_256: u64 = 0x12;

pub(crate) const FIXTURE_REV: &str = "3lauicnwejh2f";

pub(crate) fn k256_signing_key(seed: u8) -> SigningKey {
    SigningKey::from_slice(&[seed; 32]).unwrap()
}

pub(crate) fn k256_did_key(key: &SigningKey) -> String {
    format_did_key(
        SECP256K1_JWT_ALG.to_owned(),
        key.verifying_key().to_encoded_point(false).as_bytes().to_vec(),
    )
    .unwrap()
}

pub(crate) fn cid_for(bytes: &[u8]) -> Cid {
    Cid::new_v1(
        DAG_CBOR,
        Multihash::<64>::wrap(SHA2_256, Sha256::digest(bytes).as_slice()).unwrap(),
    )
}

// field order is DAG-CBOR canonical key order
#[derive(Serialize)]
struct UnsignedCommit<'a> {
    did: &'a str,
    rev: &'a str,
    data: Cid,
    prev: Option<Cid>,
    version: u8,
}

#[derive(Serialize)]
struct SignedCommit<'a> {
    did: &'a str,
    rev: &'a str,
    #[serde(with = "serde_bytes")]
    sig: Vec<u8>,
    data: Cid,
    prev: Option<Cid>,
    version: u8,
}

pub(crate) struct RepoFixture {
    pub root: Cid,
    pub data: Cid,
    pub blocks: Vec<(Cid, Vec<u8>)>,
}

impl RepoFixture {
    pub(crate) async fn to_car(&self) -> Vec<u8> {
        write_car(self.root, &self.blocks).await
    }
}

pub(crate) async fn write_car(root: Cid, blocks: &[(Cid, Vec<u8>)]) -> Vec<u8> {
    let mut writer = CarWriter::new(CarHeader::new_v1(vec![root]), Vec::new());
    for (cid, bytes) in blocks {
        writer.write(*cid, bytes).await.unwrap();
    }
    writer.finish().await.unwrap()
}

/// Signs a `version` commit over `data` and returns `(root cid, block)`.
pub(crate) fn sign_commit(did: &str, key: &SigningKey, data: Cid, version: u8) -> (Cid, Vec<u8>) {
    let unsigned = serde_ipld_dagcbor::to_vec(&UnsignedCommit {
        did,
        rev: FIXTURE_REV,
        data,
        prev: None,
        version,
    })
    .unwrap();
    let sig: Signature = key.sign(&unsigned);
    let signed = serde_ipld_dagcbor::to_vec(&SignedCommit {
        did,
        rev: FIXTURE_REV,
        sig: sig.to_bytes().to_vec(),
        data,
        prev: None,
        version,
    })
    .unwrap();
    (cid_for(&signed), signed)
}

/// Builds a single-node repository holding `records` (`collection/rkey`, value),
/// with a v3 commit for `did` signed by `key`.
pub(crate) fn build_repo(
    did: &str,
    key: &SigningKey,
    records: &[(String, serde_json::Value)],
) -> RepoFixture {
    let mut sorted = records.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut blocks = Vec::new();
    let mut entries = Vec::new();
    let mut prev: &[u8] = &[];
    for (path, value) in &sorted {
        let bytes = serde_ipld_dagcbor::to_vec(value).unwrap();
        let cid = cid_for(&bytes);
        blocks.push((cid, bytes));

        let key_bytes = path.as_bytes();
        let prefix_len = prev
            .iter()
            .zip(key_bytes)
            .take_while(|(a, b)| a == b)
            .count();
        entries.push(EntryData {
            prefix_len,
            key_suffix: key_bytes[prefix_len..].to_vec(),
            value: cid,
            right: None,
        });
        prev = key_bytes;
    }

    let node = serde_ipld_dagcbor::to_vec(&NodeData {
        left: None,
        entries,
    })
    .unwrap();
    let data = cid_for(&node);
    blocks.push((data, node));

    let (root, signed) = sign_commit(did, key, data, 3);
    blocks.insert(0, (root, signed));

    RepoFixture { root, data, blocks }
}

/// A signed repository whose MST is a chain of `length` empty nodes, each
/// pointing left at the next.
pub(crate) fn build_empty_chain_repo(did: &str, key: &SigningKey, length: usize) -> RepoFixture {
    let mut blocks = Vec::with_capacity(length + 1);
    let mut next: Option<Cid> = None;
    for _ in 0..length {
        let node = serde_ipld_dagcbor::to_vec(&NodeData {
            left: next,
            entries: Vec::new(),
        })
        .unwrap();
        let cid = cid_for(&node);
        blocks.push((cid, node));
        next = Some(cid);
    }
    let data = next.unwrap();
    let (root, signed) = sign_commit(did, key, data, 3);
    blocks.insert(0, (root, signed));

    RepoFixture { root, data, blocks }
}
