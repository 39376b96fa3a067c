use crate::types::{MirrorError, VerificationError};
use iroh_car::CarReader;
use lexicon_cid::Cid;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Cursor;

const SHA2_256: u64 = 0x12;

/// All blocks of a CAR file, keyed by their (checked) CIDs.
#[derive(Debug)]
pub struct CarArchive {
    pub root: Cid,
    pub blocks: HashMap<Cid, Vec<u8>>,
}

impl CarArchive {
    pub fn get(&self, cid: &Cid) -> Result<&[u8], VerificationError> {
        self.blocks
            .get(cid)
            .map(Vec::as_slice)
            .ok_or_else(|| VerificationError::MissingBlock(cid.to_string()))
    }
}

/// Reads every block and checks each against its CID's SHA-256 multihash.
/// A block that does not hash to its CID fails the whole archive.
pub async fn read_car(bytes: Vec<u8>) -> Result<CarArchive, MirrorError> {
    let mut reader = CarReader::new(Cursor::new(bytes))
        .await
        .map_err(|e| MirrorError::Repo(format!("car read failed: {e}")))?;

    let root = *reader
        .header()
        .roots()
        .first()
        .ok_or_else(|| MirrorError::Repo("no root cid".into()))?;

    let mut blocks = HashMap::new();
    while let Some((cid, data)) = reader
        .next_block()
        .await
        .map_err(|e| MirrorError::Repo(format!("read block failed: {e}")))?
    {
        verify_block(&cid, &data)?;
        blocks.insert(cid, data);
    }

    Ok(CarArchive { root, blocks })
}

pub fn verify_block(cid: &Cid, data: &[u8]) -> Result<(), VerificationError> {
    let hash = cid.hash();
    if hash.code() != SHA2_256 {
        return Err(VerificationError::BlockHashMismatch(format!(
            "{cid} (unsupported multihash 0x{:x})",
            hash.code()
        )));
    }
    if Sha256::digest(data).as_slice() != hash.digest() {
        return Err(VerificationError::BlockHashMismatch(cid.to_string()));
    }
    Ok(())
}
