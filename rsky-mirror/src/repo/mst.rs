use crate::config::{MAX_MST_DEPTH, MAX_MST_NODES};
use crate::repo::car::CarArchive;
use crate::types::VerificationError;
use lexicon_cid::Cid;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct NodeData {
    #[serde(rename = "l")]
    pub left: Option<Cid>,
    #[serde(rename = "e")]
    pub entries: Vec<EntryData>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct EntryData {
    #[serde(rename = "p")]
    pub prefix_len: usize,
    #[serde(rename = "k", with = "serde_bytes")]
    pub key_suffix: Vec<u8>,
    #[serde(rename = "v")]
    pub value: Cid,
    #[serde(rename = "t")]
    pub right: Option<Cid>,
}

enum Step {
    Visit { cid: Cid, depth: usize },
    Emit { path: String, value: Cid },
}

/// Lists every `(collection/rkey, record cid)` leaf under `root`, in key order.
/// Every node must be present in the archive and keys must strictly ascend.
pub fn leaves(car: &CarArchive, root: Cid) -> Result<Vec<(String, Cid)>, VerificationError> {
    leaves_bounded(car, root, MAX_MST_DEPTH, *MAX_MST_NODES)
}

/// Iterative in-order walk. Trees deeper than `max_depth` or with more than
/// `max_nodes` nodes are rejected, which also stops cyclic node references.
pub fn leaves_bounded(
    car: &CarArchive,
    root: Cid,
    max_depth: usize,
    max_nodes: usize,
) -> Result<Vec<(String, Cid)>, VerificationError> {
    let mut out: Vec<(String, Cid)> = Vec::new();
    let mut stack = vec![Step::Visit {
        cid: root,
        depth: 0,
    }];
    let mut visited = 0usize;

    while let Some(step) = stack.pop() {
        match step {
            Step::Emit { path, value } => {
                if let Some((last, _)) = out.last() {
                    if last.as_str() >= path.as_str() {
                        return Err(VerificationError::MalformedCommit(format!(
                            "mst keys out of order: {last} >= {path}"
                        )));
                    }
                }
                out.push((path, value));
            }
            Step::Visit { cid, depth } => {
                if depth > max_depth {
                    return Err(VerificationError::MstBounds(format!(
                        "deeper than {max_depth} at {cid}"
                    )));
                }
                visited += 1;
                if visited > max_nodes {
                    return Err(VerificationError::MstBounds(format!(
                        "more than {max_nodes} nodes"
                    )));
                }

                let block = car.get(&cid)?;
                let node: NodeData = serde_ipld_dagcbor::from_slice(block)
                    .map_err(|e| VerificationError::MalformedCommit(format!("mst node {cid}: {e}")))?;

                // keys are prefix-compressed against the previous entry of the same node
                let mut steps = Vec::with_capacity(node.entries.len() * 2 + 1);
                if let Some(left) = node.left {
                    steps.push(Step::Visit {
                        cid: left,
                        depth: depth + 1,
                    });
                }
                let mut prev: Vec<u8> = Vec::new();
                for entry in node.entries {
                    if entry.prefix_len > prev.len() {
                        return Err(VerificationError::MalformedCommit(format!(
                            "mst node {cid}: prefix {} longer than previous key",
                            entry.prefix_len
                        )));
                    }
                    let mut key = prev[..entry.prefix_len].to_vec();
                    key.extend_from_slice(&entry.key_suffix);
                    let path = String::from_utf8(key.clone()).map_err(|_| {
                        VerificationError::MalformedCommit(format!("mst node {cid}: key not utf-8"))
                    })?;
                    steps.push(Step::Emit {
                        path,
                        value: entry.value,
                    });
                    if let Some(right) = entry.right {
                        steps.push(Step::Visit {
                            cid: right,
                            depth: depth + 1,
                        });
                    }
                    prev = key;
                }
                stack.extend(steps.into_iter().rev());
            }
        }
    }
    Ok(out)
}
