//! The hash accumulator backing a log.
//!
//! Blocks are leaves of a binary Merkle tree in the RFC 6962 shape: the
//! tree over `n` leaves splits at the largest power of two smaller than
//! `n`. A block's inclusion proof is its audit path; the root over the
//! whole log is signed by the writer, so a path plus a [`SignedHead`]
//! links any block to the log's public key.

use serde::{Deserialize, Serialize};

use keel_base::{PublicKey, SecretKey, Signature};

/// A 32-byte blake3 hash.
pub type Hash = [u8; 32];

const LEAF_PREFIX: &[u8] = &[0x00];
const NODE_PREFIX: &[u8] = &[0x01];
const HEAD_CONTEXT: &[u8] = b"keel v1 log head";

/// Hash of a leaf: `blake3(0x00 || le64(len) || payload)`.
///
/// The length prefix keeps leaf preimages unambiguous; the position is
/// bound by the audit path, not the leaf itself.
pub fn leaf_hash(payload: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(LEAF_PREFIX);
    hasher.update(&(payload.len() as u64).to_le_bytes());
    hasher.update(payload);
    *hasher.finalize().as_bytes()
}

fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(NODE_PREFIX);
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}

/// Largest power of two strictly smaller than `n`. `n` must be >= 2.
fn split_point(n: usize) -> usize {
    let k = usize::BITS - (n - 1).leading_zeros() - 1;
    1 << k
}

/// Root over a contiguous slice of leaf hashes.
pub fn root(leaves: &[Hash]) -> Hash {
    match leaves.len() {
        0 => *blake3::hash(b"").as_bytes(),
        1 => leaves[0],
        n => {
            let k = split_point(n);
            node_hash(&root(&leaves[..k]), &root(&leaves[k..]))
        }
    }
}

/// Audit path for the leaf at `index`, bottom-up.
///
/// Requires the full leaf-hash slice; only replicas holding every block
/// up to their head can construct proofs.
pub fn proof_path(leaves: &[Hash], index: u64) -> Vec<Hash> {
    fn path(leaves: &[Hash], m: usize, out: &mut Vec<Hash>) {
        let n = leaves.len();
        if n <= 1 {
            return;
        }
        let k = split_point(n);
        if m < k {
            path(&leaves[..k], m, out);
            out.push(root(&leaves[k..]));
        } else {
            path(&leaves[k..], m - k, out);
            out.push(root(&leaves[..k]));
        }
    }
    let mut out = Vec::new();
    path(leaves, index as usize, &mut out);
    out
}

/// Recompute the root committed to by an audit path.
///
/// Returns `None` for a malformed path (wrong length for the claimed
/// index and tree size). The caller compares the result against a signed
/// root.
pub fn root_from_path(leaf: Hash, index: u64, tree_size: u64, path: &[Hash]) -> Option<Hash> {
    if index >= tree_size {
        return None;
    }
    let mut fnode = index;
    let mut snode = tree_size - 1;
    let mut r = leaf;
    for p in path {
        if snode == 0 {
            return None;
        }
        if fnode & 1 == 1 || fnode == snode {
            r = node_hash(p, &r);
            if fnode & 1 == 0 {
                while fnode & 1 == 0 && fnode != 0 {
                    fnode >>= 1;
                    snode >>= 1;
                }
            }
        } else {
            r = node_hash(&r, p);
        }
        fnode >>= 1;
        snode >>= 1;
    }
    if snode == 0 {
        Some(r)
    } else {
        None
    }
}

/// A writer-signed commitment to the state of a log.
///
/// Carries the block count, the total payload bytes and the tree root.
/// Anyone holding the log's public key can check that a head was produced
/// by the writer; anyone holding a head can check block proofs against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedHead {
    /// Number of blocks committed.
    pub length: u64,
    /// Total payload bytes committed.
    pub byte_len: u64,
    /// Tree root over the first `length` leaves.
    pub root: Hash,
    /// Writer signature over the above.
    pub signature: Signature,
}

impl SignedHead {
    fn preimage(length: u64, byte_len: u64, root: &Hash) -> Vec<u8> {
        let mut msg = Vec::with_capacity(HEAD_CONTEXT.len() + 16 + 32);
        msg.extend_from_slice(HEAD_CONTEXT);
        msg.extend_from_slice(&length.to_le_bytes());
        msg.extend_from_slice(&byte_len.to_le_bytes());
        msg.extend_from_slice(root);
        msg
    }

    /// Sign a head with the log's secret key.
    pub fn sign(secret: &SecretKey, length: u64, byte_len: u64, root: Hash) -> Self {
        let signature = secret.sign(&Self::preimage(length, byte_len, &root));
        Self {
            length,
            byte_len,
            root,
            signature,
        }
    }

    /// Verify the writer signature.
    pub fn verify(&self, public: &PublicKey) -> Result<(), keel_base::SignatureError> {
        public.verify(
            &Self::preimage(self.length, self.byte_len, &self.root),
            &self.signature,
        )
    }
}

/// An inclusion proof for one block: the signed head it was proven
/// against plus the audit path from the block's leaf to the head's root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proof {
    /// The head the path commits to.
    pub head: SignedHead,
    /// Sibling hashes, bottom-up.
    pub path: Vec<Hash>,
}

impl Proof {
    /// Verify that `payload` is the block at `index` of the log owned by
    /// `public`.
    pub fn verify(&self, public: &PublicKey, index: u64, payload: &[u8]) -> bool {
        if self.head.verify(public).is_err() {
            return false;
        }
        match root_from_path(leaf_hash(payload), index, self.head.length, &self.path) {
            Some(root) => root == self.head.root,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use keel_base::SecretKey;

    use super::*;

    fn leaves(n: usize) -> Vec<Hash> {
        (0..n)
            .map(|i| leaf_hash(format!("block {i}").as_bytes()))
            .collect()
    }

    #[test]
    fn test_proofs_verify_for_all_sizes() {
        for n in 1..=33u64 {
            let leaves = leaves(n as usize);
            let root = root(&leaves);
            for i in 0..n {
                let path = proof_path(&leaves, i);
                let got = root_from_path(leaves[i as usize], i, n, &path)
                    .unwrap_or_else(|| panic!("path rejected at index {i} of {n}"));
                assert_eq!(got, root, "wrong root at index {i} of {n}");
            }
        }
    }

    #[test]
    fn test_tampered_payload_fails() {
        let leaves = leaves(8);
        let root = root(&leaves);
        let path = proof_path(&leaves, 3);
        let forged = leaf_hash(b"not block 3");
        assert_ne!(root_from_path(forged, 3, 8, &path), Some(root));
    }

    #[test]
    fn test_wrong_index_fails() {
        let leaves = leaves(8);
        let root = root(&leaves);
        let path = proof_path(&leaves, 3);
        assert_ne!(root_from_path(leaves[3], 4, 8, &path), Some(root));
    }

    #[test]
    fn test_index_out_of_range_rejected() {
        let leaves = leaves(4);
        let path = proof_path(&leaves, 1);
        assert_eq!(root_from_path(leaves[1], 4, 4, &path), None);
    }

    #[test]
    fn test_root_changes_with_every_append() {
        let leaves = leaves(16);
        let mut seen = std::collections::HashSet::new();
        for n in 0..=16 {
            assert!(seen.insert(root(&leaves[..n])));
        }
    }

    #[test]
    fn test_signed_head_roundtrip() {
        let secret = SecretKey::from_bytes(&[5u8; 32]);
        let leaves = leaves(3);
        let head = SignedHead::sign(&secret, 3, 42, root(&leaves));
        head.verify(&secret.public()).unwrap();

        let other = SecretKey::from_bytes(&[6u8; 32]);
        assert!(head.verify(&other.public()).is_err());
    }

    #[test]
    fn test_signed_head_binds_length() {
        let secret = SecretKey::from_bytes(&[5u8; 32]);
        let leaves = leaves(3);
        let mut head = SignedHead::sign(&secret, 3, 42, root(&leaves));
        head.length = 4;
        assert!(head.verify(&secret.public()).is_err());
    }

    #[test]
    fn test_proof_type_verifies() {
        let secret = SecretKey::from_bytes(&[5u8; 32]);
        let payloads: Vec<&[u8]> = vec![b"a", b"b", b"c"];
        let leaves: Vec<Hash> = payloads.iter().map(|p| leaf_hash(p)).collect();
        let head = SignedHead::sign(&secret, 3, 3, root(&leaves));
        let proof = Proof {
            head,
            path: proof_path(&leaves, 1),
        };
        assert!(proof.verify(&secret.public(), 1, b"b"));
        assert!(!proof.verify(&secret.public(), 1, b"x"));
        assert!(!proof.verify(&secret.public(), 0, b"b"));
    }
}
