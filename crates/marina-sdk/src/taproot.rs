use lwk_wollet::elements::Script;
use lwk_wollet::elements::secp256k1_zkp::{Secp256k1, XOnlyPublicKey};
use lwk_wollet::elements::taproot::{ControlBlock, LeafVersion, TaprootBuilder, TaprootSpendInfo};

use crate::error::{Error, Result};

/// NUMS (Nothing Up My Sleeve) key: a provably unspendable internal key.
pub const NUMS_KEY_BYTES: [u8; 32] = [
    0x50, 0x92, 0x9b, 0x74, 0xc1, 0xa0, 0x49, 0x54, 0xb7, 0x8b, 0x4b, 0x60, 0x35, 0xe9, 0x7a, 0x5e,
    0x07, 0x8a, 0x5a, 0x0f, 0x28, 0xec, 0x96, 0xd5, 0x47, 0xbf, 0xee, 0x9a, 0xce, 0x80, 0x3a, 0xc0,
];

pub fn nums_key() -> Result<XOnlyPublicKey> {
    XOnlyPublicKey::from_slice(&NUMS_KEY_BYTES).map_err(|e| Error::Artifact(format!("NUMS key: {e}")))
}

/// Leaf depths of a balanced tree over `n` leaves, left subtrees taking the
/// extra leaf. Depth-first order, as `TaprootBuilder` expects.
fn balanced_depths(n: usize) -> Vec<usize> {
    fn fill(n: usize, depth: usize, out: &mut Vec<usize>) {
        match n {
            0 => {}
            1 => out.push(depth),
            _ => {
                let left = n.div_ceil(2);
                fill(left, depth + 1, out);
                fill(n - left, depth + 1, out);
            }
        }
    }
    let mut out = Vec::with_capacity(n);
    fill(n, 0, &mut out);
    out
}

/// Script-path spend data of a taproot output committing to `leaves`.
#[derive(Debug, Clone)]
pub struct TaprootSpend {
    leaves: Vec<Script>,
    info: TaprootSpendInfo,
}

impl TaprootSpend {
    /// Balanced tree over `leaves` in order, tweaking `internal_key`.
    pub fn new(internal_key: XOnlyPublicKey, leaves: Vec<Script>) -> Result<Self> {
        if leaves.is_empty() {
            return Err(Error::Artifact("taproot tree has no leaves".into()));
        }
        let mut builder = TaprootBuilder::new();
        for (script, depth) in leaves.iter().zip(balanced_depths(leaves.len())) {
            let depth = u8::try_from(depth)
                .map_err(|_| Error::Artifact(format!("taproot tree too deep ({depth})")))?;
            builder = builder
                .add_leaf_with_ver(depth.into(), script.clone(), LeafVersion::default())
                .map_err(|e| Error::Artifact(format!("taproot tree: {e}")))?;
        }
        let info = builder
            .finalize(&Secp256k1::verification_only(), internal_key)
            .map_err(|e| Error::Artifact(format!("taproot tree: {e:?}")))?;
        Ok(Self { leaves, info })
    }

    /// Spend info under the NUMS internal key (no key path).
    pub fn with_nums(leaves: Vec<Script>) -> Result<Self> {
        Self::new(nums_key()?, leaves)
    }

    pub fn internal_key(&self) -> XOnlyPublicKey {
        self.info.internal_key()
    }

    pub fn output_key(&self) -> XOnlyPublicKey {
        self.info.output_key().into()
    }

    pub fn leaves(&self) -> &[Script] {
        &self.leaves
    }

    /// P2TR witness v1 script: OP_1 <32-byte-x-only-key>
    pub fn script_pubkey(&self) -> Script {
        let mut script_bytes = Vec::with_capacity(34);
        script_bytes.push(0x51);
        script_bytes.push(0x20);
        script_bytes.extend_from_slice(&self.output_key().serialize());
        Script::from(script_bytes)
    }

    /// Control block for spending `script`, if it is a leaf of the tree.
    pub fn control_block(&self, script: &Script) -> Option<ControlBlock> {
        self.info
            .control_block(&(script.clone(), LeafVersion::default()))
    }
}
