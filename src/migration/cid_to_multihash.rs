//! Version 9 addresses blocks by multihash instead of by CID, so two CIDs that
//! differ only in codec share one stored block.

use crate::cid::cid_key_to_multihash;
use crate::migration::Migration;
use crate::migration::step::{RekeySpec, Transform};

pub const BLOCKS_NAMESPACE: &str = "/blocks";
pub const BACKUP_FILE: &str = "8-to-9-cids.txt";

pub struct CidToMultihash;

impl Migration for CidToMultihash {
    fn from_version(&self) -> u32 {
        8
    }

    fn to_version(&self) -> u32 {
        9
    }

    fn description(&self) -> &'static str {
        "re-key CIDv1 blocks by their raw multihash"
    }

    fn plan(&self) -> Vec<Transform> {
        vec![Transform::Rekey(RekeySpec {
            namespace: BLOCKS_NAMESPACE,
            backup_file: BACKUP_FILE,
            map: cid_key_to_multihash,
        })]
    }
}
