use cedar_primitives::{Address, BlockHeader, Height, PeerId, Tipset, TipsetKey, Weight};
use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use fvm_ipld_encoding::DAG_CBOR;
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Returns a seeded rng so failures reproduce.
pub fn rng() -> StdRng {
    StdRng::seed_from_u64(0x7ea_5e7)
}

/// Generates a random DAG-CBOR CID.
pub fn random_cid<R: Rng>(rng: &mut R) -> Cid {
    let data: [u8; 16] = rng.gen();
    Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(&data))
}

/// Generates a random peer id.
pub fn random_peer_id<R: Rng>(rng: &mut R) -> PeerId {
    PeerId::new(rng.gen())
}

/// The deterministic genesis tipset used across tests: one unsigned block at
/// height zero with no parents and zero weight.
pub fn genesis_tipset() -> Tipset {
    let header = BlockHeader {
        miner: Address::new(vec![0]),
        parents: TipsetKey::new(Vec::new()),
        parent_weight: Weight::default(),
        weight_delta: Weight::default(),
        height: 0,
        state_root: Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(b"genesis-state")),
        messages_root: Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(b"genesis-msgs")),
        timestamp: 0,
        signature: Vec::new(),
    };
    Tipset::new(vec![header]).expect("genesis tipset is structurally valid")
}

/// Generates a header at `height` extending `parents`.
pub fn random_header<R: Rng>(
    rng: &mut R,
    height: Height,
    parents: &TipsetKey,
    parent_weight: Weight,
) -> BlockHeader {
    BlockHeader {
        miner: Address::new(rng.gen::<[u8; 4]>().to_vec()),
        parents: parents.clone(),
        parent_weight,
        weight_delta: Weight::from(rng.gen_range(1u32..100)),
        height,
        state_root: random_cid(rng),
        messages_root: random_cid(rng),
        timestamp: 1_700_000_000 + height,
        signature: rng.gen::<[u8; 8]>().to_vec(),
    }
}

/// Generates a tipset of `width` blocks extending `parent`.
pub fn random_tipset<R: Rng>(rng: &mut R, height: Height, parent: &Tipset, width: usize) -> Tipset {
    let parent_weight = parent.weight();
    let blocks = (0..width.max(1))
        .map(|_| random_header(rng, height, parent.key(), parent_weight.clone()))
        .collect();
    Tipset::new(blocks).expect("generated blocks are structurally consistent")
}

/// Generates a linear chain of single-block tipsets on top of `base`, one per
/// height, `len` tipsets long.
pub fn random_linear_chain<R: Rng>(rng: &mut R, base: &Tipset, len: usize) -> Vec<Tipset> {
    let mut chain = Vec::with_capacity(len);
    let mut parent = base.clone();
    for offset in 0..len {
        let tipset = random_tipset(rng, base.height() + 1 + offset as Height, &parent, 1);
        parent = tipset.clone();
        chain.push(tipset);
    }
    chain
}
