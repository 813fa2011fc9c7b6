//! Test helpers: deterministic data generators and scripted seam
//! implementations.

mod generators;
pub use generators::{
    genesis_tipset, random_cid, random_header, random_linear_chain, random_peer_id, random_tipset,
    rng,
};

mod mocks;
pub use mocks::{result_for, Behavior, CountingInterpreter, TestChainSyncClient};
