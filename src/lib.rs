//! Identity verification core: tamper-evident signature chains, key
//! families, and the computed key state behind user lookups.
//!
//! Given a remote user, this crate loads the user's sigchain from
//! cache, reconciles it with the server against a Merkle-anchored tail
//! pointer, verifies every link's hashes and signatures, and replays
//! the verified chain over the user's key family to answer "is this
//! KID currently a live sibkey, and what proves it?". It also parses
//! `gpg --with-colons` listings into the offline key inventory used to
//! locate local signing capability.
//!
//! Network, storage, and GPG subprocess access are collaborators
//! behind narrow contracts ([`api::ApiClient`], [`store::LocalDb`],
//! [`gpg::GpgClient`]), handed around in an explicit [`env::Env`].

pub mod api;
pub mod chain;
pub mod env;
pub mod errors;
pub mod gpg;
pub mod keyfamily;
pub mod keys;
pub mod kid;
pub mod link;
pub mod pgp;
pub mod store;
#[cfg(test)]
pub mod testhelpers;

pub use api::{ApiArg, ApiClient, HttpArgs};
pub use chain::{
    ChainType, MerkleTriple, MerkleUserLeaf, PUBLIC_CHAIN, SigChain, SigChainLoader, UserInfo,
    load_sig_chain,
};
pub use env::Env;
pub use errors::{Error, GpgIndexError, Result, Warning, Warnings};
pub use gpg::{GpgClient, GpgKeyIndex, parse_gpg_index_stream};
pub use keyfamily::{
    ComputedKeyFamily, ComputedKeyInfo, ComputedKeyInfos, KeyFamily, KeyMap, KeyStatus,
    KeybaseTime, ServerKeyRecord, parse_key_family,
};
pub use keys::{
    GenericKey, KID_NACL_DH, KID_NACL_EDDSA, KeyringCipher, NaclDhKeyPair, NaclSigningKeyPair,
    SigVerifier, is_pgp_algo,
};
pub use kid::{Fokid, Kid, LinkId, PgpFingerprint, SigId, Uid};
pub use link::{ChainLink, LinkKind, LinkSummary};
pub use pgp::{Identity, PgpKeyBundle, keybase_email, parse_identity};
pub use store::{DB_CHAIN_LINK, DB_SIG_CHAIN_TAIL_PUBLIC, DbKey, FsDb, LocalDb, MemDb};
