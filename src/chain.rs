//! Sig chains: load from cache, reconcile with the server, verify
//! link-to-link integrity, bind to an identity, persist.
//!
//! The chain owns its links; everything that needs chain context
//! happens through [`SigChain`] methods rather than back-references
//! from the links.

use crate::api::ApiArg;
use crate::env::Env;
use crate::errors::{Error, Result};
use crate::kid::{LinkId, PgpFingerprint, Uid};
use crate::link::{ChainLink, LinkSummary};
use crate::pgp::PgpKeyBundle;
use crate::store::{DB_SIG_CHAIN_TAIL_PUBLIC, DbKey, LocalDb};
use tracing::debug;

/// The `(seqno, linkId)` pair committed for a user in the global
/// Merkle tree: the authoritative freshness anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MerkleTriple {
    pub seqno: u64,
    pub link_id: LinkId,
}

/// A user's leaf in the Merkle tree. Only the public chain is carried
/// here.
#[derive(Debug, Clone, Copy, Default)]
pub struct MerkleUserLeaf {
    pub public: Option<MerkleTriple>,
}

/// Flavor of chain a loader works on: which store slot holds the tail
/// summary, and which triple anchors it in a Merkle leaf.
pub struct ChainType {
    pub db_type: u16,
}

impl ChainType {
    pub fn merkle_triple<'a>(&self, leaf: &'a MerkleUserLeaf) -> Option<&'a MerkleTriple> {
        leaf.public.as_ref()
    }
}

/// The public sigchain.
pub static PUBLIC_CHAIN: ChainType = ChainType {
    db_type: DB_SIG_CHAIN_TAIL_PUBLIC,
};

/// A user's append-only, hash-linked log of key-management operations.
#[derive(Debug)]
pub struct SigChain {
    uid: Uid,
    username: String,
    links: Vec<ChainLink>,
    id_verified: bool,

    /// Standalone tail pointer that may run ahead of the materialised
    /// links (set by [`SigChain::bump`] after posting a signature).
    last: Option<LinkSummary>,
}

impl SigChain {
    pub fn new(uid: Uid, username: impl Into<String>) -> Self {
        Self {
            uid,
            username: username.into(),
            links: Vec::new(),
            id_verified: false,
            last: None,
        }
    }

    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn links(&self) -> &[ChainLink] {
        &self.links
    }

    pub fn last_link(&self) -> Option<&ChainLink> {
        self.links.last()
    }

    /// The chain's height: the cached tail summary if one is ahead,
    /// else the last materialised link.
    pub fn last_seqno(&self) -> u64 {
        if let Some(last) = &self.last {
            last.seqno
        } else {
            self.links.last().map_or(0, ChainLink::seqno)
        }
    }

    pub fn last_id(&self) -> Option<LinkId> {
        if let Some(last) = &self.last {
            Some(last.id)
        } else {
            self.links.last().map(|l| *l.id())
        }
    }

    /// Optimistically advance the tail after posting a new signature.
    pub fn bump(&mut self, id: LinkId) {
        let summary = LinkSummary {
            id,
            seqno: self.last_seqno() + 1,
        };
        debug!("| bumping sigchain last_seqno to {}", summary.seqno);
        self.last = Some(summary);
    }

    /// The verified suffix of links signed by `fp`. Empty unless the
    /// tail link's signature has been verified.
    pub fn verified_chain_links(&self, fp: &PgpFingerprint) -> &[ChainLink] {
        let Some(last) = self.links.last() else {
            return &[];
        };
        if !last.sig_verified() {
            return &[];
        }
        let mut start = self.links.len();
        for i in (0..self.links.len()).rev() {
            if !self.links[i].match_fingerprint(fp) {
                break;
            }
            start = i;
        }
        &self.links[start..]
    }

    /// Fetch links above our local height and reconcile them with the
    /// Merkle triple. Returns the new dirty tail for the caller to
    /// persist.
    pub fn load_from_server(
        &mut self,
        env: &Env,
        t: Option<&MerkleTriple>,
    ) -> Result<Option<LinkSummary>> {
        let low = self.last_seqno();
        let uid_s = self.uid.to_hex();
        debug!("+ load sigchain from server (uid={uid_s}, low={low})");

        let res = env.api.get(
            &ApiArg::new("sig/get")
                .arg("uid", uid_s)
                .arg("low", low.to_string()),
        )?;
        let sigs = res
            .get("sigs")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::Parse("sig/get response has no sigs array".into()))?;
        debug!("| got back {} new entries", sigs.len());

        let mut found_tail = false;
        let mut links: Vec<ChainLink> = Vec::new();
        for v in sigs {
            let link = ChainLink::import_from_server(v)?;
            if link.seqno() <= low {
                continue;
            }
            if !found_tail {
                if let Some(t) = t {
                    found_tail = link.check_against_merkle_tree(t)?;
                }
            }
            links.push(link);
        }

        if let Some(t) = t {
            if !found_tail {
                return Err(Error::ServerChain(format!(
                    "failed to reach ({}, {}) in server response",
                    t.link_id, t.seqno
                )));
            }
        }

        let dirty_tail = links.last().map(ChainLink::to_link_summary);
        if let (Some(last), Some(dirty)) = (&self.last, &dirty_tail) {
            // Materialised links supersede the cached tail pointer.
            if last.less(dirty) {
                debug!("| clear cached last ({} < {})", last.seqno, dirty.seqno);
                self.last = None;
            }
        }
        self.links.extend(links);
        debug!("- load sigchain from server ok");
        Ok(dirty_tail)
    }

    /// Walk newest to oldest, stopping at the first link already
    /// chain-verified: payload hash, prev pointer, seqno step, and
    /// identity binding must all hold.
    pub fn verify_chain(&mut self) -> Result<()> {
        for i in (0..self.links.len()).rev() {
            if self.links[i].chain_verified() {
                break;
            }
            self.links[i].verify_link()?;
            if i > 0 {
                let prev_id = *self.links[i - 1].id();
                let prev_seqno = self.links[i - 1].seqno();
                if self.links[i].prev() != Some(&prev_id)
                    || self.links[i].seqno() != prev_seqno + 1
                {
                    return Err(Error::Chain(format!(
                        "chain mismatch at seqno={}",
                        self.links[i].seqno()
                    )));
                }
            }
            self.links[i].check_name_and_id(&self.username, &self.uid)?;
            self.links[i].mark_chain_verified();
        }
        Ok(())
    }

    fn scan_id(&self, fp: &PgpFingerprint) -> (bool, bool) {
        let mut searched = false;
        for link in self.links.iter().rev() {
            if !link.match_fingerprint(fp) {
                break;
            }
            searched = true;
            if link.match_uid_and_username(&self.uid, &self.username) {
                return (true, true);
            }
        }
        (false, searched)
    }

    /// Prove the chain binds to `(uid, username)`: a self-assertion in
    /// the suffix signed by this key, or failing any such links, a
    /// `<username>@keybase.io` self-signature on the key itself.
    pub fn verify_id(&mut self, key: &PgpKeyBundle) -> Result<()> {
        if self.id_verified {
            return Ok(());
        }
        let fp = key.fingerprint()?;
        let (good, searched) = self.scan_id(&fp);
        if good || (!searched && key.find_keybase_username(&self.username)) {
            self.id_verified = true;
            return Ok(());
        }
        Err(Error::Identity(format!(
            "no proof of uid {} for user {} with key {}",
            self.uid, self.username, fp
        )))
    }

    pub fn id_verified(&self) -> bool {
        self.id_verified
    }

    /// Chain verification, identity binding, and a tail signature
    /// check. Returns whether the tail signature was already cached as
    /// verified.
    pub fn verify_with_key(&mut self, key: Option<&PgpKeyBundle>) -> Result<bool> {
        let uid_s = self.uid.to_hex();
        debug!("+ verify_with_key for user {uid_s}");
        self.verify_chain()?;
        let Some(key) = key else {
            debug!("| verify_with_key short-circuit, no key available");
            return Ok(false);
        };
        self.verify_id(key)?;
        let mut cached = false;
        if let Some(last) = self.links.last_mut() {
            cached = last.verify_sig(key)?;
        }
        debug!("- verify_with_key for user {uid_s} ok");
        Ok(cached)
    }

    /// Persist links newest to oldest, stopping at the first one
    /// already stored. Links are immutable once stored.
    pub fn store(&mut self, db: &dyn LocalDb) -> Result<()> {
        for link in self.links.iter_mut().rev() {
            if !link.store(db)? {
                break;
            }
        }
        Ok(())
    }

    /// Compare our height against the authoritative Merkle triple.
    /// `Ok(true)` means nothing to fetch.
    pub fn check_freshness(&self, t: Option<&MerkleTriple>) -> Result<bool> {
        let a = self.last_seqno();
        let current = match t {
            None if a > 0 => {
                return Err(Error::ServerChain(format!(
                    "server claimed not to have this user in its tree (we had v={a})"
                )));
            }
            None => false,
            Some(t) if t.seqno < a => {
                return Err(Error::ServerChain(format!(
                    "version-rollback suspected: local {a} > {}",
                    t.seqno
                )));
            }
            Some(t) if t.seqno == a => {
                debug!("| local chain version is up-to-date @ version {a}");
                match self.last_id() {
                    None => {
                        return Err(Error::ServerChain(
                            "failed to read last link for user".into(),
                        ));
                    }
                    Some(last) if last != t.link_id => {
                        return Err(Error::ServerChain(
                            "the server returned the wrong sigchain tail".into(),
                        ));
                    }
                    Some(_) => true,
                }
            }
            Some(t) => {
                debug!("| local chain version is out-of-date: {a} < {}", t.seqno);
                false
            }
        };
        debug!("| check_freshness ({}) -> {current}", self.uid);
        Ok(current)
    }
}

/// What the loader needs to know about the user being loaded.
#[derive(Clone)]
pub struct UserInfo {
    pub uid: Uid,
    pub username: String,

    /// Fingerprint of the user's active PGP key, when one is known.
    pub active_fingerprint: Option<PgpFingerprint>,

    /// The active key itself, for identity and signature checks.
    pub active_key: Option<PgpKeyBundle>,
}

/// Runs the fixed load sequence for one user. The loader keeps the
/// chain it built, so a failed load still hands back the partial
/// result.
pub struct SigChainLoader<'e> {
    env: &'e Env,
    user: UserInfo,
    all_keys: bool,
    leaf: Option<MerkleUserLeaf>,
    chain_type: &'static ChainType,
    fp: Option<PgpFingerprint>,
    links: Vec<ChainLink>,
    chain: Option<SigChain>,
    dirty_tail: Option<LinkSummary>,
}

impl<'e> SigChainLoader<'e> {
    pub fn new(
        env: &'e Env,
        user: UserInfo,
        all_keys: bool,
        leaf: Option<MerkleUserLeaf>,
    ) -> Self {
        Self {
            env,
            user,
            all_keys,
            leaf,
            chain_type: &PUBLIC_CHAIN,
            fp: None,
            links: Vec::new(),
            chain: None,
            dirty_tail: None,
        }
    }

    fn uid_string(&self) -> String {
        self.user.uid.to_hex()
    }

    fn tail_db_key(&self) -> DbKey {
        DbKey::new(self.chain_type.db_type, self.uid_string())
    }

    fn get_fingerprint(&mut self) -> Result<()> {
        self.fp = self.user.active_fingerprint;
        Ok(())
    }

    fn load_last_link_id_from_storage(&self) -> Result<Option<LinkSummary>> {
        match self.env.db.get(&self.tail_db_key())? {
            None => {
                debug!("| last link id was null");
                Ok(None)
            }
            Some(bytes) => Ok(Some(LinkSummary::from_json_bytes(&bytes)?)),
        }
    }

    /// Walk backwards from the stored tail, resolving links from the
    /// blob store. With a fingerprint filter active, stop at the first
    /// link signed by some other key; older links belong to a
    /// superseded view unless `all_keys` is set.
    fn load_links_from_storage(&mut self) -> Result<()> {
        let uid_s = self.uid_string();
        debug!("+ load links from storage ({uid_s})");
        let Some(ls) = self.load_last_link_id_from_storage()? else {
            debug!("| no stored tail summary");
            return Ok(());
        };
        if self.fp.is_none() && !self.all_keys {
            debug!("| current fingerprint is nil; short-circuiting local load");
            return Ok(());
        }
        let mut links = Vec::new();
        let mut curr = Some(ls.id);
        while let Some(id) = curr {
            debug!("| loading link; curr={id}");
            let link = ChainLink::import_from_storage(self.env.db.as_ref(), &id)?;
            if !self.all_keys {
                if let Some(fp) = &self.fp {
                    if link.fingerprint() != Some(fp) {
                        debug!("| stop loading at fingerprint != {fp}");
                        break;
                    }
                }
            }
            curr = link.prev().copied();
            links.push(link);
        }
        links.reverse();
        self.links = links;
        debug!("- load links from storage ({uid_s}) ok");
        Ok(())
    }

    fn make_sig_chain(&mut self) {
        let mut chain = SigChain::new(self.user.uid.clone(), self.user.username.clone());
        chain.links = std::mem::take(&mut self.links);
        self.chain = Some(chain);
    }

    fn merkle_triple(&self) -> Option<MerkleTriple> {
        self.leaf
            .as_ref()
            .and_then(|leaf| self.chain_type.merkle_triple(leaf).copied())
    }

    fn verify_sig(&mut self) -> Result<()> {
        let Some(fp) = self.fp else {
            return Ok(());
        };
        let key = self.user.active_key.as_ref().ok_or_else(|| {
            Error::NoKey(format!("no active key for user {}", self.user.username))
        })?;
        key.check_fingerprint(&fp)?;
        let chain = self.chain.as_mut().expect("make_sig_chain ran first");
        chain.verify_with_key(Some(key))?;
        Ok(())
    }

    fn store_tail(&mut self) -> Result<()> {
        let Some(dirty) = &self.dirty_tail else {
            return Ok(());
        };
        self.env.db.put(&self.tail_db_key(), &dirty.to_json_bytes())?;
        self.dirty_tail = None;
        Ok(())
    }

    fn store(&mut self) -> Result<()> {
        self.store_tail()?;
        let chain = self.chain.as_mut().expect("make_sig_chain ran first");
        chain.store(self.env.db.as_ref())
    }

    /// The fixed load sequence. Any stage failure aborts; the chain
    /// built so far stays on the loader.
    pub fn load(&mut self) -> Result<()> {
        let uid_s = self.uid_string();
        debug!("+ loader.load({uid_s})");
        let stage = |s: &str| debug!("| loader.load({uid_s}) {s}");

        stage("get_fingerprint");
        self.get_fingerprint()?;
        stage("load_links_from_storage");
        self.load_links_from_storage()?;
        stage("make_sig_chain");
        self.make_sig_chain();
        stage("verify_chain");
        self.chain.as_mut().expect("just made").verify_chain()?;
        stage("check_freshness");
        let t = self.merkle_triple();
        let current = self
            .chain
            .as_ref()
            .expect("just made")
            .check_freshness(t.as_ref())?;
        if current {
            debug!("- loader.load({uid_s}) ok, already current");
            return Ok(());
        }
        stage("load_from_server");
        self.dirty_tail = self
            .chain
            .as_mut()
            .expect("just made")
            .load_from_server(self.env, t.as_ref())?;
        stage("verify_chain");
        self.chain.as_mut().expect("just made").verify_chain()?;
        stage("store");
        self.chain
            .as_mut()
            .expect("just made")
            .store(self.env.db.as_ref())?;
        stage("verify_sig");
        self.verify_sig()?;
        stage("store");
        self.store()?;
        debug!("- loader.load({uid_s}) ok");
        Ok(())
    }

    /// The chain built so far; partial if a load stage failed.
    pub fn chain(&self) -> Option<&SigChain> {
        self.chain.as_ref()
    }

    pub fn into_chain(self) -> Option<SigChain> {
        self.chain
    }
}

/// Load, verify, and persist one user's sigchain.
pub fn load_sig_chain(
    env: &Env,
    user: UserInfo,
    all_keys: bool,
    leaf: Option<MerkleUserLeaf>,
) -> Result<SigChain> {
    let mut loader = SigChainLoader::new(env, user, all_keys, leaf);
    loader.load()?;
    Ok(loader.into_chain().expect("load succeeded"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::ChainLink;
    use crate::testhelpers::{LinkFactory, random_link_id};

    fn chain_of(factory_links: &[serde_json::Value]) -> SigChain {
        let mut chain = SigChain::new(
            Uid::from_hex(crate::testhelpers::TEST_UID).unwrap(),
            crate::testhelpers::TEST_USERNAME,
        );
        chain.links = factory_links
            .iter()
            .map(|v| ChainLink::import_from_server(v).unwrap())
            .collect();
        chain
    }

    #[test]
    fn test_verify_chain_accepts_good_links() {
        let mut factory = LinkFactory::new(&[1; 32]);
        let links = vec![
            factory.eldest_link(),
            factory.proof_link(),
            factory.proof_link(),
        ];
        let mut chain = chain_of(&links);
        chain.verify_chain().unwrap();
        assert!(chain.links().iter().all(ChainLink::chain_verified));
        assert_eq!(chain.last_seqno(), 3);
        assert_eq!(chain.last_id(), factory.last_id());
    }

    #[test]
    fn test_verify_chain_rejects_broken_prev() {
        let mut factory = LinkFactory::new(&[2; 32]);
        let first = factory.eldest_link();
        factory.set_prev(Some(random_link_id()));
        let second = factory.proof_link();
        let mut chain = chain_of(&[first, second]);
        let err = chain.verify_chain().unwrap_err();
        assert!(matches!(err, Error::Chain(ref m) if m == "chain mismatch at seqno=2"));
    }

    #[test]
    fn test_verify_chain_rejects_wrong_user() {
        let mut factory = LinkFactory::with_user(&[3; 32], "00112233445566778899aabbccddeeff", "eve");
        let links = vec![factory.eldest_link()];
        let mut chain = chain_of(&links); // chain claims TEST_UID/max
        let err = chain.verify_chain().unwrap_err();
        assert!(matches!(err, Error::Identity(_)));
    }

    #[test]
    fn test_bump_advances_tail() {
        let mut factory = LinkFactory::new(&[4; 32]);
        let links = vec![factory.eldest_link()];
        let mut chain = chain_of(&links);
        assert_eq!(chain.last_seqno(), 1);
        let new_id = random_link_id();
        chain.bump(new_id);
        assert_eq!(chain.last_seqno(), 2);
        assert_eq!(chain.last_id(), Some(new_id));
    }

    #[test]
    fn test_freshness_new_user() {
        let chain = chain_of(&[]);
        assert!(!chain.check_freshness(None).unwrap());
    }

    #[test]
    fn test_freshness_server_dropped_user() {
        let mut factory = LinkFactory::new(&[5; 32]);
        let links = vec![factory.eldest_link()];
        let chain = chain_of(&links);
        let err = chain.check_freshness(None).unwrap_err();
        assert!(matches!(err, Error::ServerChain(ref m) if m.contains("claimed not to have")));
    }

    #[test]
    fn test_freshness_rollback() {
        let mut factory = LinkFactory::new(&[6; 32]);
        let links = vec![
            factory.eldest_link(),
            factory.proof_link(),
            factory.proof_link(),
        ];
        let chain = chain_of(&links);
        let t = MerkleTriple {
            seqno: 2,
            link_id: random_link_id(),
        };
        let err = chain.check_freshness(Some(&t)).unwrap_err();
        assert!(matches!(err, Error::ServerChain(ref m) if m.contains("version-rollback")));
    }

    #[test]
    fn test_freshness_current_with_matching_tail() {
        let mut factory = LinkFactory::new(&[7; 32]);
        let links = vec![factory.eldest_link(), factory.proof_link()];
        let chain = chain_of(&links);
        let t = MerkleTriple {
            seqno: 2,
            link_id: factory.last_id().unwrap(),
        };
        assert!(chain.check_freshness(Some(&t)).unwrap());
    }

    #[test]
    fn test_freshness_current_but_wrong_tail() {
        let mut factory = LinkFactory::new(&[8; 32]);
        let links = vec![factory.eldest_link(), factory.proof_link()];
        let chain = chain_of(&links);
        let t = MerkleTriple {
            seqno: 2,
            link_id: random_link_id(),
        };
        let err = chain.check_freshness(Some(&t)).unwrap_err();
        assert!(matches!(err, Error::ServerChain(ref m) if m.contains("wrong sigchain tail")));
    }

    #[test]
    fn test_freshness_stale_forward() {
        let mut factory = LinkFactory::new(&[9; 32]);
        let links = vec![factory.eldest_link()];
        let chain = chain_of(&links);
        let t = MerkleTriple {
            seqno: 4,
            link_id: random_link_id(),
        };
        assert!(!chain.check_freshness(Some(&t)).unwrap());
    }

    #[test]
    fn test_verified_chain_links_needs_verified_tail() {
        let mut factory = LinkFactory::new(&[10; 32]);
        let links = vec![factory.eldest_link()];
        let mut chain = chain_of(&links);
        let fp = crate::testhelpers::random_fingerprint();
        assert!(chain.verified_chain_links(&fp).is_empty());
        let key = factory.generic_key();
        chain.links[0].verify_sig(&key).unwrap();
        // Still empty: these NaCl links carry no fingerprint.
        assert!(chain.verified_chain_links(&fp).is_empty());
    }
}
