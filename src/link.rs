//! Chain links: one entry of a user's tamper-evident log.
//!
//! A link arrives either from the server (`sig/get`) or from the local
//! blob store. Either way it is checked on import: the payload must
//! hash to the claimed link id, and the envelope must agree with the
//! embedded payload. Verification flags (`sig_verified`,
//! `chain_verified`) are the only mutation a link sees after import;
//! links are immutable once stored.

use crate::chain::MerkleTriple;
use crate::errors::{Error, Result};
use crate::keyfamily::KeybaseTime;
use crate::keys::SigVerifier;
use crate::kid::{Kid, LinkId, PgpFingerprint, SigId, Uid};
use crate::store::{DbKey, LocalDb};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Wire form shared by the server response and local storage. Unknown
/// keys are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkWire {
    pub seqno: u64,
    pub payload_json: String,
    pub sig: String,
    pub sig_id: String,
    #[serde(default)]
    pub payload_hash: Option<String>,
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub prev: Option<String>,
}

/// The signed payload, decoded. Missing required fields are parse
/// errors; unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkPayload {
    pub seqno: u64,
    #[serde(default)]
    pub prev: Option<String>,
    #[serde(default)]
    pub ctime: i64,
    pub body: PayloadBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayloadBody {
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default)]
    pub key: PayloadKey,
    #[serde(default)]
    pub sibkey: Option<DelegatedKeySection>,
    #[serde(default)]
    pub subkey: Option<DelegatedKeySection>,
    #[serde(default)]
    pub revoke: Option<RevokeSection>,
    #[serde(default)]
    pub merkle_root: Option<MerkleRootSection>,
}

/// The key section: who signed this link, and for which user.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PayloadKey {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub eldest_kid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DelegatedKeySection {
    pub kid: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RevokeSection {
    #[serde(default)]
    pub sig_ids: Vec<String>,
    #[serde(default)]
    pub kids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MerkleRootSection {
    #[serde(default)]
    pub seqno: u64,
}

/// What a link does to the key state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// First link: the eldest key asserting itself.
    Eldest,
    /// Delegation of a sibling signing key.
    Sibkey,
    /// Delegation of a subordinate key.
    Subkey,
    /// Revocation of earlier delegations.
    Revoke,
    /// Everything else (proofs, tracking, ...): no key effect.
    Other,
}

/// Compact `(id, seqno)` tail pointer, cached so a freshness probe
/// does not have to load the whole chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSummary {
    pub id: LinkId,
    pub seqno: u64,
}

impl LinkSummary {
    pub fn to_json_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("a plain struct always serializes")
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn less(&self, other: &LinkSummary) -> bool {
        self.seqno < other.seqno
    }
}

fn nonempty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.is_empty())
}

/// One entry in a user's tamper-evident log.
#[derive(Debug, Clone)]
pub struct ChainLink {
    id: LinkId,
    seqno: u64,
    prev: Option<LinkId>,
    sig: String,
    sig_id: SigId,
    kid: Option<Kid>,
    fingerprint: Option<PgpFingerprint>,
    payload_json: String,
    payload: LinkPayload,
    sig_verified: bool,
    chain_verified: bool,
    did_store: bool,
}

impl ChainLink {
    /// Check a wire form over and build the link. The link id is
    /// always recomputed from the payload; a `payload_hash` claim and
    /// the envelope fields must agree with the payload.
    fn from_wire(wire: LinkWire, from_storage: bool) -> Result<Self> {
        let payload: LinkPayload = serde_json::from_str(&wire.payload_json)
            .map_err(|err| Error::Parse(format!("link payload at seqno={}: {err}", wire.seqno)))?;

        let id = LinkId::hash_of(wire.payload_json.as_bytes());
        if let Some(claimed) = nonempty(wire.payload_hash) {
            if LinkId::from_hex(&claimed)? != id {
                return Err(Error::Chain(format!(
                    "payload hash mismatch at seqno={}",
                    wire.seqno
                )));
            }
        }
        if wire.seqno != payload.seqno {
            return Err(Error::Chain(format!(
                "envelope seqno={} but payload says {}",
                wire.seqno, payload.seqno
            )));
        }

        let prev = match nonempty(payload.prev.clone()) {
            Some(hx) => Some(LinkId::from_hex(&hx)?),
            None => None,
        };
        if let Some(outer) = nonempty(wire.prev) {
            if Some(LinkId::from_hex(&outer)?) != prev {
                return Err(Error::Chain(format!(
                    "envelope prev disagrees with payload at seqno={}",
                    wire.seqno
                )));
            }
        }

        let kid = match nonempty(wire.kid).or_else(|| payload.body.key.kid.clone()) {
            Some(hx) => Some(Kid::from_hex(&hx)?),
            None => None,
        };
        let fingerprint = match nonempty(wire.fingerprint)
            .or_else(|| payload.body.key.fingerprint.clone())
        {
            Some(hx) => Some(PgpFingerprint::from_hex(&hx)?),
            None => None,
        };

        Ok(Self {
            id,
            seqno: wire.seqno,
            prev,
            sig: wire.sig,
            sig_id: SigId::from_hex(&wire.sig_id)?,
            kid,
            fingerprint,
            payload_json: wire.payload_json,
            payload,
            sig_verified: false,
            chain_verified: false,
            did_store: from_storage,
        })
    }

    /// Import one element of a `sig/get` response.
    pub fn import_from_server(v: &serde_json::Value) -> Result<Self> {
        Self::from_wire(serde_json::from_value(v.clone())?, false)
    }

    /// Resolve a link from the blob store by its content address.
    pub fn import_from_storage(db: &dyn LocalDb, id: &LinkId) -> Result<Self> {
        let bytes = db
            .get(&DbKey::chain_link(id))?
            .ok_or_else(|| Error::Chain(format!("link {id} missing from local store")))?;
        let wire: LinkWire = serde_json::from_slice(&bytes)?;
        let link = Self::from_wire(wire, true)?;
        if link.id != *id {
            return Err(Error::Chain(format!(
                "stored link {id} hashes to {}",
                link.id
            )));
        }
        Ok(link)
    }

    pub fn id(&self) -> &LinkId {
        &self.id
    }

    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    pub fn prev(&self) -> Option<&LinkId> {
        self.prev.as_ref()
    }

    pub fn sig_id(&self) -> &SigId {
        &self.sig_id
    }

    pub fn kid(&self) -> Option<&Kid> {
        self.kid.as_ref()
    }

    pub fn fingerprint(&self) -> Option<&PgpFingerprint> {
        self.fingerprint.as_ref()
    }

    pub fn payload(&self) -> &LinkPayload {
        &self.payload
    }

    pub fn sig_verified(&self) -> bool {
        self.sig_verified
    }

    pub fn chain_verified(&self) -> bool {
        self.chain_verified
    }

    pub(crate) fn mark_chain_verified(&mut self) {
        self.chain_verified = true;
    }

    pub fn did_store(&self) -> bool {
        self.did_store
    }

    pub fn to_link_summary(&self) -> LinkSummary {
        LinkSummary {
            id: self.id,
            seqno: self.seqno,
        }
    }

    /// Is this the chain tail the Merkle tree committed to? Finding
    /// the committed id at the wrong height is not a miss, it is an
    /// error.
    pub fn check_against_merkle_tree(&self, t: &MerkleTriple) -> Result<bool> {
        if self.id != t.link_id {
            Ok(false)
        } else if self.seqno != t.seqno {
            Err(Error::ServerChain(format!(
                "tail {} found at seqno={}, tree says {}",
                self.id, self.seqno, t.seqno
            )))
        } else {
            Ok(true)
        }
    }

    /// Recheck that the payload hashes to this link's id.
    pub fn verify_link(&self) -> Result<()> {
        if LinkId::hash_of(self.payload_json.as_bytes()) != self.id {
            return Err(Error::Chain(format!(
                "payload hash mismatch at seqno={}",
                self.seqno
            )));
        }
        Ok(())
    }

    pub fn match_uid_and_username(&self, uid: &Uid, username: &str) -> bool {
        let key = &self.payload.body.key;
        key.username == username && key.uid == uid.to_hex()
    }

    /// Error unless this link binds to the given user.
    pub fn check_name_and_id(&self, username: &str, uid: &Uid) -> Result<()> {
        if self.match_uid_and_username(uid, username) {
            Ok(())
        } else {
            let key = &self.payload.body.key;
            Err(Error::Identity(format!(
                "link at seqno={} is for {}/{}, expected {}/{}",
                self.seqno, key.username, key.uid, username, uid
            )))
        }
    }

    pub fn match_fingerprint(&self, fp: &PgpFingerprint) -> bool {
        self.fingerprint.as_ref() == Some(fp)
    }

    /// Verify the signature over the payload. Returns whether the
    /// verification was already cached; a fresh failure is an error.
    pub fn verify_sig(&mut self, key: &dyn SigVerifier) -> Result<bool> {
        if self.sig_verified {
            debug!("| sig at seqno={} verified from cache", self.seqno);
            return Ok(true);
        }
        let (sig_id, ok) = key.verify_detached(self.payload_json.as_bytes(), &self.sig)?;
        if !ok {
            return Err(Error::Chain(format!(
                "signature verification failed at seqno={}",
                self.seqno
            )));
        }
        if sig_id != self.sig_id {
            return Err(Error::Chain(format!(
                "sig id mismatch at seqno={}",
                self.seqno
            )));
        }
        self.sig_verified = true;
        Ok(false)
    }

    /// Persist under the link's content address. Returns false when
    /// the link was already stored; stored links never change.
    pub fn store(&mut self, db: &dyn LocalDb) -> Result<bool> {
        if self.did_store {
            return Ok(false);
        }
        let wire = LinkWire {
            seqno: self.seqno,
            payload_json: self.payload_json.clone(),
            sig: self.sig.clone(),
            sig_id: self.sig_id.to_hex(),
            payload_hash: Some(self.id.to_hex()),
            kid: self.kid.as_ref().map(Kid::to_hex),
            fingerprint: self.fingerprint.as_ref().map(PgpFingerprint::to_hex),
            prev: self.prev.as_ref().map(LinkId::to_hex),
        };
        db.put(&DbKey::chain_link(&self.id), &serde_json::to_vec(&wire)?)?;
        self.did_store = true;
        Ok(true)
    }

    /// What this link does to the key state.
    pub fn kind(&self) -> LinkKind {
        match self.payload.body.typ.as_str() {
            "eldest" => LinkKind::Eldest,
            "sibkey" => LinkKind::Sibkey,
            "subkey" => LinkKind::Subkey,
            "revoke" => LinkKind::Revoke,
            _ => LinkKind::Other,
        }
    }

    /// The KID this link delegates, for delegation kinds.
    pub fn delegated_kid(&self) -> Result<Kid> {
        let hx = match self.kind() {
            LinkKind::Eldest => self.payload.body.key.kid.clone(),
            LinkKind::Sibkey => self.payload.body.sibkey.as_ref().map(|s| s.kid.clone()),
            LinkKind::Subkey => self.payload.body.subkey.as_ref().map(|s| s.kid.clone()),
            _ => None,
        };
        match hx {
            Some(hx) => Kid::from_hex(&hx),
            None => Err(Error::Parse(format!(
                "link at seqno={} delegates nothing",
                self.seqno
            ))),
        }
    }

    /// The KID that signed this link.
    pub fn delegating_kid(&self) -> Result<Kid> {
        match &self.kid {
            Some(kid) => Ok(kid.clone()),
            None => Err(Error::Parse(format!(
                "no signing kid on link at seqno={}",
                self.seqno
            ))),
        }
    }

    /// Wall-clock time and Merkle seqno, as far as the link records
    /// them.
    pub fn keybase_time(&self) -> KeybaseTime {
        KeybaseTime {
            unix: self.payload.ctime,
            chain: self
                .payload
                .body
                .merkle_root
                .as_ref()
                .map_or(0, |m| m.seqno),
        }
    }

    pub fn revoked_sig_ids(&self) -> Result<Vec<SigId>> {
        match &self.payload.body.revoke {
            None => Ok(Vec::new()),
            Some(rev) => rev.sig_ids.iter().map(|s| SigId::from_hex(s)).collect(),
        }
    }

    pub fn revoked_kids(&self) -> Result<Vec<Kid>> {
        match &self.payload.body.revoke {
            None => Ok(Vec::new()),
            Some(rev) => rev.kids.iter().map(|s| Kid::from_hex(s)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemDb;
    use crate::testhelpers::LinkFactory;

    #[test]
    fn test_import_from_server() {
        let mut factory = LinkFactory::new(&[1; 32]);
        let v = factory.eldest_link();
        let link = ChainLink::import_from_server(&v).unwrap();
        assert_eq!(link.seqno(), 1);
        assert!(link.prev().is_none());
        assert_eq!(link.kind(), LinkKind::Eldest);
        assert!(!link.sig_verified());
        assert!(!link.chain_verified());
        assert!(!link.did_store());
        link.verify_link().unwrap();
    }

    #[test]
    fn test_bad_payload_hash_rejected() {
        let mut factory = LinkFactory::new(&[2; 32]);
        let mut v = factory.eldest_link();
        v["payload_hash"] = serde_json::json!(LinkId::hash_of(b"something else").to_hex());
        let err = ChainLink::import_from_server(&v).unwrap_err();
        assert!(matches!(err, Error::Chain(ref m) if m.contains("payload hash mismatch")));
    }

    #[test]
    fn test_envelope_payload_seqno_disagreement() {
        let mut factory = LinkFactory::new(&[3; 32]);
        let mut v = factory.eldest_link();
        v["seqno"] = serde_json::json!(9);
        let err = ChainLink::import_from_server(&v).unwrap_err();
        assert!(matches!(err, Error::Chain(_)));
    }

    #[test]
    fn test_verify_sig_and_cache() {
        let mut factory = LinkFactory::new(&[4; 32]);
        let v = factory.eldest_link();
        let mut link = ChainLink::import_from_server(&v).unwrap();
        let key = factory.generic_key();

        let cached = link.verify_sig(&key).unwrap();
        assert!(!cached);
        assert!(link.sig_verified());
        let cached = link.verify_sig(&key).unwrap();
        assert!(cached);
    }

    #[test]
    fn test_verify_sig_rejects_wrong_key() {
        let mut factory = LinkFactory::new(&[5; 32]);
        let v = factory.eldest_link();
        let mut link = ChainLink::import_from_server(&v).unwrap();
        let other = LinkFactory::new(&[6; 32]).generic_key();
        let err = link.verify_sig(&other).unwrap_err();
        assert!(matches!(err, Error::Chain(ref m) if m.contains("verification failed")));
        assert!(!link.sig_verified());
    }

    #[test]
    fn test_storage_roundtrip_is_content_addressed() {
        let db = MemDb::new();
        let mut factory = LinkFactory::new(&[7; 32]);
        let v = factory.eldest_link();
        let mut link = ChainLink::import_from_server(&v).unwrap();

        assert!(link.store(&db).unwrap());
        assert!(!link.store(&db).unwrap()); // second store is a no-op

        let loaded = ChainLink::import_from_storage(&db, link.id()).unwrap();
        assert_eq!(loaded.id(), link.id());
        assert_eq!(loaded.seqno(), link.seqno());
        assert!(loaded.did_store());
    }

    #[test]
    fn test_missing_link_in_storage() {
        let db = MemDb::new();
        let id = LinkId::hash_of(b"never stored");
        let err = ChainLink::import_from_storage(&db, &id).unwrap_err();
        assert!(matches!(err, Error::Chain(ref m) if m.contains("missing")));
    }

    #[test]
    fn test_link_summary_json_roundtrip() {
        let summary = LinkSummary {
            id: LinkId::hash_of(b"tail"),
            seqno: 42,
        };
        let bytes = summary.to_json_bytes();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"id\""));
        assert!(text.contains("\"seqno\":42"));
        assert_eq!(LinkSummary::from_json_bytes(&bytes).unwrap(), summary);
        assert!(LinkSummary { seqno: 41, ..summary }.less(&summary));
    }

    #[test]
    fn test_delegation_accessors() {
        let mut factory = LinkFactory::new(&[8; 32]);
        let _ = factory.eldest_link();
        let delegated = crate::testhelpers::random_nacl_kid();
        let v = factory.sibkey_link(&delegated);
        let link = ChainLink::import_from_server(&v).unwrap();
        assert_eq!(link.kind(), LinkKind::Sibkey);
        assert_eq!(link.delegated_kid().unwrap(), delegated);
        assert_eq!(link.delegating_kid().unwrap(), factory.kid());
        assert_eq!(link.keybase_time().unix, link.payload().ctime);
    }

    #[test]
    fn test_revocation_accessors() {
        let mut factory = LinkFactory::new(&[9; 32]);
        let _ = factory.eldest_link();
        let sig_id = SigId::hash_of(b"some delegation sig");
        let kid = crate::testhelpers::random_nacl_kid();
        let v = factory.revoke_link(&[sig_id], &[kid.clone()]);
        let link = ChainLink::import_from_server(&v).unwrap();
        assert_eq!(link.kind(), LinkKind::Revoke);
        assert_eq!(link.revoked_sig_ids().unwrap(), vec![sig_id]);
        assert_eq!(link.revoked_kids().unwrap(), vec![kid]);
    }
}
