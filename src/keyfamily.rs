//! Key families and the computed key state that falls out of replaying
//! a verified sigchain.
//!
//! A [`KeyFamily`] is the raw server-provided map of sibkeys and
//! subkeys. Replaying a chain over it yields [`ComputedKeyInfos`]: per
//! key, whether it is live or revoked, whether it is a sibkey, and
//! which signatures delegated it. The computed state is rebuilt from
//! scratch on every replay; the family is immutable after import.

use crate::errors::{Error, Result};
use crate::keys::{GenericKey, KID_NACL_DH, KID_NACL_EDDSA, NaclDhKeyPair, NaclSigningKeyPair, is_pgp_algo};
use crate::kid::{Fokid, Kid, PgpFingerprint, SigId};
use crate::link::{ChainLink, LinkKind};
use crate::pgp::{PgpKeyBundle, keybase_email};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Per-key replay status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Live,
    Revoked,
}

/// Wall-clock seconds alongside a Merkle chain seqno.
///
/// Clocks drift; when both sides record it, the chain seqno is the
/// authoritative order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeybaseTime {
    pub unix: i64,
    pub chain: u64,
}

/// One key record as the server returns it from a user lookup.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerKeyRecord {
    pub kid: String,
    #[serde(default)]
    pub key_type: u32,
    pub bundle: String,
    #[serde(default)]
    pub mtime: i64,
    #[serde(default)]
    pub ctime: i64,
    #[serde(default)]
    pub etime: i64,
    #[serde(rename = "key_fingerprint", default)]
    pub pgp_fingerprint: String,
    #[serde(default)]
    pub signing_kid: Option<String>,
    #[serde(default)]
    pub eldest_kid: Option<String>,
    #[serde(default)]
    pub key_level: i32,
    #[serde(default)]
    pub status: i32,
    #[serde(default)]
    pub key_bits: u32,
    pub key_algo: u32,

    /// The materialised key, populated by [`ServerKeyRecord::import`].
    #[serde(skip)]
    pub key: Option<GenericKey>,
}

impl ServerKeyRecord {
    /// Materialise the bundle into a usable key, dispatching on the
    /// algorithm tag. Returns the PGP bundle for the family's PGP
    /// list when this is a PGP record.
    pub fn import(&mut self) -> Result<Option<PgpKeyBundle>> {
        let (key, pgp) = match self.key_algo {
            a if is_pgp_algo(a) => {
                let pgp = PgpKeyBundle::from_armored(&self.bundle)?;
                (GenericKey::Pgp(pgp.clone()), Some(pgp))
            }
            KID_NACL_EDDSA => (
                GenericKey::NaclSigning(NaclSigningKeyPair::import(&self.bundle)?),
                None,
            ),
            KID_NACL_DH => (
                GenericKey::NaclDh(NaclDhKeyPair::import(&self.bundle)?),
                None,
            ),
            other => {
                return Err(Error::BadKey(format!("algo={other} is unknown")));
            }
        };
        debug!("imported key {}", key.kid());
        self.key = Some(key);
        Ok(pgp)
    }
}

/// Hex KID to server key record.
pub type KeyMap = BTreeMap<String, ServerKeyRecord>;

fn import_key_map(km: &mut KeyMap, pgps: &mut Vec<PgpKeyBundle>) -> Result<()> {
    for rec in km.values_mut() {
        if let Some(pgp) = rec.import()? {
            pgps.push(pgp);
        }
    }
    Ok(())
}

/// A group of sibling keys with equal signing power for one user, plus
/// the subkeys dangling off them.
#[derive(Debug, Deserialize, Default)]
pub struct KeyFamily {
    #[serde(default)]
    pub sibkeys: KeyMap,
    #[serde(default)]
    pub subkeys: KeyMap,

    #[serde(skip)]
    eldest: Option<Fokid>,
    #[serde(skip)]
    pgps: Vec<PgpKeyBundle>,
    #[serde(skip)]
    pgp_to_kid: HashMap<String, Kid>,
}

/// Decode a server key-family blob and import it.
pub fn parse_key_family(v: serde_json::Value) -> Result<KeyFamily> {
    let mut kf: KeyFamily = serde_json::from_value(v)?;
    kf.import()?;
    Ok(kf)
}

impl KeyFamily {
    /// Materialise every record, collect the PGP bundles, index
    /// fingerprints, and run eldest discovery.
    pub fn import(&mut self) -> Result<()> {
        debug!("+ import key family");
        let mut pgps = Vec::new();
        import_key_map(&mut self.sibkeys, &mut pgps)?;
        import_key_map(&mut self.subkeys, &mut pgps)?;
        for pgp in &pgps {
            self.pgp_to_kid.insert(pgp.fingerprint()?.to_hex(), pgp.kid());
        }
        self.pgps = pgps;
        self.find_eldest()?;
        debug!("- import key family ok");
        Ok(())
    }

    /// There can be only one eldest KID in the family.
    fn set_eldest(&mut self, hx: &str) -> Result<()> {
        let kid = Kid::from_hex(hx)?;
        if let Some(f) = &self.eldest {
            if f.eq_kid(&kid) {
                Ok(())
            } else {
                Err(Error::KeyFamily(format!(
                    "kid mismatch: {} != {hx}",
                    f.to_map_key()
                )))
            }
        } else {
            self.eldest = Some(Fokid::from_kid(kid));
            Ok(())
        }
    }

    /// Each sibkey names its eldest: an explicit `eldest_kid`, else its
    /// `signing_kid`, else itself. All of them must agree, and the
    /// winner must itself be a sibkey in the family.
    fn find_eldest(&mut self) -> Result<()> {
        let candidates: Vec<String> = self
            .sibkeys
            .values()
            .map(|rec| {
                rec.eldest_kid
                    .clone()
                    .or_else(|| rec.signing_kid.clone())
                    .unwrap_or_else(|| rec.kid.clone())
            })
            .collect();
        for hx in &candidates {
            self.set_eldest(hx)?;
        }
        if let Some(fokid) = &self.eldest {
            let x = fokid
                .kid
                .as_ref()
                .expect("eldest discovery only produces KID sides")
                .to_hex();
            let rec = self
                .sibkeys
                .get(&x)
                .ok_or_else(|| Error::KeyFamily(format!("eldest KID {x} disappeared")))?;
            if !rec.pgp_fingerprint.is_empty() {
                let fp = PgpFingerprint::from_hex(&rec.pgp_fingerprint)?;
                self.eldest.as_mut().expect("checked above").fp = Some(fp);
            }
        }
        Ok(())
    }

    pub fn eldest(&self) -> Option<&Fokid> {
        self.eldest.as_ref()
    }

    pub fn pgps(&self) -> &[PgpKeyBundle] {
        &self.pgps
    }

    /// Direct sibkey lookup by hex KID.
    pub fn get_signing_key(&self, kid_s: &str) -> Option<&GenericKey> {
        self.sibkeys.get(kid_s).and_then(|rec| rec.key.as_ref())
    }

    /// Resolve a FOKID to a sibkey's materialised key. A
    /// fingerprint-only FOKID goes through the PGP index first.
    pub fn find_active_sibkey(&self, f: &Fokid) -> Result<&GenericKey> {
        let kid = match (&f.kid, &f.fp) {
            (Some(kid), _) => kid.clone(),
            (None, Some(fp)) => self
                .pgp_to_kid
                .get(&fp.to_hex())
                .cloned()
                .ok_or_else(|| Error::NoKey(format!("no KID for PGP fingerprint {fp} found")))?,
            (None, None) => {
                return Err(Error::NoKey("can't look up a sibkey without a KID".into()));
            }
        };
        let kid_s = kid.to_hex();
        let rec = self
            .sibkeys
            .get(&kid_s)
            .ok_or_else(|| Error::NoKey(format!("no sibkey found for {kid_s}")))?;
        rec.key
            .as_ref()
            .ok_or_else(|| Error::BadKey(format!("sibkey {kid_s} was never imported")))
    }

    /// Fresh computed state with the eldest seeded LIVE. Nobody could
    /// have delegated to the eldest, so we take it on faith.
    pub fn new_computed_key_infos(&self) -> ComputedKeyInfos {
        let mut ret = ComputedKeyInfos::default();
        if let Some(eldest) = &self.eldest {
            ret.insert(
                eldest,
                ComputedKeyInfo {
                    status: KeyStatus::Live,
                    eldest: true,
                    sibkey: false,
                    delegations: HashMap::new(),
                    delegated_at: None,
                    revoked_at: None,
                },
            );
        }
        ret
    }
}

/// Replay result for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedKeyInfo {
    pub status: KeyStatus,
    pub eldest: bool,
    pub sibkey: bool,

    /// Every signature that delegated this key, by the KID that signed
    /// it.
    pub delegations: HashMap<SigId, Kid>,
    pub delegated_at: Option<KeybaseTime>,
    pub revoked_at: Option<KeybaseTime>,
}

/// The computed infos, indexed by hex KID (and fingerprint for PGP
/// keys) and by delegating sig id. Both indexes alias the same record.
#[derive(Debug, Clone, Default)]
pub struct ComputedKeyInfos {
    dirty: bool,
    arena: Vec<ComputedKeyInfo>,
    infos: HashMap<String, usize>,
    sigs: HashMap<SigId, usize>,
}

impl ComputedKeyInfos {
    /// Register one info under every identifier the FOKID answers to.
    pub fn insert(&mut self, f: &Fokid, info: ComputedKeyInfo) {
        self.arena.push(info);
        let idx = self.arena.len() - 1;
        for s in f.to_strings() {
            self.infos.insert(s, idx);
        }
        self.dirty = true;
    }

    pub fn get(&self, s: &str) -> Option<&ComputedKeyInfo> {
        self.infos.get(s).map(|&i| &self.arena[i])
    }

    pub fn get_by_sig(&self, sig: &SigId) -> Option<&ComputedKeyInfo> {
        self.sigs.get(sig).map(|&i| &self.arena[i])
    }

    /// Has the structure mutated since the last persist?
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}

/// A key family joined with the computed state from one chain replay.
pub struct ComputedKeyFamily<'a> {
    kf: &'a KeyFamily,
    cki: ComputedKeyInfos,
}

impl<'a> ComputedKeyFamily<'a> {
    pub fn new(kf: &'a KeyFamily) -> Self {
        Self {
            cki: kf.new_computed_key_infos(),
            kf,
        }
    }

    pub fn family(&self) -> &KeyFamily {
        self.kf
    }

    pub fn infos(&self) -> &ComputedKeyInfos {
        &self.cki
    }

    /// Replay a verified chain in seqno order, applying delegations
    /// and revocations. Links with no key effect are skipped.
    pub fn replay(&mut self, links: &[ChainLink]) -> Result<()> {
        for link in links {
            match link.kind() {
                LinkKind::Eldest | LinkKind::Sibkey | LinkKind::Subkey => self.delegate(link)?,
                LinkKind::Revoke => self.revoke(link)?,
                LinkKind::Other => {}
            }
        }
        Ok(())
    }

    /// Apply one delegation link. Once a key has been delegated as a
    /// sibkey, later subkey delegations of the same KID do not demote
    /// it.
    pub fn delegate(&mut self, link: &ChainLink) -> Result<()> {
        let kid = link.delegated_kid()?;
        let kid_s = kid.to_hex();
        let sig_id = *link.sig_id();
        let delegator = link.delegating_kid()?;
        debug!("| delegate {kid_s} via {delegator}");

        let idx = match self.cki.infos.get(&kid_s).copied() {
            Some(i) => {
                self.cki.arena[i].status = KeyStatus::Live;
                i
            }
            None => {
                self.cki.arena.push(ComputedKeyInfo {
                    status: KeyStatus::Live,
                    eldest: false,
                    sibkey: false,
                    delegations: HashMap::new(),
                    delegated_at: Some(link.keybase_time()),
                    revoked_at: None,
                });
                let i = self.cki.arena.len() - 1;
                self.cki.infos.insert(kid_s, i);
                i
            }
        };
        self.cki.arena[idx].delegations.insert(sig_id, delegator);
        if matches!(link.kind(), LinkKind::Eldest | LinkKind::Sibkey) {
            self.cki.arena[idx].sibkey = true;
        }
        self.cki.sigs.insert(sig_id, idx);
        self.cki.dirty = true;
        Ok(())
    }

    /// Apply one revocation link: revoked sig ids first, then revoked
    /// KIDs. Unknown KIDs are ignored for forward compatibility.
    pub fn revoke(&mut self, link: &ChainLink) -> Result<()> {
        let tm = link.keybase_time();
        for sig in link.revoked_sig_ids()? {
            self.revoke_sig(sig, tm)?;
        }
        for kid in link.revoked_kids()? {
            self.revoke_kid(&kid, tm);
        }
        Ok(())
    }

    fn revoke_sig(&mut self, sig: SigId, tm: KeybaseTime) -> Result<()> {
        match self.cki.sigs.get(&sig) {
            None => Ok(()),
            Some(&i) => {
                if !self.cki.arena[i].delegations.contains_key(&sig) {
                    return Err(Error::BadRevocation(format!(
                        "can't find sig id {sig} in delegation list"
                    )));
                }
                self.cki.arena[i].status = KeyStatus::Revoked;
                self.cki.arena[i].revoked_at = Some(tm);
                self.cki.dirty = true;
                Ok(())
            }
        }
    }

    fn revoke_kid(&mut self, kid: &Kid, tm: KeybaseTime) {
        if let Some(&i) = self.cki.infos.get(&kid.to_hex()) {
            self.cki.arena[i].status = KeyStatus::Revoked;
            self.cki.arena[i].revoked_at = Some(tm);
            self.cki.dirty = true;
        }
    }

    /// A sibkey usable right now: known to the replay, LIVE, delegated
    /// as a sibkey, and present in the family.
    pub fn find_active_sibkey(&self, f: &Fokid) -> Result<&GenericKey> {
        let s = f.to_map_key();
        match self.cki.get(&s) {
            None => Err(Error::NoKey(format!("the key '{s}' wasn't found"))),
            Some(info) if info.status != KeyStatus::Live => {
                Err(Error::BadKey(format!("the key '{s}' is no longer active")))
            }
            Some(info) if !info.sibkey => Err(Error::BadKey(format!(
                "the key '{s}' wasn't delegated as a sibkey"
            ))),
            Some(_) => self.kf.find_active_sibkey(f),
        }
    }

    /// Does a live PGP sibkey carry a self-signed `<s>@keybase.io`
    /// identity?
    pub fn find_keybase_name(&self, s: &str) -> bool {
        let kem = keybase_email(s);
        for pgp in &self.kf.pgps {
            let kid_s = pgp.kid().to_hex();
            let Some(info) = self.cki.get(&kid_s) else {
                continue;
            };
            if info.status != KeyStatus::Live || !info.sibkey {
                continue;
            }
            if pgp.find_email(&kem) {
                debug!("| found self-sig for {s} in key {kid_s}");
                return true;
            }
        }
        false
    }
}
