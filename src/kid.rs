//! Identifiers: KIDs, UIDs, link ids, sig ids, and PGP fingerprints.
//!
//! Everything in here is an opaque byte string with a hex face. Key
//! identifiers compare in constant time; the rest are public data and
//! compare value-wise.

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use subtle::ConstantTimeEq;

/// Size of a link or sig digest (32 bytes).
pub const DIGEST: usize = 32;

/// Size of a PGP fingerprint (20 bytes).
pub const FINGERPRINT: usize = 20;

/// Canonical identifier for a public key, independent of algorithm
/// family.
///
/// Opaque bytes; hex-printable; used as a map key in hex form.
#[derive(Clone, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Kid(Vec<u8>);

impl Kid {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Decode from hexadecimal, the transport and map-key form.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::Parse(format!("bad KID hex: {s:?}")))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl ConstantTimeEq for Kid {
    fn ct_eq(&self, other: &Self) -> subtle::Choice {
        self.0.ct_eq(&other.0)
    }
}

impl PartialEq for Kid {
    fn eq(&self, other: &Self) -> bool {
        self.ct_eq(other).into()
    }
}

impl std::hash::Hash for Kid {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}

impl fmt::Display for Kid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Kid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Kid").field(&self.to_hex()).finish()
    }
}

impl TryFrom<String> for Kid {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Kid::from_hex(&s)
    }
}

impl From<Kid> for String {
    fn from(kid: Kid) -> String {
        kid.to_hex()
    }
}

/// A user id. Opaque bytes, hex-printable.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Uid(Vec<u8>);

impl Uid {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::Parse(format!("bad UID hex: {s:?}")))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Uid").field(&self.to_hex()).finish()
    }
}

impl TryFrom<String> for Uid {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Uid::from_hex(&s)
    }
}

impl From<Uid> for String {
    fn from(uid: Uid) -> String {
        uid.to_hex()
    }
}

/// Identity of one chain link: the SHA-256 digest of its canonical
/// payload body.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LinkId([u8; DIGEST]);

impl LinkId {
    pub fn from_bytes(bytes: [u8; DIGEST]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::Parse(format!("bad link id hex: {s:?}")))?;
        let bytes: [u8; DIGEST] = bytes
            .try_into()
            .map_err(|_| Error::Parse(format!("link id must be {DIGEST} bytes")))?;
        Ok(Self(bytes))
    }

    /// Compute the link id of a canonical payload body.
    pub fn hash_of(body: &[u8]) -> Self {
        let digest = Sha256::digest(body);
        Self(digest.into())
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("LinkId").field(&self.to_hex()).finish()
    }
}

impl TryFrom<String> for LinkId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        LinkId::from_hex(&s)
    }
}

impl From<LinkId> for String {
    fn from(id: LinkId) -> String {
        id.to_hex()
    }
}

/// Trailer byte appended to a sig id's hex form in transport.
const SIG_ID_SUFFIX: u8 = 0x0f;

/// Identity of one signature: the SHA-256 digest of the signature
/// material.
///
/// The transport form may carry a one-byte `0f` trailer after the
/// digest; [`SigId::from_hex`] accepts either form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SigId([u8; DIGEST]);

impl SigId {
    pub fn from_bytes(bytes: [u8; DIGEST]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::Parse(format!("bad sig id hex: {s:?}")))?;
        let bytes = match bytes.len() {
            DIGEST => bytes,
            n if n == DIGEST + 1 && bytes[DIGEST] == SIG_ID_SUFFIX => bytes[..DIGEST].to_vec(),
            n => {
                return Err(Error::Parse(format!("sig id must be {DIGEST} bytes, got {n}")));
            }
        };
        let bytes: [u8; DIGEST] = bytes.try_into().expect("length checked above");
        Ok(Self(bytes))
    }

    /// Compute the sig id of a signature's wire bytes.
    pub fn hash_of(sig: &[u8]) -> Self {
        let digest = Sha256::digest(sig);
        Self(digest.into())
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Hex with the transport trailer appended.
    pub fn to_hex_suffixed(&self) -> String {
        format!("{}{:02x}", self.to_hex(), SIG_ID_SUFFIX)
    }
}

impl fmt::Display for SigId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for SigId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("SigId").field(&self.to_hex()).finish()
    }
}

impl TryFrom<String> for SigId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        SigId::from_hex(&s)
    }
}

impl From<SigId> for String {
    fn from(id: SigId) -> String {
        id.to_hex()
    }
}

/// A 20-byte OpenPGP v4 fingerprint. Displays as uppercase hex.
#[derive(Clone, Copy, Eq)]
pub struct PgpFingerprint([u8; FINGERPRINT]);

impl PgpFingerprint {
    pub fn from_bytes(bytes: [u8; FINGERPRINT]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; FINGERPRINT] = bytes
            .try_into()
            .map_err(|_| Error::Parse(format!("fingerprint must be {FINGERPRINT} bytes")))?;
        Ok(Self(bytes))
    }

    /// Decode from hexadecimal, either case.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes =
            hex::decode(s).map_err(|_| Error::Parse(format!("bad fingerprint hex: {s:?}")))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// The truncated 64-bit key id: the last 8 bytes, uppercase hex.
    pub fn to_key_id(&self) -> String {
        hex::encode_upper(&self.0[FINGERPRINT - 8..])
    }
}

impl ConstantTimeEq for PgpFingerprint {
    fn ct_eq(&self, other: &Self) -> subtle::Choice {
        self.0.ct_eq(&other.0)
    }
}

impl PartialEq for PgpFingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.ct_eq(other).into()
    }
}

impl std::hash::Hash for PgpFingerprint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}

impl fmt::Display for PgpFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PgpFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("PgpFingerprint").field(&self.to_hex()).finish()
    }
}

/// A "fingerprint or KID": one or both of the two key-identifier
/// families, used to bridge OpenPGP and NaCl keys uniformly.
///
/// Different sigchain links record different identifiers, so most code
/// handling keys takes one of these.
#[derive(Clone, Debug, Default)]
pub struct Fokid {
    pub kid: Option<Kid>,
    pub fp: Option<PgpFingerprint>,
}

impl Fokid {
    pub fn from_kid(kid: Kid) -> Self {
        Self {
            kid: Some(kid),
            fp: None,
        }
    }

    pub fn from_fp(fp: PgpFingerprint) -> Self {
        Self {
            kid: None,
            fp: Some(fp),
        }
    }

    /// Conservative equality: every side present on both must match,
    /// and a side missing on either is no information, never a
    /// mismatch.
    pub fn matches(&self, other: &Fokid) -> bool {
        if let (Some(a), Some(b)) = (&self.kid, &other.kid) {
            if a != b {
                return false;
            }
        }
        if let (Some(a), Some(b)) = (&self.fp, &other.fp) {
            if a != b {
                return false;
            }
        }
        true
    }

    /// Does the KID side equal `kid`? Absent KID side never matches.
    pub fn eq_kid(&self, kid: &Kid) -> bool {
        self.kid.as_ref() == Some(kid)
    }

    /// The map-key forms this FOKID answers to: KID hex, then the
    /// fingerprint string, for whichever sides are present.
    pub fn to_strings(&self) -> Vec<String> {
        let mut v = Vec::with_capacity(2);
        if let Some(kid) = &self.kid {
            v.push(kid.to_hex());
        }
        if let Some(fp) = &self.fp {
            v.push(fp.to_hex());
        }
        v
    }

    /// The preferred single map-key form: KID hex if present, else the
    /// fingerprint string, else empty.
    pub fn to_map_key(&self) -> String {
        if let Some(kid) = &self.kid {
            kid.to_hex()
        } else if let Some(fp) = &self.fp {
            fp.to_hex()
        } else {
            String::new()
        }
    }
}

impl fmt::Display for Fokid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_map_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testhelpers::{random_fingerprint, random_kid};

    #[test]
    fn test_kid_hex_roundtrip() {
        let kid = random_kid();
        assert_eq!(Kid::from_hex(&kid.to_hex()).unwrap(), kid);
        assert!(Kid::from_hex("wxyz").is_err());
    }

    #[test]
    fn test_fingerprint_hex_roundtrip() {
        let fp = random_fingerprint();
        let hx = fp.to_hex();
        assert_eq!(hx, hx.to_uppercase());
        assert_eq!(PgpFingerprint::from_hex(&hx).unwrap(), fp);
        assert_eq!(PgpFingerprint::from_hex(&hx.to_lowercase()).unwrap(), fp);
        assert!(PgpFingerprint::from_hex("aabb").is_err());
    }

    #[test]
    fn test_fingerprint_key_id() {
        let fp = PgpFingerprint::from_bytes([0xab; FINGERPRINT]);
        assert_eq!(fp.to_key_id(), "ABABABABABABABAB");
        assert_eq!(fp.to_key_id().len(), 16);
    }

    #[test]
    fn test_sig_id_suffix_forms() {
        let sig_id = SigId::hash_of(b"some signature bytes");
        let plain = sig_id.to_hex();
        let suffixed = sig_id.to_hex_suffixed();
        assert_eq!(suffixed.len(), plain.len() + 2);
        assert!(suffixed.ends_with("0f"));
        assert_eq!(SigId::from_hex(&plain).unwrap(), sig_id);
        assert_eq!(SigId::from_hex(&suffixed).unwrap(), sig_id);
    }

    #[test]
    fn test_link_id_hash_of() {
        let a = LinkId::hash_of(b"payload one");
        let b = LinkId::hash_of(b"payload two");
        assert_ne!(a, b);
        assert_eq!(a, LinkId::from_hex(&a.to_hex()).unwrap());
    }

    #[test]
    fn test_fokid_matches_reflexive() {
        let f = Fokid {
            kid: Some(random_kid()),
            fp: Some(random_fingerprint()),
        };
        assert!(f.matches(&f));
    }

    #[test]
    fn test_fokid_missing_side_is_no_information() {
        let kid = random_kid();
        let fp = random_fingerprint();
        let both = Fokid {
            kid: Some(kid.clone()),
            fp: Some(fp),
        };
        let kid_only = Fokid::from_kid(kid);
        let fp_only = Fokid::from_fp(fp);
        assert!(both.matches(&kid_only));
        assert!(kid_only.matches(&both));
        assert!(both.matches(&fp_only));
        assert!(kid_only.matches(&fp_only));
    }

    #[test]
    fn test_fokid_concrete_mismatch_loses() {
        let kid = random_kid();
        let fp = random_fingerprint();
        let a = Fokid {
            kid: Some(kid.clone()),
            fp: Some(fp),
        };
        let mut b = a.clone();
        b.fp = Some(random_fingerprint());
        // KID sides agree, fingerprint sides disagree.
        assert!(!a.matches(&b));
        let mut c = a.clone();
        c.kid = Some(random_kid());
        assert!(!a.matches(&c));
        assert!(a.eq_kid(&kid));
        assert!(!Fokid::from_fp(fp).eq_kid(&kid));
    }

    #[test]
    fn test_fokid_map_keys() {
        let kid = random_kid();
        let fp = random_fingerprint();
        let f = Fokid {
            kid: Some(kid.clone()),
            fp: Some(fp),
        };
        assert_eq!(f.to_strings(), vec![kid.to_hex(), fp.to_hex()]);
        assert_eq!(f.to_map_key(), kid.to_hex());
        assert_eq!(Fokid::from_fp(fp).to_map_key(), fp.to_hex());
        assert_eq!(Fokid::default().to_map_key(), "");
    }
}
