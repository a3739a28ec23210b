//! Some test fixtures only built on `cfg(test)`.

use crate::keyfamily::ServerKeyRecord;
use crate::keys::{GenericKey, KID_NACL_EDDSA, NaclSigningKeyPair};
use crate::kid::{DIGEST, FINGERPRINT, Kid, LinkId, PgpFingerprint, SigId};
use serde_json::json;

/// Uid used by [`LinkFactory`] fixtures.
pub const TEST_UID: &str = "95d88e55d8bcb4ae5ae9625a76500d00";

/// Username used by [`LinkFactory`] fixtures.
pub const TEST_USERNAME: &str = "max";

/// Random bytes from [`getrandom::fill`].
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    getrandom::fill(&mut buf).unwrap();
    buf
}

/// A random (and structurally meaningless) KID.
pub fn random_kid() -> Kid {
    Kid::from_bytes(random_bytes::<35>().to_vec())
}

/// A random but well-formed NaCl Ed25519 KID.
pub fn random_nacl_kid() -> Kid {
    NaclSigningKeyPair::from_seed(&random_bytes()).kid()
}

pub fn random_fingerprint() -> PgpFingerprint {
    PgpFingerprint::from_bytes(random_bytes::<FINGERPRINT>())
}

pub fn random_link_id() -> LinkId {
    LinkId::from_bytes(random_bytes::<DIGEST>())
}

pub fn random_sig_id() -> SigId {
    SigId::from_bytes(random_bytes::<DIGEST>())
}

/// A sibkey record as the server would return it, over a deterministic
/// NaCl signing pair. `eldest` of `None` means self-signed.
pub fn nacl_sibkey_record(
    seed: &[u8; 32],
    eldest: Option<&Kid>,
) -> (NaclSigningKeyPair, ServerKeyRecord) {
    let pair = NaclSigningKeyPair::from_seed(seed);
    let rec = ServerKeyRecord {
        kid: pair.kid().to_hex(),
        key_type: 0,
        bundle: pair.encode_public(),
        mtime: 0,
        ctime: 0,
        etime: 0,
        pgp_fingerprint: String::new(),
        signing_kid: None,
        eldest_kid: eldest.map(Kid::to_hex),
        key_level: 0,
        status: 0,
        key_bits: 256,
        key_algo: KID_NACL_EDDSA,
        key: None,
    };
    (pair, rec)
}

/// Builds server-shaped, genuinely signed chain links one at a time.
pub struct LinkFactory {
    pair: NaclSigningKeyPair,
    uid: String,
    username: String,
    seqno: u64,
    prev: Option<LinkId>,
}

impl LinkFactory {
    pub fn new(seed: &[u8; 32]) -> Self {
        Self::with_user(seed, TEST_UID, TEST_USERNAME)
    }

    pub fn with_user(seed: &[u8; 32], uid: &str, username: &str) -> Self {
        Self {
            pair: NaclSigningKeyPair::from_seed(seed),
            uid: uid.to_string(),
            username: username.to_string(),
            seqno: 0,
            prev: None,
        }
    }

    pub fn kid(&self) -> Kid {
        self.pair.kid()
    }

    pub fn pair(&self) -> &NaclSigningKeyPair {
        &self.pair
    }

    pub fn generic_key(&self) -> GenericKey {
        GenericKey::NaclSigning(self.pair.clone())
    }

    /// Id of the most recently built link.
    pub fn last_id(&self) -> Option<LinkId> {
        self.prev
    }

    pub fn last_seqno(&self) -> u64 {
        self.seqno
    }

    /// Force the next link's prev pointer, to build broken chains.
    pub fn set_prev(&mut self, prev: Option<LinkId>) {
        self.prev = prev;
    }

    fn key_section(&self) -> serde_json::Value {
        json!({
            "uid": self.uid,
            "username": self.username,
            "kid": self.kid().to_hex(),
        })
    }

    /// Sign a payload body into a full server link object.
    pub fn push(&mut self, body: serde_json::Value) -> serde_json::Value {
        let seqno = self.seqno + 1;
        let payload = json!({
            "seqno": seqno,
            "prev": self.prev.map(|p| p.to_hex()),
            "ctime": 1_414_000_000i64 + seqno as i64,
            "body": body,
        });
        let payload_json = serde_json::to_string(&payload).unwrap();
        let id = LinkId::hash_of(payload_json.as_bytes());
        let (sig, sig_id) = self.pair.sign_detached(payload_json.as_bytes()).unwrap();
        let link = json!({
            "seqno": seqno,
            "payload_json": payload_json,
            "sig": sig,
            "sig_id": sig_id.to_hex_suffixed(),
            "payload_hash": id.to_hex(),
            "kid": self.kid().to_hex(),
            "prev": self.prev.map(|p| p.to_hex()),
        });
        self.seqno = seqno;
        self.prev = Some(id);
        link
    }

    pub fn eldest_link(&mut self) -> serde_json::Value {
        let body = json!({"type": "eldest", "key": self.key_section()});
        self.push(body)
    }

    pub fn sibkey_link(&mut self, kid: &Kid) -> serde_json::Value {
        let body = json!({
            "type": "sibkey",
            "key": self.key_section(),
            "sibkey": {"kid": kid.to_hex()},
        });
        self.push(body)
    }

    pub fn subkey_link(&mut self, kid: &Kid) -> serde_json::Value {
        let body = json!({
            "type": "subkey",
            "key": self.key_section(),
            "subkey": {"kid": kid.to_hex()},
        });
        self.push(body)
    }

    pub fn revoke_link(&mut self, sig_ids: &[SigId], kids: &[Kid]) -> serde_json::Value {
        let body = json!({
            "type": "revoke",
            "key": self.key_section(),
            "revoke": {
                "sig_ids": sig_ids.iter().map(SigId::to_hex).collect::<Vec<_>>(),
                "kids": kids.iter().map(Kid::to_hex).collect::<Vec<_>>(),
            },
        });
        self.push(body)
    }

    /// A link with no key effect.
    pub fn proof_link(&mut self) -> serde_json::Value {
        let body = json!({
            "type": "web_service_binding",
            "key": self.key_section(),
            "service": {"name": "twitter", "username": self.username},
        });
        self.push(body)
    }
}

fn flip_bit(buf: &mut [u8], counter: usize) {
    let i = counter / 8;
    let b = (counter % 8) as u8;
    buf[i] ^= 1 << b; // Flip bit `b` in byte `i`
}

/// Iteration through all 1-bit flip permutations in a buffer.
#[derive(Debug)]
pub struct BitFlipper {
    good: Vec<u8>,
    counter: usize,
}

impl BitFlipper {
    /// Create a new [`BitFlipper`].
    pub fn new(orig: &[u8]) -> Self {
        let mut good = Vec::with_capacity(orig.len());
        good.extend_from_slice(orig);
        BitFlipper { good, counter: 0 }
    }
}

impl Iterator for BitFlipper {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.counter < self.good.len() * 8 {
            let mut bad = Vec::with_capacity(self.good.len());
            bad.extend_from_slice(&self.good[..]);
            flip_bit(&mut bad[..], self.counter);
            self.counter += 1;
            Some(bad)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_random_kids_are_unique() {
        let count = 256;
        let mut hset = HashSet::new();
        for _ in 0..count {
            assert!(hset.insert(random_kid()));
        }
        assert_eq!(hset.len(), count);
    }

    #[test]
    fn test_link_factory_chains_prev() {
        let mut factory = LinkFactory::new(&[1; 32]);
        let first = factory.eldest_link();
        let first_id = factory.last_id().unwrap();
        let second = factory.proof_link();
        assert_eq!(first["seqno"], 1);
        assert_eq!(second["seqno"], 2);
        assert!(first["prev"].is_null());
        assert_eq!(second["prev"], serde_json::json!(first_id.to_hex()));
    }

    #[test]
    fn test_bit_flipper() {
        let good: Vec<u8> = vec![0b01010101];
        let badies = Vec::from_iter(BitFlipper::new(&good[..]));
        assert_eq!(badies.len(), 8);
        assert_eq!(
            badies,
            vec![
                vec![0b01010100],
                vec![0b01010111],
                vec![0b01010001],
                vec![0b01011101],
                vec![0b01000101],
                vec![0b01110101],
                vec![0b00010101],
                vec![0b11010101],
            ]
        );
    }
}
