//! Generic key abstraction over PGP and NaCl key material.
//!
//! A [`GenericKey`] is a tagged variant with a uniform capability set:
//! report identifiers, sign and verify detached signatures, encode the
//! public half for transport, and export the secret half as an
//! encrypted keyring blob.

use crate::errors::{Error, Result};
use crate::kid::{Kid, PgpFingerprint, SigId};
use crate::pgp::PgpKeyBundle;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

/// Algorithm tag for NaCl Ed25519 signing keys.
pub const KID_NACL_EDDSA: u32 = 32;

/// Algorithm tag for NaCl Curve25519 DH keys.
pub const KID_NACL_DH: u32 = 33;

/// Version byte leading every KID.
const KID_VERSION: u8 = 0x01;

/// Trailer byte closing every KID.
const KID_TRAILER: u8 = 0x0a;

/// Byte length of a KID: version, algo, 32 key bytes, trailer.
const KID_LEN: usize = 35;

const ED25519_PUB: usize = 32;
const ED25519_SIG: usize = 64;
const NONCE_LEN: usize = 12;

/// Is this tag one of the RFC 4880 public-key algorithm ids?
pub fn is_pgp_algo(algo: u32) -> bool {
    matches!(algo, 1 | 2 | 3 | 16 | 17 | 18 | 19 | 20)
}

fn kid_from_raw(algo: u32, public: &[u8; 32]) -> Kid {
    let mut bytes = Vec::with_capacity(KID_LEN);
    bytes.push(KID_VERSION);
    bytes.push(algo as u8);
    bytes.extend_from_slice(public);
    bytes.push(KID_TRAILER);
    Kid::from_bytes(bytes)
}

/// Split a NaCl key bundle (its KID hex) back into the raw public key.
fn raw_from_bundle(algo: u32, bundle: &str) -> Result<[u8; 32]> {
    let bytes =
        hex::decode(bundle).map_err(|_| Error::BadKey(format!("bad key bundle hex: {bundle:?}")))?;
    if bytes.len() != KID_LEN {
        return Err(Error::BadKey(format!(
            "key bundle must be {KID_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    if bytes[0] != KID_VERSION || bytes[KID_LEN - 1] != KID_TRAILER {
        return Err(Error::BadKey("key bundle framing bytes are wrong".into()));
    }
    if bytes[1] as u32 != algo {
        return Err(Error::BadKey(format!(
            "key bundle algo={} but record says {algo}",
            bytes[1]
        )));
    }
    Ok(bytes[2..2 + ED25519_PUB].try_into().expect("length checked above"))
}

/// Verify a detached signature against a message.
///
/// The seam between the chain layer and the key material: chain links
/// only need this one capability to check their payloads.
pub trait SigVerifier {
    /// Returns the sig id of the presented signature and whether it
    /// verifies. `Err` is reserved for undecodable input.
    fn verify_detached(&self, msg: &[u8], sig: &str) -> Result<(SigId, bool)>;
}

/// A NaCl Ed25519 signing key, public half always present.
#[derive(Debug, Clone)]
pub struct NaclSigningKeyPair {
    public: VerifyingKey,
    secret: Option<SigningKey>,
}

impl NaclSigningKeyPair {
    /// Generate a fresh pair with entropy from [`getrandom::fill`].
    pub fn generate() -> Result<Self> {
        let mut seed = [0u8; 32];
        getrandom::fill(&mut seed).map_err(|err| Error::Transport(format!("entropy: {err}")))?;
        Ok(Self::from_seed(&seed))
    }

    /// Deterministic pair from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let secret = SigningKey::from_bytes(seed);
        Self {
            public: secret.verifying_key(),
            secret: Some(secret),
        }
    }

    /// Import the public half from a server bundle (the KID hex).
    pub fn import(bundle: &str) -> Result<Self> {
        let raw = raw_from_bundle(KID_NACL_EDDSA, bundle)?;
        let public = VerifyingKey::from_bytes(&raw)
            .map_err(|_| Error::BadKey("not a valid Ed25519 public key".into()))?;
        Ok(Self {
            public,
            secret: None,
        })
    }

    pub fn kid(&self) -> Kid {
        kid_from_raw(KID_NACL_EDDSA, self.public.as_bytes())
    }

    /// Sign, returning the hex signature and its sig id.
    pub fn sign_detached(&self, msg: &[u8]) -> Result<(String, SigId)> {
        let secret = self
            .secret
            .as_ref()
            .ok_or_else(|| Error::BadKey("no secret half for signing key".into()))?;
        let sig = secret.sign(msg);
        let bytes = sig.to_bytes();
        Ok((hex::encode(bytes), SigId::hash_of(&bytes)))
    }

    pub fn check_secret(&self) -> Result<()> {
        if self.secret.is_some() {
            Ok(())
        } else {
            Err(Error::BadKey("secret half is not available".into()))
        }
    }

    /// Public transport form: the KID hex.
    pub fn encode_public(&self) -> String {
        self.kid().to_hex()
    }

    fn secret_material(&self) -> Result<Vec<u8>> {
        let secret = self
            .secret
            .as_ref()
            .ok_or_else(|| Error::BadKey("secret half is not available".into()))?;
        Ok(secret.to_bytes().to_vec())
    }
}

impl SigVerifier for NaclSigningKeyPair {
    fn verify_detached(&self, msg: &[u8], sig: &str) -> Result<(SigId, bool)> {
        let bytes =
            hex::decode(sig).map_err(|_| Error::Parse(format!("bad signature hex: {sig:?}")))?;
        let bytes: [u8; ED25519_SIG] = bytes
            .try_into()
            .map_err(|_| Error::Parse(format!("signature must be {ED25519_SIG} bytes")))?;
        let sig_id = SigId::hash_of(&bytes);
        let sig = Signature::from_bytes(&bytes);
        Ok((sig_id, self.public.verify(msg, &sig).is_ok()))
    }
}

/// A NaCl Curve25519 DH key. No DH operation happens in this core, so
/// only the key bytes travel through.
#[derive(Debug, Clone)]
pub struct NaclDhKeyPair {
    public: [u8; 32],
    secret: Option<[u8; 32]>,
}

impl NaclDhKeyPair {
    pub fn import(bundle: &str) -> Result<Self> {
        let public = raw_from_bundle(KID_NACL_DH, bundle)?;
        Ok(Self {
            public,
            secret: None,
        })
    }

    pub fn kid(&self) -> Kid {
        kid_from_raw(KID_NACL_DH, &self.public)
    }

    pub fn check_secret(&self) -> Result<()> {
        if self.secret.is_some() {
            Ok(())
        } else {
            Err(Error::BadKey("secret half is not available".into()))
        }
    }

    pub fn encode_public(&self) -> String {
        self.kid().to_hex()
    }
}

/// At-rest cipher for keyring exports: ChaCha20-Poly1305 with a
/// random nonce prepended to the box.
pub struct KeyringCipher {
    cipher: ChaCha20Poly1305,
}

impl KeyringCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Encrypt, returning `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        getrandom::fill(&mut nonce).map_err(|err| Error::Transport(format!("entropy: {err}")))?;
        let boxed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::Parse("keyring seal failed".into()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + boxed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&boxed);
        Ok(out)
    }

    /// Decrypt a `nonce || ciphertext || tag` box.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(Error::Parse("keyring box too short".into()));
        }
        let (nonce, boxed) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), boxed)
            .map_err(|_| Error::Parse("keyring box damaged".into()))
    }
}

/// Serialised form of an encrypted keyring export.
#[derive(Debug, Serialize, Deserialize)]
pub struct KeyringExport {
    pub version: u8,
    pub kid: Kid,
    pub key_algo: u32,
    pub public: String,
    pub secret_box: String,
}

/// Uniform capability set over the three key families.
#[derive(Debug, Clone)]
pub enum GenericKey {
    Pgp(PgpKeyBundle),
    NaclSigning(NaclSigningKeyPair),
    NaclDh(NaclDhKeyPair),
}

impl GenericKey {
    pub fn kid(&self) -> Kid {
        match self {
            GenericKey::Pgp(pgp) => pgp.kid(),
            GenericKey::NaclSigning(pair) => pair.kid(),
            GenericKey::NaclDh(pair) => pair.kid(),
        }
    }

    /// The PGP fingerprint, for the PGP variant only.
    pub fn fingerprint(&self) -> Option<PgpFingerprint> {
        match self {
            GenericKey::Pgp(pgp) => pgp.fingerprint().ok(),
            _ => None,
        }
    }

    pub fn algo_type(&self) -> u32 {
        match self {
            GenericKey::Pgp(pgp) => pgp.primary_algo(),
            GenericKey::NaclSigning(_) => KID_NACL_EDDSA,
            GenericKey::NaclDh(_) => KID_NACL_DH,
        }
    }

    pub fn sign_detached(&self, msg: &[u8]) -> Result<(String, SigId)> {
        match self {
            GenericKey::Pgp(pgp) => pgp.sign_detached(msg),
            GenericKey::NaclSigning(pair) => pair.sign_detached(msg),
            GenericKey::NaclDh(_) => Err(Error::BadKey("DH keys cannot sign".into())),
        }
    }

    pub fn check_secret(&self) -> Result<()> {
        match self {
            GenericKey::Pgp(pgp) => pgp.check_secret(),
            GenericKey::NaclSigning(pair) => pair.check_secret(),
            GenericKey::NaclDh(pair) => pair.check_secret(),
        }
    }

    /// Public transport form: armored for PGP, KID hex for NaCl.
    pub fn encode_public(&self) -> Result<String> {
        match self {
            GenericKey::Pgp(pgp) => pgp.encode_public(),
            GenericKey::NaclSigning(pair) => Ok(pair.encode_public()),
            GenericKey::NaclDh(pair) => Ok(pair.encode_public()),
        }
    }

    pub fn verbose_description(&self) -> String {
        match self {
            GenericKey::Pgp(pgp) => pgp.verbose_description(),
            GenericKey::NaclSigning(pair) => {
                format!("nacl-eddsa {}", pair.kid())
            }
            GenericKey::NaclDh(pair) => format!("nacl-dh {}", pair.kid()),
        }
    }

    /// Export the secret half as an encrypted blob suitable for
    /// keyring storage.
    pub fn encrypted_export(&self, cipher: &KeyringCipher) -> Result<Vec<u8>> {
        let secret = match self {
            GenericKey::Pgp(pgp) => pgp.export_secret_armored()?.into_bytes(),
            GenericKey::NaclSigning(pair) => pair.secret_material()?,
            GenericKey::NaclDh(pair) => pair
                .secret
                .ok_or_else(|| Error::BadKey("secret half is not available".into()))?
                .to_vec(),
        };
        let export = KeyringExport {
            version: 1,
            kid: self.kid(),
            key_algo: self.algo_type(),
            public: self.encode_public()?,
            secret_box: hex::encode(cipher.seal(&secret)?),
        };
        Ok(serde_json::to_vec(&export)?)
    }
}

impl SigVerifier for PgpKeyBundle {
    fn verify_detached(&self, msg: &[u8], sig: &str) -> Result<(SigId, bool)> {
        PgpKeyBundle::verify_detached(self, msg, sig)
    }
}

impl SigVerifier for GenericKey {
    fn verify_detached(&self, msg: &[u8], sig: &str) -> Result<(SigId, bool)> {
        match self {
            GenericKey::Pgp(pgp) => pgp.verify_detached(msg, sig),
            GenericKey::NaclSigning(pair) => pair.verify_detached(msg, sig),
            GenericKey::NaclDh(_) => Err(Error::BadKey("DH keys cannot verify".into())),
        }
    }
}
