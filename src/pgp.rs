//! OpenPGP key bundles and the identity strings carried on them.
//!
//! Wraps the `sequoia-openpgp` certificate machinery behind the few
//! operations the rest of the crate needs: parse a bundle, report its
//! fingerprint and user ids, sign and verify detached signatures, and
//! export both halves.

use crate::errors::{Error, Result};
use crate::kid::{Kid, PgpFingerprint, SigId};
use sequoia_openpgp as openpgp;
use openpgp::KeyHandle;
use openpgp::armor;
use openpgp::cert::Cert;
use openpgp::parse::Parse;
use openpgp::parse::stream::{
    DetachedVerifierBuilder, MessageLayer, MessageStructure, VerificationHelper,
};
use openpgp::policy::StandardPolicy;
use openpgp::serialize::stream::{Armorer, Message, Signer};
use openpgp::serialize::{Serialize, SerializeInto};
use sha2::{Digest, Sha256};
use std::io::Write;

const KID_VERSION: u8 = 0x01;
const KID_TRAILER: u8 = 0x0a;

/// One user id on a key: display name, optional comment, email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub comment: String,
    pub email: String,
}

/// Parse an RFC-2822-style user id: `Name (comment) <email>`.
///
/// Every part is optional, but an identity with neither a name nor an
/// email is an error.
pub fn parse_identity(s: &str) -> Result<Identity> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Parse("empty identity".into()));
    }
    let (head, email) = match s.rfind('<') {
        Some(start) => {
            let rest = &s[start + 1..];
            let end = rest
                .find('>')
                .ok_or_else(|| Error::Parse(format!("unterminated email in identity {s:?}")))?;
            if !rest[end + 1..].trim().is_empty() {
                return Err(Error::Parse(format!("trailing junk in identity {s:?}")));
            }
            (&s[..start], rest[..end].trim().to_string())
        }
        None => (s, String::new()),
    };
    let (name_part, comment) = match head.find('(') {
        Some(start) => {
            let rest = &head[start + 1..];
            let end = rest
                .find(')')
                .ok_or_else(|| Error::Parse(format!("unterminated comment in identity {s:?}")))?;
            (
                format!("{} {}", head[..start].trim(), rest[end + 1..].trim()),
                rest[..end].trim().to_string(),
            )
        }
        None => (head.to_string(), String::new()),
    };
    let username = name_part.trim().to_string();
    if username.is_empty() && email.is_empty() {
        return Err(Error::Parse(format!("no name or email in identity {s:?}")));
    }
    Ok(Identity {
        username,
        comment,
        email,
    })
}

/// The synthetic self-signature address `<name>@keybase.io`.
pub fn keybase_email(name: &str) -> String {
    format!("{name}@keybase.io")
}

/// An OpenPGP certificate plus the operations this crate needs from it.
#[derive(Debug, Clone)]
pub struct PgpKeyBundle {
    cert: Cert,
}

struct BundleHelper<'a> {
    cert: &'a Cert,
}

impl VerificationHelper for BundleHelper<'_> {
    fn get_certs(&mut self, _ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
        Ok(vec![self.cert.clone()])
    }

    fn check(&mut self, structure: MessageStructure) -> openpgp::Result<()> {
        for layer in structure.into_iter() {
            if let MessageLayer::SignatureGroup { results } = layer {
                for result in results {
                    if result.is_ok() {
                        return Ok(());
                    }
                }
            }
        }
        Err(openpgp::Error::InvalidOperation("no valid signature".into()).into())
    }
}

impl PgpKeyBundle {
    /// Parse one key bundle, armored or binary.
    pub fn from_armored(s: &str) -> Result<Self> {
        let cert = Cert::from_bytes(s.as_bytes())
            .map_err(|err| Error::Parse(format!("pgp bundle: {err}")))?;
        Ok(Self { cert })
    }

    pub fn cert(&self) -> &Cert {
        &self.cert
    }

    pub fn fingerprint(&self) -> Result<PgpFingerprint> {
        PgpFingerprint::from_slice(self.cert.fingerprint().as_bytes())
    }

    /// The RFC 4880 algorithm id of the primary key.
    pub fn primary_algo(&self) -> u32 {
        u8::from(self.cert.primary_key().key().pk_algo()) as u32
    }

    /// KID derived from the primary key: version, algo, SHA-256 of the
    /// fingerprint, trailer — the same framing as the NaCl KIDs.
    pub fn kid(&self) -> Kid {
        let digest = Sha256::digest(self.cert.fingerprint().as_bytes());
        let mut bytes = Vec::with_capacity(35);
        bytes.push(KID_VERSION);
        bytes.push(self.primary_algo() as u8);
        bytes.extend_from_slice(&digest);
        bytes.push(KID_TRAILER);
        Kid::from_bytes(bytes)
    }

    /// All parseable user ids on the certificate. Ill-formed ones are
    /// skipped.
    pub fn identities(&self) -> Vec<Identity> {
        self.cert
            .userids()
            .filter_map(|ua| {
                let raw = String::from_utf8_lossy(ua.userid().value()).to_string();
                parse_identity(&raw).ok()
            })
            .collect()
    }

    pub fn emails(&self) -> Vec<String> {
        self.identities()
            .into_iter()
            .filter(|id| !id.email.is_empty())
            .map(|id| id.email)
            .collect()
    }

    /// Does any user id carry this email, case-insensitively?
    pub fn find_email(&self, addr: &str) -> bool {
        self.emails()
            .iter()
            .any(|e| e.eq_ignore_ascii_case(addr))
    }

    /// Does a user id assert `<username>@keybase.io`?
    pub fn find_keybase_username(&self, username: &str) -> bool {
        self.find_email(&keybase_email(username))
    }

    /// Error unless this bundle's fingerprint equals `fp`.
    pub fn check_fingerprint(&self, fp: &PgpFingerprint) -> Result<()> {
        let own = self.fingerprint()?;
        if own == *fp {
            Ok(())
        } else {
            Err(Error::BadKey(format!(
                "fingerprint mismatch: {own} != {fp}"
            )))
        }
    }

    /// Sign, returning the armored signature and its sig id.
    pub fn sign_detached(&self, msg: &[u8]) -> Result<(String, SigId)> {
        let policy = StandardPolicy::new();
        let valid = self
            .cert
            .keys()
            .unencrypted_secret()
            .with_policy(&policy, None)
            .supported()
            .alive()
            .revoked(false)
            .for_signing()
            .next()
            .ok_or_else(|| Error::BadKey("no usable signing secret in pgp bundle".into()))?;
        let keypair = valid
            .key()
            .clone()
            .into_keypair()
            .map_err(|err| Error::BadKey(format!("pgp secret unusable: {err}")))?;

        let mut sink = Vec::new();
        let message = Message::new(&mut sink);
        let message = Armorer::new(message)
            .kind(armor::Kind::Signature)
            .build()
            .map_err(|err| Error::Parse(format!("pgp armor: {err}")))?;
        let mut signer = Signer::new(message, keypair)
            .detached()
            .build()
            .map_err(|err| Error::BadKey(format!("pgp signer: {err}")))?;
        signer
            .write_all(msg)
            .map_err(|err| Error::Parse(format!("pgp sign: {err}")))?;
        signer
            .finalize()
            .map_err(|err| Error::Parse(format!("pgp sign: {err}")))?;

        let armored = String::from_utf8(sink)
            .map_err(|_| Error::Parse("pgp signature is not utf-8".into()))?;
        let sig_id = SigId::hash_of(armored.as_bytes());
        Ok((armored, sig_id))
    }

    /// Verify an armored detached signature. Returns the sig id of the
    /// presented signature and whether it verifies; `Err` is reserved
    /// for signatures that do not even parse.
    pub fn verify_detached(&self, msg: &[u8], sig: &str) -> Result<(SigId, bool)> {
        let sig_id = SigId::hash_of(sig.as_bytes());
        let policy = StandardPolicy::new();
        let helper = BundleHelper { cert: &self.cert };
        let mut verifier = DetachedVerifierBuilder::from_bytes(sig.as_bytes())
            .map_err(|err| Error::Parse(format!("pgp signature: {err}")))?
            .with_policy(&policy, None, helper)
            .map_err(|err| Error::Parse(format!("pgp signature: {err}")))?;
        let ok = verifier.verify_bytes(msg).is_ok();
        Ok((sig_id, ok))
    }

    /// Ok if a secret half is present.
    pub fn check_secret(&self) -> Result<()> {
        if self.cert.is_tsk() {
            Ok(())
        } else {
            Err(Error::BadKey("secret half is not available".into()))
        }
    }

    /// Armored public certificate.
    pub fn encode_public(&self) -> Result<String> {
        let bytes = self
            .cert
            .armored()
            .to_vec()
            .map_err(|err| Error::Parse(format!("pgp export: {err}")))?;
        String::from_utf8(bytes).map_err(|_| Error::Parse("pgp export is not utf-8".into()))
    }

    /// Armored secret certificate, for the encrypted keyring export.
    pub fn export_secret_armored(&self) -> Result<String> {
        self.check_secret()?;
        let mut sink = Vec::new();
        let mut writer = armor::Writer::new(&mut sink, armor::Kind::SecretKey)
            .map_err(|err| Error::Parse(format!("pgp export: {err}")))?;
        self.cert
            .as_tsk()
            .serialize(&mut writer)
            .map_err(|err| Error::Parse(format!("pgp export: {err}")))?;
        writer
            .finalize()
            .map_err(|err| Error::Parse(format!("pgp export: {err}")))?;
        String::from_utf8(sink).map_err(|_| Error::Parse("pgp export is not utf-8".into()))
    }

    /// Human description: key id plus the emails asserted on the key.
    pub fn verbose_description(&self) -> String {
        let key_id = match self.fingerprint() {
            Ok(fp) => fp.to_key_id(),
            Err(_) => "????????????????".into(),
        };
        let emails = self.emails();
        if emails.is_empty() {
            format!("pgp {key_id}")
        } else {
            format!("pgp {key_id} {}", emails.join(" "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identity_full() {
        let id = parse_identity("Max Krohn (work) <themax@gmail.com>").unwrap();
        assert_eq!(id.username, "Max Krohn");
        assert_eq!(id.comment, "work");
        assert_eq!(id.email, "themax@gmail.com");
    }

    #[test]
    fn test_parse_identity_no_comment() {
        let id = parse_identity("Max Krohn <themax@gmail.com>").unwrap();
        assert_eq!(id.username, "Max Krohn");
        assert_eq!(id.comment, "");
        assert_eq!(id.email, "themax@gmail.com");
    }

    #[test]
    fn test_parse_identity_email_only() {
        let id = parse_identity("<max@keybase.io>").unwrap();
        assert_eq!(id.username, "");
        assert_eq!(id.email, "max@keybase.io");
    }

    #[test]
    fn test_parse_identity_name_only() {
        let id = parse_identity("Max Krohn").unwrap();
        assert_eq!(id.username, "Max Krohn");
        assert_eq!(id.email, "");
    }

    #[test]
    fn test_parse_identity_bad() {
        assert!(parse_identity("").is_err());
        assert!(parse_identity("Max <unterminated").is_err());
        assert!(parse_identity("Max (unterminated <m@x.io>").is_err());
        assert!(parse_identity("Max <m@x.io> trailing").is_err());
        assert!(parse_identity("()").is_err());
    }

    #[test]
    fn test_keybase_email() {
        assert_eq!(keybase_email("max"), "max@keybase.io");
    }
}
