//! GPG key inventory: parse `gpg --with-colons` listings into an
//! indexed set of primary keys.
//!
//! The listing is line oriented: colon-separated fields, first field
//! the record type. A primary key record (`pub` or `sec`) opens an
//! element; `fpr`, `uid`, `uat`, `sub`, and `ssb` records that follow
//! belong to it. Fingerprint records attach to whatever entity was
//! started most recently — the primary key, or the last subkey.

use crate::errors::{Error, GpgIndexError, Result, Warnings};
use crate::kid::PgpFingerprint;
use crate::pgp::{Identity, parse_identity};
use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Field positions in a listing line.
const FIELD_TYPE: usize = 0;
const FIELD_TRUST: usize = 1;
const FIELD_BITS: usize = 2;
const FIELD_ALGO: usize = 3;
const FIELD_ID64: usize = 4;
const FIELD_CREATED: usize = 5;
const FIELD_EXPIRES: usize = 6;
const FIELD_UID: usize = 9;

/// Minimum field count for a key record.
const MIN_FIELDS: usize = 12;

fn unix_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_secs() as i64,
        Err(_) => 0,
    }
}

/// One line of the listing, split on colons.
#[derive(Debug, Clone)]
pub struct GpgIndexLine {
    v: Vec<String>,
    lineno: usize,
}

impl GpgIndexLine {
    fn parse(s: &str, lineno: usize) -> Self {
        let v = s.trim().split(':').map(str::to_string).collect();
        Self { v, lineno }
    }

    pub fn len(&self) -> usize {
        self.v.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v.is_empty()
    }

    /// Field `i`, or empty if the line is too short.
    pub fn at(&self, i: usize) -> &str {
        self.v.get(i).map_or("", String::as_str)
    }

    /// Does this line open a new primary key?
    pub fn is_new_key(&self) -> bool {
        matches!(self.at(FIELD_TYPE), "pub" | "sec")
    }

    fn err(&self, msg: impl Into<String>) -> GpgIndexError {
        GpgIndexError::new(self.lineno, msg)
    }
}

/// Fields common to primary keys and subkeys.
#[derive(Debug, Clone, Default)]
pub struct GpgBaseKey {
    pub typ: String,
    pub trust: String,
    pub bits: u32,
    pub algo: u32,
    pub id64: String,
    pub created: i64,
    pub expires: i64,
    pub fingerprint: Option<PgpFingerprint>,
}

impl GpgBaseKey {
    fn parse_base(line: &GpgIndexLine) -> Result<Self, GpgIndexError> {
        if line.len() < MIN_FIELDS {
            return Err(line.err(format!("not enough fields (need {MIN_FIELDS})")));
        }
        let strict = |field: usize, name: &str| -> Result<u32, GpgIndexError> {
            line.at(field)
                .parse()
                .map_err(|_| line.err(format!("bad {name}: {:?}", line.at(field))))
        };
        // created and expires accept empty meaning zero.
        let flexi = |field: usize, name: &str| -> Result<i64, GpgIndexError> {
            let s = line.at(field);
            if s.is_empty() {
                Ok(0)
            } else {
                s.parse()
                    .map_err(|_| line.err(format!("bad {name}: {s:?}")))
            }
        };
        Ok(Self {
            typ: line.at(FIELD_TYPE).to_string(),
            trust: line.at(FIELD_TRUST).to_string(),
            bits: strict(FIELD_BITS, "bits")?,
            algo: strict(FIELD_ALGO, "algo")?,
            id64: line.at(FIELD_ID64).to_string(),
            created: flexi(FIELD_CREATED, "created")?,
            expires: flexi(FIELD_EXPIRES, "expires")?,
            fingerprint: None,
        })
    }

    /// One-letter algorithm tag for display.
    pub fn algo_string(&self) -> &'static str {
        match self.algo {
            1 | 2 | 3 => "R",
            17 => "D",
            19 => "E",
            _ => "?",
        }
    }

    /// `never`, or the expiry day as `YYYY-MM-DD`.
    pub fn expiration_string(&self) -> String {
        if self.expires == 0 {
            "never".to_string()
        } else {
            match chrono::DateTime::from_timestamp(self.expires, 0) {
                Some(dt) => dt.format("%Y-%m-%d").to_string(),
                None => "?".to_string(),
            }
        }
    }
}

/// A subordinate key hanging off a primary key.
#[derive(Debug, Clone)]
pub struct GpgSubKey {
    pub base: GpgBaseKey,
}

impl GpgSubKey {
    fn parse(line: &GpgIndexLine) -> Result<Self, GpgIndexError> {
        Ok(Self {
            base: GpgBaseKey::parse_base(line)?,
        })
    }
}

/// Where the next `fpr` record lands: on the primary key, or on the
/// subkey most recently appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sink {
    Primary,
    Subkey(usize),
}

/// A primary key with its subkeys and identities.
#[derive(Debug, Clone)]
pub struct GpgPrimaryKey {
    pub base: GpgBaseKey,
    pub subkeys: Vec<GpgSubKey>,
    pub identities: Vec<Identity>,
    top: Sink,
}

impl GpgPrimaryKey {
    fn parse(line: &GpgIndexLine) -> Result<Self, GpgIndexError> {
        let mut key = Self {
            base: GpgBaseKey::parse_base(line)?,
            subkeys: Vec::new(),
            identities: Vec::new(),
            top: Sink::Primary,
        };
        key.add_uid(line)?;
        Ok(key)
    }

    /// Route one follow-on record. `uat` (photo ids) are ignored;
    /// unknown record types are an error the parser downgrades.
    fn add_line(&mut self, line: &GpgIndexLine) -> Result<(), GpgIndexError> {
        if line.len() < 2 {
            return Err(line.err("too few fields"));
        }
        match line.at(FIELD_TYPE) {
            "fpr" => self.add_fingerprint(line),
            "uid" => self.add_uid(line),
            "uat" => Ok(()),
            "sub" | "ssb" => self.add_subkey(line),
            other => Err(line.err(format!("unknown subfield: {other}"))),
        }
    }

    fn add_uid(&mut self, line: &GpgIndexLine) -> Result<(), GpgIndexError> {
        let f = line.at(FIELD_UID);
        if f.is_empty() {
            return Ok(());
        }
        match parse_identity(f) {
            Ok(id) => {
                self.identities.push(id);
                Ok(())
            }
            Err(err) => Err(line.err(err.to_string())),
        }
    }

    fn add_fingerprint(&mut self, line: &GpgIndexLine) -> Result<(), GpgIndexError> {
        let f = line.at(FIELD_UID);
        if f.is_empty() {
            return Err(line.err("no fingerprint given"));
        }
        let fp = PgpFingerprint::from_hex(f).map_err(|err| line.err(err.to_string()))?;
        self.set_fingerprint(fp);
        Ok(())
    }

    fn set_fingerprint(&mut self, fp: PgpFingerprint) {
        match self.top {
            Sink::Primary => self.base.fingerprint = Some(fp),
            Sink::Subkey(i) => self.subkeys[i].base.fingerprint = Some(fp),
        }
    }

    fn add_subkey(&mut self, line: &GpgIndexLine) -> Result<(), GpgIndexError> {
        let sk = GpgSubKey::parse(line)?;
        self.subkeys.push(sk);
        self.top = Sink::Subkey(self.subkeys.len() - 1);
        Ok(())
    }

    /// Admitted to the index only if not revoked and not expired.
    pub fn is_valid(&self) -> bool {
        if self.base.trust == "r" {
            false
        } else if self.base.expires == 0 {
            true
        } else {
            unix_now() < self.base.expires
        }
    }

    pub fn fingerprint(&self) -> Option<&PgpFingerprint> {
        self.base.fingerprint.as_ref()
    }

    pub fn emails(&self) -> Vec<String> {
        self.identities
            .iter()
            .filter(|id| !id.email.is_empty())
            .map(|id| id.email.clone())
            .collect()
    }

    /// 64-bit key ids of the primary key and every subkey that has a
    /// fingerprint attached.
    pub fn all_id64s(&self) -> Vec<String> {
        let mut ret = Vec::new();
        if let Some(fp) = &self.base.fingerprint {
            ret.push(fp.to_key_id());
        }
        for sk in &self.subkeys {
            if let Some(fp) = &sk.base.fingerprint {
                ret.push(fp.to_key_id());
            }
        }
        ret
    }

    /// Terminal display row: index, size/algo, key id, expiry, emails.
    pub fn to_row(&self, i: usize) -> Vec<String> {
        let mut v = vec![
            format!("({i})"),
            format!("{}{}", self.base.bits, self.base.algo_string()),
            self.base
                .fingerprint
                .as_ref()
                .map_or_else(String::new, PgpFingerprint::to_key_id),
            self.base.expiration_string(),
        ];
        v.extend(self.emails());
        v
    }
}

/// Case-insensitive dedup, preserving first-seen order.
fn uniquify(inp: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut ret = Vec::with_capacity(inp.len());
    for s in inp {
        let k = s.to_lowercase();
        if seen.insert(k.clone()) {
            ret.push(k);
        }
    }
    ret
}

/// Case-insensitive multimap from a lookup string to key positions in
/// the index.
#[derive(Debug, Clone, Default)]
pub struct BucketDict {
    d: HashMap<String, Vec<usize>>,
}

impl BucketDict {
    fn add(&mut self, k: &str, idx: usize) {
        self.d.entry(k.to_lowercase()).or_default().push(idx);
    }

    pub fn get(&self, k: &str) -> &[usize] {
        self.d.get(&k.to_lowercase()).map_or(&[], Vec::as_slice)
    }

    /// A lookup that must be unique: zero hits is `None`, two or more
    /// is an error.
    pub fn get_0_or_1(&self, k: &str) -> Result<Option<usize>> {
        let v = self.get(k);
        if v.len() > 1 {
            Err(Error::Parse(format!(
                "wanted a unique lookup but got {} keys for {k}",
                v.len()
            )))
        } else {
            Ok(v.first().copied())
        }
    }
}

/// All valid primary keys from a listing, with lookup tables keyed by
/// email, fingerprint, and 64-bit key id.
#[derive(Debug, Clone, Default)]
pub struct GpgKeyIndex {
    pub keys: Vec<GpgPrimaryKey>,
    pub emails: BucketDict,
    pub fingerprints: BucketDict,
    pub id64s: BucketDict,
}

impl GpgKeyIndex {
    /// Sort the keys (most identities first, then longest-lived), then
    /// build the lookup tables over the sorted order.
    fn build(mut keys: Vec<GpgPrimaryKey>) -> Self {
        keys.sort_by(|a, b| {
            b.identities
                .len()
                .cmp(&a.identities.len())
                .then_with(|| match (a.base.expires == 0, b.base.expires == 0) {
                    (true, true) => std::cmp::Ordering::Equal,
                    (true, false) => std::cmp::Ordering::Less,
                    (false, true) => std::cmp::Ordering::Greater,
                    (false, false) => b.base.expires.cmp(&a.base.expires),
                })
        });
        let mut index = Self {
            keys,
            ..Self::default()
        };
        for i in 0..index.keys.len() {
            if let Some(fp) = index.keys[i].fingerprint() {
                index.fingerprints.add(&fp.to_hex(), i);
            }
            for e in uniquify(index.keys[i].emails()) {
                index.emails.add(&e, i);
            }
            for id64 in uniquify(index.keys[i].all_id64s()) {
                index.id64s.add(&id64, i);
            }
        }
        index
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys_for_email(&self, email: &str) -> Vec<&GpgPrimaryKey> {
        self.emails.get(email).iter().map(|&i| &self.keys[i]).collect()
    }

    pub fn key_for_fingerprint(&self, fp: &PgpFingerprint) -> Result<Option<&GpgPrimaryKey>> {
        Ok(self
            .fingerprints
            .get_0_or_1(&fp.to_hex())?
            .map(|i| &self.keys[i]))
    }

    pub fn keys_for_id64(&self, id64: &str) -> Vec<&GpgPrimaryKey> {
        self.id64s.get(id64).iter().map(|&i| &self.keys[i]).collect()
    }

    pub fn all_fingerprints(&self) -> Vec<PgpFingerprint> {
        self.keys.iter().filter_map(|k| k.fingerprint().copied()).collect()
    }

    /// Display rows in index order, 1-based.
    pub fn rows(&self) -> impl Iterator<Item = Vec<String>> + '_ {
        self.keys.iter().enumerate().map(|(i, k)| k.to_row(i + 1))
    }
}

/// Pull parser over a listing stream, with a one-line push-back.
pub struct GpgIndexParser<R: BufRead> {
    src: R,
    putback: Option<GpgIndexLine>,
    eof: bool,
    lineno: usize,
    warnings: Warnings,
}

impl<R: BufRead> GpgIndexParser<R> {
    pub fn new(src: R) -> Self {
        Self {
            src,
            putback: None,
            eof: false,
            lineno: 0,
            warnings: Warnings::default(),
        }
    }

    fn get_line(&mut self) -> Result<Option<GpgIndexLine>> {
        if let Some(line) = self.putback.take() {
            return Ok(Some(line));
        }
        if self.eof {
            return Ok(None);
        }
        let mut buf = String::new();
        let n = self
            .src
            .read_line(&mut buf)
            .map_err(|err| Error::Transport(format!("gpg listing read: {err}")))?;
        if n == 0 {
            self.eof = true;
            return Ok(None);
        }
        self.lineno += 1;
        Ok(Some(GpgIndexLine::parse(&buf, self.lineno)))
    }

    fn putback_line(&mut self, line: GpgIndexLine) {
        self.putback = Some(line);
    }

    /// Read until a new-key line opens an element, then parse it.
    fn parse_element(&mut self) -> Result<Option<GpgPrimaryKey>> {
        match self.get_line()? {
            None => Ok(None),
            Some(line) if line.is_new_key() => self.parse_key(line).map(Some),
            Some(_) => Ok(None),
        }
    }

    /// Parse a primary key and everything up to the next new-key line,
    /// which is pushed back. Bad follow-on lines become warnings.
    fn parse_key(&mut self, first: GpgIndexLine) -> Result<GpgPrimaryKey> {
        let mut key = GpgPrimaryKey::parse(&first)?;
        while !self.eof {
            let Some(line) = self.get_line()? else {
                break;
            };
            if line.is_new_key() {
                self.putback_line(line);
                break;
            }
            if let Err(err) = key.add_line(&line) {
                warn!("{err}");
                self.warnings.push(err.into());
            }
        }
        Ok(key)
    }

    /// Parse the whole stream, dropping revoked and expired keys.
    pub fn parse(&mut self) -> Result<GpgKeyIndex> {
        let mut keys = Vec::new();
        while !self.eof {
            if let Some(key) = self.parse_element()? {
                if key.is_valid() {
                    keys.push(key);
                }
            }
        }
        Ok(GpgKeyIndex::build(keys))
    }

    pub fn into_warnings(self) -> Warnings {
        self.warnings
    }
}

/// Parse a listing stream into an index plus accumulated warnings.
pub fn parse_gpg_index_stream(stream: impl Read) -> Result<(GpgKeyIndex, Warnings)> {
    let mut parser = GpgIndexParser::new(BufReader::new(stream));
    let index = parser.parse()?;
    Ok((index, parser.into_warnings()))
}

/// Launches the gpg binary to list keys.
#[derive(Debug, Clone)]
pub struct GpgClient {
    pub program: String,
}

impl Default for GpgClient {
    fn default() -> Self {
        Self {
            program: "gpg".to_string(),
        }
    }
}

impl GpgClient {
    /// Index the public (`-k`) or secret (`-K`) keyring, optionally
    /// narrowed by a query string.
    ///
    /// Stdout is drained to EOF before the process is waited on; the
    /// other order deadlocks once the pipe buffer fills.
    pub fn index(&self, secret: bool, query: Option<&str>) -> Result<(GpgKeyIndex, Warnings)> {
        let mode = if secret { "-K" } else { "-k" };
        let mut cmd = Command::new(&self.program);
        cmd.arg("--with-colons")
            .arg("--fingerprint")
            .arg(mode)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(q) = query {
            cmd.arg(q);
        }
        let mut child = cmd
            .spawn()
            .map_err(|err| Error::Transport(format!("spawn {}: {err}", self.program)))?;
        let mut stdout = child.stdout.take().expect("stdout is piped");
        let mut listing = Vec::new();
        stdout.read_to_end(&mut listing)?;
        drop(stdout);
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(Error::Transport(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_gpg_index_stream(&listing[..])
    }
}
