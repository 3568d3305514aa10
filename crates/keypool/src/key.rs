use crate::{Error, Result};
use core::{fmt, str::FromStr};
use rand::{Rng, rng};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A fixed-length random identifier.
///
/// A `CandidateKey` has no internal structure. Uniqueness is established by
/// verification against the systems of record and the issued ledger, never
/// by the key's layout.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateKey(String);

impl CandidateKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for CandidateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CandidateKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for CandidateKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&str> for CandidateKey {
    fn from(key: &str) -> Self {
        Self(key.to_owned())
    }
}

const ALPHANUMERIC: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const URL_SAFE: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// The symbol set keys are drawn from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Alphabet {
    /// `[0-9A-Za-z]`, 62 symbols.
    #[default]
    Alphanumeric,
    /// RFC 4648 URL-safe base64 symbols, 64 symbols.
    UrlSafe,
}

impl Alphabet {
    pub const fn symbols(self) -> &'static [u8] {
        match self {
            Self::Alphanumeric => ALPHANUMERIC,
            Self::UrlSafe => URL_SAFE,
        }
    }
}

impl FromStr for Alphabet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "alphanumeric" | "alnum" => Ok(Self::Alphanumeric),
            "url-safe" | "urlsafe" | "url_safe" => Ok(Self::UrlSafe),
            other => Err(Error::config(format!(
                "unknown key alphabet `{other}` (expected `alphanumeric` or `url-safe`)"
            ))),
        }
    }
}

/// A source of candidate keys.
///
/// This abstraction lets tests plug in deterministic sequences (for example
/// to force collisions) while production uses [`ThreadRandomKeys`].
pub trait KeySource {
    /// Returns the next candidate. Consecutive values may repeat.
    fn next_key(&mut self) -> CandidateKey;
}

/// A [`KeySource`] drawing each symbol from the thread-local RNG.
///
/// `rand::rng()` is a ChaCha-based CSPRNG, reseeded periodically from the
/// OS. Symbols are sampled uniformly with `random_range`, so there is no
/// modulo bias.
#[derive(Clone, Debug)]
pub struct ThreadRandomKeys {
    length: usize,
    alphabet: Alphabet,
}

impl ThreadRandomKeys {
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `length` is zero.
    pub fn new(length: usize, alphabet: Alphabet) -> Result<Self> {
        if length == 0 {
            return Err(Error::config("key length must be greater than 0"));
        }
        Ok(Self { length, alphabet })
    }

    pub const fn length(&self) -> usize {
        self.length
    }

    pub const fn alphabet(&self) -> Alphabet {
        self.alphabet
    }
}

impl KeySource for ThreadRandomKeys {
    fn next_key(&mut self) -> CandidateKey {
        let symbols = self.alphabet.symbols();
        let mut rng = rng();
        let key = (0..self.length)
            .map(|_| char::from(symbols[rng.random_range(0..symbols.len())]))
            .collect::<String>();
        CandidateKey(key)
    }
}

// Upper bound on draws per requested key. Only reachable when the keyspace is
// nearly exhausted or a test source repeats itself.
const MAX_DRAWS_PER_KEY: usize = 16;

// Batches grow past this on demand instead of reserving up front.
const MAX_PREALLOC: usize = 4096;

/// Draws `count` keys that are unique within the returned batch.
///
/// Intra-batch duplicates are redrawn. The loop gives up after
/// `count * 16` draws, so a degenerate source yields a shorter batch instead
/// of spinning forever.
pub fn mint_batch<S: KeySource + ?Sized>(source: &mut S, count: usize) -> Vec<CandidateKey> {
    let mut seen = HashSet::with_capacity(count.min(MAX_PREALLOC));
    let mut batch = Vec::with_capacity(count.min(MAX_PREALLOC));
    let budget = count.saturating_mul(MAX_DRAWS_PER_KEY);

    for _ in 0..budget {
        if batch.len() == count {
            break;
        }
        let key = source.next_key();
        if seen.insert(key.clone()) {
            batch.push(key);
        }
    }

    #[cfg(feature = "tracing")]
    {
        if batch.len() < count {
            tracing::warn!(
                requested = count,
                minted = batch.len(),
                "Key source repeated itself; batch is short"
            );
        }
    }

    batch
}
