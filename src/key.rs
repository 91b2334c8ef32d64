//! Stable identity keys for operators and the chunks they produce.
//!
//! Every [`Operator`](crate::operator::Operator) carries an [`OpKey`]. Keys are the only way
//! one operator refers to another's output: inputs are recorded as keys, results are
//! published under keys, and `Fetch`/`FetchShuffle` placeholders resolve by key. Keys never
//! change after assignment.
//!
//! Two sources of keys exist:
//! - [`KeyAllocator`] hands out process-unique keys at construction time, prefixed with a
//!   session token so keys from different processes do not collide;
//! - [`OpKey::derive`] computes a child key from a parent key, a role and a position. The
//!   tiler uses it so that re-tiling the same logical node yields the same chunk keys.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Borrow;
use std::fmt::{Display, Formatter, Result as FormatResult};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identity string addressing an operator and its published result.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpKey(String);

impl OpKey {
    /// Wrap an existing identity string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive a child key from this key, a role tag and a position.
    ///
    /// The result depends only on the three inputs, so the same parent always yields the
    /// same children.
    ///
    /// ```
    /// use irontile::OpKey;
    /// let parent = OpKey::new("agg-1");
    /// assert_eq!(parent.derive("map", &[0]), parent.derive("map", &[0]));
    /// assert_ne!(parent.derive("map", &[0]), parent.derive("map", &[1]));
    /// ```
    #[must_use]
    pub fn derive(&self, role: &str, position: &[usize]) -> Self {
        let mut parts: Vec<Vec<u8>> = vec![self.0.as_bytes().to_vec(), role.as_bytes().to_vec()];
        parts.extend(position.iter().map(|p| (*p as u64).to_le_bytes().to_vec()));
        let digest = digest_hex(parts.iter().map(Vec::as_slice));
        Self(format!("{role}-{}", &digest[..24]))
    }
}

impl Display for OpKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        f.write_str(&self.0)
    }
}

impl From<&str> for OpKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for OpKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for OpKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Hands out process-unique operator keys.
///
/// Keys have the form `<prefix>-<session>-<sequence>`. The session token is derived from the
/// process id and start time, so two processes never share a key space.
#[derive(Debug)]
pub struct KeyAllocator {
    session: String,
    next: AtomicU64,
}

static GLOBAL: LazyLock<KeyAllocator> = LazyLock::new(KeyAllocator::new);

impl KeyAllocator {
    /// Create an allocator with a fresh session token.
    #[must_use]
    pub fn new() -> Self {
        static INSTANCES: AtomicU64 = AtomicU64::new(0);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let instance = INSTANCES.fetch_add(1, Ordering::Relaxed);
        let digest = digest_hex([
            std::process::id().to_le_bytes().as_slice(),
            nanos.to_le_bytes().as_slice(),
            instance.to_le_bytes().as_slice(),
        ]);
        Self::with_session(&digest[..12])
    }

    /// Create an allocator with a caller-chosen session token.
    pub fn with_session(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            next: AtomicU64::new(0),
        }
    }

    /// The allocator backing [`Operator::new`](crate::operator::Operator::new).
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    #[must_use]
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Allocate the next key, tagged with `prefix` for readability.
    pub fn allocate(&self, prefix: &str) -> OpKey {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        OpKey(format!("{prefix}-{}-{n}", self.session))
    }
}

impl Default for KeyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-256 over the concatenation of `parts` (each length-prefixed), as lowercase hex.
pub(crate) fn digest_hex<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
