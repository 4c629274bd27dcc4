//! Composite record keys and their flat storage encoding
//!
//! A `(group, key)` pair is stored under `g{hex(group)}.{hex(key)}`. Hex output
//! never contains `.`, so distinct pairs never collide and the group can be
//! recovered from the storage key alone.
//!
//! Names must fit in one file name. A part whose hex form would not fit is
//! replaced by `~` followed by the hex SHA-256 of its bytes; `~` never occurs
//! in hex, so the two forms cannot collide. A digested key cannot be parsed
//! back and is recovered from the record header instead.

use std::fmt;

use sha2::{Digest, Sha256};

const STORAGE_KEY_TAG: char = 'g';
const SEPARATOR: char = '.';
const DIGEST_MARK: char = '~';

/// Longest hex group kept verbatim (a 64-byte group)
const MAX_GROUP_HEX: usize = 128;
/// Longest storage key built from verbatim parts. Digested names stay below
/// this too, leaving headroom under the usual 255-byte file name limit.
pub const MAX_STORAGE_KEY_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    group: String,
    key: String,
}

impl RecordKey {
    pub fn new(group: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            key: key.into(),
        }
    }

    /// A key outside of any group
    pub fn ungrouped(key: impl Into<String>) -> Self {
        Self::new(String::new(), key)
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Encode into the backend's flat key namespace
    pub fn storage_key(&self) -> String {
        let prefix = Self::group_prefix(&self.group);
        let key_hex = hex::encode(self.key.as_bytes());
        if prefix.len() + key_hex.len() <= MAX_STORAGE_KEY_LEN {
            format!("{}{}", prefix, key_hex)
        } else {
            format!("{}{}", prefix, digest(&self.key))
        }
    }

    /// Prefix shared by every storage key of `group`
    pub fn group_prefix(group: &str) -> String {
        let group_hex = hex::encode(group.as_bytes());
        let group_part = if group_hex.len() <= MAX_GROUP_HEX {
            group_hex
        } else {
            digest(group)
        };
        format!("{}{}{}", STORAGE_KEY_TAG, group_part, SEPARATOR)
    }

    /// Parse a storage key back into its pair. Returns `None` for anything
    /// that was not produced by [`RecordKey::storage_key`], and for names
    /// with a digested part.
    pub fn from_storage_key(storage_key: &str) -> Option<Self> {
        let (group_part, key_part) = split_storage_key(storage_key)?;
        let group = String::from_utf8(hex::decode(group_part).ok()?).ok()?;
        let key = String::from_utf8(hex::decode(key_part).ok()?).ok()?;
        Some(Self { group, key })
    }

    /// Whether `storage_key` has the shape of a name this module produces,
    /// digested or not.
    pub fn is_storage_key(storage_key: &str) -> bool {
        storage_key
            .strip_prefix(STORAGE_KEY_TAG)
            .and_then(|rest| rest.split_once(SEPARATOR))
            .is_some_and(|(group, key)| is_part(group) && is_part(key))
    }
}

fn digest(part: &str) -> String {
    format!("{}{}", DIGEST_MARK, hex::encode(Sha256::digest(part.as_bytes())))
}

fn is_part(part: &str) -> bool {
    match part.strip_prefix(DIGEST_MARK) {
        Some(digest) => digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit()),
        None => part.len() % 2 == 0 && part.bytes().all(|b| b.is_ascii_hexdigit()),
    }
}

/// Split a name with two verbatim hex parts
fn split_storage_key(storage_key: &str) -> Option<(&str, &str)> {
    let rest = storage_key.strip_prefix(STORAGE_KEY_TAG)?;
    let (group_hex, key_hex) = rest.split_once(SEPARATOR)?;
    if group_hex.starts_with(DIGEST_MARK) || key_hex.starts_with(DIGEST_MARK) {
        return None;
    }
    Some((group_hex, key_hex))
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.key)
        } else {
            write!(f, "{}/{}", self.group, self.key)
        }
    }
}
