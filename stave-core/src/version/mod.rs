//! Dataset versions
//!
//! Version identity and ordering, the local candidate scan, and
//! loading a version into memory.

pub mod loader;
pub mod tracker;

pub use loader::{LoadedVersion, LoaderConfig, VersionLoader};
pub use tracker::{TrackerConfig, VersionTracker};

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// An immutable dataset version, named after its backend directory.
///
/// Versions are ordered naturally: runs of digits compare as numbers,
/// so `v9 < v10` and `20240102 < 20240103`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    /// Create a version from its name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Version name
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a published value; empty means nothing published
    pub fn from_published(value: &[u8]) -> Option<Self> {
        let name = String::from_utf8_lossy(value);
        let name = name.trim();
        if name.is_empty() {
            None
        } else {
            Some(Self(name.to_string()))
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Version {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        natural_cmp(&self.0, &other.0).then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a = Chunks::new(a);
    let mut b = Chunks::new(b);
    loop {
        match (a.next(), b.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x, y) {
                    (Chunk::Digits(x), Chunk::Digits(y)) => {
                        let x = x.trim_start_matches('0');
                        let y = y.trim_start_matches('0');
                        x.len().cmp(&y.len()).then_with(|| x.cmp(y))
                    }
                    (Chunk::Digits(_), Chunk::Text(_)) => Ordering::Less,
                    (Chunk::Text(_), Chunk::Digits(_)) => Ordering::Greater,
                    (Chunk::Text(x), Chunk::Text(y)) => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

enum Chunk<'a> {
    Digits(&'a str),
    Text(&'a str),
}

struct Chunks<'a> {
    rest: &'a str,
}

impl<'a> Chunks<'a> {
    fn new(s: &'a str) -> Self {
        Self { rest: s }
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Chunk<'a>> {
        let first = self.rest.chars().next()?;
        let digits = first.is_ascii_digit();
        let end = self
            .rest
            .find(|c: char| c.is_ascii_digit() != digits)
            .unwrap_or(self.rest.len());
        let (chunk, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(if digits {
            Chunk::Digits(chunk)
        } else {
            Chunk::Text(chunk)
        })
    }
}
