// Revision ids of the sync gateway: `<generation>-<digest>`.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Length of the digest part of ids minted here.
pub const DIGEST_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevisionId {
    generation: u64,
    digest: String,
}

impl RevisionId {
    pub fn new(generation: u64, digest: impl Into<String>) -> Result<Self> {
        let digest = digest.into();
        if generation == 0 || digest.is_empty() || digest.contains('-') {
            return Err(Error::protocol(format!(
                "invalid revision {}-{}",
                generation, digest
            )));
        }
        Ok(Self { generation, digest })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The id with its `<generation>-` prefix stripped.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// The revision that follows this one: generation + 1 and a fresh
    /// random digest. The digest is not derived from the content, so two
    /// calls never produce the same id.
    pub fn next(&self) -> Result<RevisionId> {
        let generation = self.generation.checked_add(1).ok_or_else(|| {
            Error::protocol(format!("revision {} has no successor generation", self))
        })?;
        Ok(RevisionId {
            generation,
            digest: random_digest(),
        })
    }
}

/// 32 lowercase hex characters from 16 random bytes.
pub fn random_digest() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl FromStr for RevisionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (generation, digest) = s
            .split_once('-')
            .ok_or_else(|| Error::protocol(format!("revision {:?} has no generation prefix", s)))?;
        let generation = generation
            .parse()
            .map_err(|_| Error::protocol(format!("revision {:?} has a non-numeric generation", s)))?;
        RevisionId::new(generation, digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_lower_hex(s: &str) -> bool {
        s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    }

    #[test]
    fn parse_and_display() {
        let rev: RevisionId = "1-0123456789abcdef0123456789abcdef".parse().unwrap();
        assert_eq!(rev.generation(), 1);
        assert_eq!(rev.digest(), "0123456789abcdef0123456789abcdef");
        assert_eq!(rev.to_string(), "1-0123456789abcdef0123456789abcdef");
    }

    #[test]
    fn rejects_malformed_ids() {
        for bad in ["", "abc", "x-abc", "0-abc", "3-", "2-ab-cd"] {
            assert!(bad.parse::<RevisionId>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn next_increments_generation_with_random_hex_digest() {
        let prev: RevisionId = format!("1-{}", "a".repeat(32)).parse().unwrap();
        for _ in 0..50 {
            let next = prev.next().unwrap();
            assert_eq!(next.generation(), 2);
            assert_eq!(next.digest().len(), DIGEST_LEN);
            assert!(is_lower_hex(next.digest()));
        }
        assert_eq!(prev.next().unwrap().next().unwrap().generation(), 3);
    }

    #[test]
    fn successive_next_calls_diverge() {
        let prev: RevisionId = "1-abc".parse().unwrap();
        assert_ne!(prev.next().unwrap(), prev.next().unwrap());
    }

    #[test]
    fn last_generation_has_no_successor() {
        let last: RevisionId = format!("{}-abc", u64::MAX).parse().unwrap();
        assert!(matches!(last.next(), Err(Error::Protocol(_))));
    }
}
