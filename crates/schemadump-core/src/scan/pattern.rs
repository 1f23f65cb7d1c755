use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A compiled byte signature: one slot per byte, `None` matching anything.
///
/// Parsed from whitespace-separated tokens where each token is either two hex
/// digits or a `?`/`??` wildcard. Malformed tokens and empty patterns are
/// rejected rather than skipped; a silently shortened signature would match
/// the wrong site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    slots: Vec<Option<u8>>,
}

impl Pattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let mut slots = Vec::new();
        for token in pattern.split_whitespace() {
            if token == "?" || token == "??" {
                slots.push(None);
                continue;
            }

            if token.len() != 2 {
                return Err(Error::InvalidPattern(format!(
                    "token '{token}' is not a byte pair or wildcard"
                )));
            }
            let value = u8::from_str_radix(token, 16).map_err(|e| {
                Error::InvalidPattern(format!("invalid signature token '{token}': {e}"))
            })?;
            slots.push(Some(value));
        }

        if slots.is_empty() {
            return Err(Error::InvalidPattern("signature pattern is empty".to_string()));
        }

        Ok(Self { slots })
    }

    pub fn slots(&self) -> &[Option<u8>] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Smallest index in `buffer` where every slot matches, wildcards
    /// matching any byte. The bound uses the compiled length, so a match at
    /// the last eligible offset is found.
    pub fn find_in(&self, buffer: &[u8]) -> Option<usize> {
        if buffer.len() < self.slots.len() {
            return None;
        }

        let last = buffer.len() - self.slots.len();
        'outer: for i in 0..=last {
            for (j, slot) in self.slots.iter().enumerate() {
                if let Some(value) = slot
                    && buffer[i + j] != *value
                {
                    continue 'outer;
                }
            }
            return Some(i);
        }

        None
    }
}

impl FromStr for Pattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .slots
            .iter()
            .map(|slot| match slot {
                Some(value) => format!("{value:02X}"),
                None => "??".to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ");
        f.write_str(&rendered)
    }
}
