//! Resumption cursor for the commit-log reader.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// `(commit-log file, byte position)` resumption cursor, ordered
/// lexicographically by `(file, position)` as required by the monotone
/// offset invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub file: String,
    pub position: u64,
}

impl Token {
    pub fn new(file: impl Into<String>, position: u64) -> Self {
        Token { file: file.into(), position }
    }
}

impl PartialOrd for Token {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Token {
    fn cmp(&self, other: &Self) -> Ordering {
        self.file.cmp(&other.file).then(self.position.cmp(&other.position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_lexicographic_by_file_then_position() {
        let a = Token::new("commitlog-0001.log", 100);
        let b = Token::new("commitlog-0001.log", 200);
        let c = Token::new("commitlog-0002.log", 0);
        assert!(a < b);
        assert!(b < c);
    }
}
