//! Canonical bin-name sets.
//!
//! Every multi-bin acquisition walks its bins in this order. Two callers that
//! ask for overlapping sets in different orders therefore lock bins in the
//! same order and cannot deadlock.

use std::fmt;

/// Bin names sorted lexicographically with duplicates removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BinSet(Vec<String>);

impl BinSet {
    pub fn new<I, S>(bins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = bins.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();
        Self(names)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl<'a> IntoIterator for &'a BinSet {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<S: Into<String>> FromIterator<S> for BinSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl fmt::Display for BinSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_and_deduplicated() {
        let set = BinSet::new(["b", "a", "c", "a"]);
        assert_eq!(set.as_slice(), ["a", "b", "c"]);
        assert_eq!(set, BinSet::new(["c", "b", "a"]));
        assert_eq!(set.to_string(), "[a, b, c]");
    }

    #[test]
    fn empty_set() {
        let set: BinSet = Vec::<String>::new().into_iter().collect();
        assert!(set.is_empty());
        assert_eq!(set.len(), 0);
    }
}
