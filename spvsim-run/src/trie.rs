//! A path-compressed trie for command completion.
//!
//! Each node stores the key fragment leading to it; children are kept
//! sorted by their first byte so enumeration is lexicographic regardless
//! of insertion order.

#[derive(Debug, Default)]
pub struct Trie {
    key: Vec<u8>,
    children: Vec<Trie>,
    value: Option<u32>,
}

impl Trie {
    pub fn new() -> Trie {
        Trie::default()
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }
    pub fn value(&self) -> Option<u32> {
        self.value
    }

    /// Find the child index for a leading byte.
    /// Returns `(index, exact)`; without an exact match, `index` is where
    /// an insertion belongs.
    fn index(&self, key: u8) -> (usize, bool) {
        let mut lo = 0;
        let mut hi = self.children.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let probe = self.children[mid].key[0];
            if key > probe {
                lo = mid + 1;
            } else if key < probe {
                hi = mid;
            } else {
                return (mid, true);
            }
        }
        (lo, false)
    }

    /// Insert the key with its value. Inserting over an existing key
    /// overwrites the stored value.
    pub fn insert(&mut self, key: &str, value: u32) {
        self.insert_bytes(key.as_bytes(), value);
    }

    fn insert_bytes(&mut self, key: &[u8], value: u32) {
        if key.is_empty() {
            self.value = Some(value);
            return;
        }
        let (at, exact) = self.index(key[0]);
        if !exact {
            self.children.insert(
                at,
                Trie {
                    key: key.to_vec(),
                    children: Vec::new(),
                    value: Some(value),
                },
            );
            return;
        }

        let other = &mut self.children[at];
        let common = other
            .key
            .iter()
            .zip(key.iter())
            .take_while(|(a, b)| a == b)
            .count();
        if common == other.key.len() {
            // The new key extends through the existing node.
            other.insert_bytes(&key[common..], value);
        } else {
            // Split the existing node at the common prefix.
            let split = Trie {
                key: other.key[common..].to_vec(),
                children: std::mem::take(&mut other.children),
                value: other.value.take(),
            };
            other.key.truncate(common);
            if common == key.len() {
                // The new key is exactly the prefix.
                other.value = Some(value);
                other.children = vec![split];
            } else {
                let fresh = Trie {
                    key: key[common..].to_vec(),
                    children: Vec::new(),
                    value: Some(value),
                };
                other.value = None;
                other.children = if fresh.key[0] < split.key[0] {
                    vec![fresh, split]
                } else {
                    vec![split, fresh]
                };
            }
        }
    }

    /// Find the node the key abbreviates: the node whose full key extends
    /// the search key by some (possibly empty) suffix. Returns the node
    /// and the missing suffix, or None when no stored key starts with the
    /// search key.
    pub fn next(&self, key: &str) -> Option<(&Trie, String)> {
        self.next_bytes(key.as_bytes())
            .map(|(node, missing)| (node, String::from_utf8_lossy(&missing).into_owned()))
    }

    fn next_bytes(&self, key: &[u8]) -> Option<(&Trie, Vec<u8>)> {
        if key.is_empty() {
            return Some((self, Vec::new()));
        }
        let (at, exact) = self.index(key[0]);
        if !exact {
            return None;
        }
        let other = &self.children[at];
        let common = other
            .key
            .iter()
            .zip(key.iter())
            .take_while(|(a, b)| a == b)
            .count();
        if common == key.len() {
            return Some((other, other.key[common..].to_vec()));
        }
        if common == other.key.len() {
            return other.next_bytes(&key[common..]);
        }
        None
    }

    /// All stored keys, in lexicographic order.
    pub fn enumerate(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.enumerate_into(&mut Vec::new(), &mut out);
        out
    }

    fn enumerate_into(&self, prefix: &mut Vec<u8>, out: &mut Vec<String>) {
        if self.value.is_some() {
            out.push(String::from_utf8_lossy(prefix).into_owned());
        }
        for child in &self.children {
            prefix.extend_from_slice(&child.key);
            child.enumerate_into(prefix, out);
            prefix.truncate(prefix.len() - child.key.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn keys_enumerate_in_lexicographic_order() {
        let keys = ["step", "stack", "run", "state", "quit", "print", "s"];
        let mut trie = Trie::new();
        // Insert in a scrambled order.
        for (i, key) in keys.iter().rev().enumerate() {
            trie.insert(key, i as u32);
        }
        let mut expected: Vec<String> = keys.iter().map(|s| s.to_string()).collect();
        expected.sort();
        assert_eq!(trie.enumerate(), expected);
    }

    #[test]
    fn prefixes_resolve() {
        let mut trie = Trie::new();
        trie.insert("step", 1);
        trie.insert("stack", 2);
        trie.insert("run", 3);

        // "r" uniquely abbreviates "run".
        let (node, missing) = trie.next("r").unwrap();
        assert_eq!(node.value(), Some(3));
        assert_eq!(missing, "un");

        // "st" is ambiguous: the node exists but carries no value.
        let (node, _) = trie.next("st").unwrap();
        assert!(!node.has_value());

        // "ste" disambiguates.
        let (node, missing) = trie.next("ste").unwrap();
        assert_eq!(node.value(), Some(1));
        assert_eq!(missing, "p");

        // A full match has nothing missing.
        let (node, missing) = trie.next("stack").unwrap();
        assert_eq!(node.value(), Some(2));
        assert_eq!(missing, "");

        // Exceeding every key fails.
        assert!(trie.next("stepper").is_none());
        assert!(trie.next("x").is_none());
    }

    #[test]
    fn every_proper_prefix_of_a_key_resolves() {
        let keys = ["alpha", "beta", "bet", "gamma"];
        let mut trie = Trie::new();
        for (i, key) in keys.iter().enumerate() {
            trie.insert(key, i as u32);
        }
        for key in &keys {
            for cut in 1..key.len() {
                assert!(
                    trie.next(&key[..cut]).is_some(),
                    "prefix {} of {} did not resolve",
                    &key[..cut],
                    key
                );
            }
        }
    }

    #[test]
    fn insert_over_existing_key_overwrites() {
        let mut trie = Trie::new();
        trie.insert("run", 1);
        trie.insert("run", 9);
        let (node, _) = trie.next("run").unwrap();
        assert_eq!(node.value(), Some(9));
        assert_eq!(trie.enumerate().len(), 1);
    }

    #[test]
    fn splitting_preserves_subtrees() {
        let mut trie = Trie::new();
        trie.insert("abcdef", 1);
        trie.insert("abcxyz", 2);
        trie.insert("ab", 3);
        assert_eq!(trie.enumerate(), vec!["ab", "abcdef", "abcxyz"]);
        let (node, _) = trie.next("ab").unwrap();
        assert_eq!(node.value(), Some(3));
    }
}
