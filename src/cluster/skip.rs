use std::collections::BTreeSet;
use std::net::Ipv6Addr;

/// Address pairs that must never be tested against each other.
///
/// Pairs are stored with the lower address first so lookup is independent
/// of argument order.
#[derive(Debug, Default, Clone)]
pub struct SkipPairs {
    pairs: BTreeSet<(Ipv6Addr, Ipv6Addr)>,
}

impl SkipPairs {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(a: Ipv6Addr, b: Ipv6Addr) -> (Ipv6Addr, Ipv6Addr) {
        if a < b {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Returns false if the pair was already present.
    pub fn insert(&mut self, a: Ipv6Addr, b: Ipv6Addr) -> bool {
        self.pairs.insert(Self::key(a, b))
    }

    pub fn contains(&self, a: Ipv6Addr, b: Ipv6Addr) -> bool {
        self.pairs.contains(&Self::key(a, b))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_unordered() {
        let a: Ipv6Addr = "2001:db8::1".parse().expect("valid addr");
        let b: Ipv6Addr = "2001:db8::2".parse().expect("valid addr");
        let c: Ipv6Addr = "2001:db8::3".parse().expect("valid addr");

        let mut skip = SkipPairs::new();
        assert!(skip.insert(b, a));
        assert!(!skip.insert(a, b));
        assert!(skip.contains(a, b));
        assert!(skip.contains(b, a));
        assert!(!skip.contains(a, c));
        assert_eq!(skip.len(), 1);
    }
}
