//! Differences between an applied and a desired configuration.

use std::collections::BTreeMap;

/// What has to change to move from one keyed configuration to another.
#[derive(Debug, PartialEq, Eq)]
pub struct Diff<K, V> {
    /// Keys only present in the desired configuration.
    pub added: Vec<(K, V)>,
    /// Keys present in both, with a different value; holds the desired value.
    pub changed: Vec<(K, V)>,
    /// Keys only present in the applied configuration.
    pub removed: Vec<(K, V)>,
}

/// Compare `applied` against `desired`.
pub fn diff<K, V>(applied: &BTreeMap<K, V>, desired: &BTreeMap<K, V>) -> Diff<K, V>
where
    K: Ord + Clone,
    V: PartialEq + Clone,
{
    let mut out = Diff {
        added: Vec::new(),
        changed: Vec::new(),
        removed: Vec::new(),
    };
    for (key, want) in desired {
        match applied.get(key) {
            None => out.added.push((key.clone(), want.clone())),
            Some(have) if have != want => out.changed.push((key.clone(), want.clone())),
            Some(_) => {}
        }
    }
    for (key, have) in applied {
        if !desired.contains_key(key) {
            out.removed.push((key.clone(), have.clone()));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff() {
        let applied = BTreeMap::from([(1, "a"), (2, "b"), (3, "c")]);
        let desired = BTreeMap::from([(2, "b"), (3, "x"), (4, "d")]);

        let d = diff(&applied, &desired);
        assert_eq!(d.added, vec![(4, "d")]);
        assert_eq!(d.changed, vec![(3, "x")]);
        assert_eq!(d.removed, vec![(1, "a")]);
        let same = diff(&desired, &desired);
        assert!(same.added.is_empty() && same.changed.is_empty() && same.removed.is_empty());
    }
}
