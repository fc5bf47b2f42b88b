use super::*;

use proptest::prelude::*;
use proptest_derive::Arbitrary;
use std::collections::BTreeMap;

fn validate_tree<K: ?Sized + IndexKey, P: Persistence>(t: &Woart<K, P>, expected_len: usize) {
    let issues = t.verify();
    assert!(issues.is_empty(), "integrity issues: {issues:?}");

    let stats = t.stats();
    assert_eq!(stats.leaf_count, expected_len, "reachable leaf count must match len");
    assert_eq!(t.len(), expected_len);
    if expected_len > 1 {
        assert!(stats.inner_count() > 0);
    }
}

/// Byte keys over a tiny alphabet so paths share prefixes and nodes fill up,
/// plus keys under a long common prefix to exercise truncated headers.
fn byte_key() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        4 => prop::collection::vec(0u8..4, 1..=8),
        1 => prop::collection::vec(any::<u8>(), 1..=3),
        1 => prop::collection::vec(0u8..4, 0..=4).prop_map(|tail| {
            let mut k = b"/shared/prefix/longer/than/six/".to_vec();
            k.extend(tail);
            k
        }),
    ]
}

fn int_key() -> impl Strategy<Value = u64> {
    prop_oneof![
        0u64..64,
        any::<u64>(),
        (0u64..32).prop_map(|x| x << 40),
        (0u64..8, 0u64..8).prop_map(|(hi, lo)| (hi << 60) | lo),
    ]
}

#[derive(Clone, Debug, Arbitrary)]
enum ByteOp {
    #[proptest(weight = 6)]
    Insert(#[proptest(strategy = "byte_key()")] Vec<u8>, u64),
    #[proptest(weight = 2)]
    Search(#[proptest(strategy = "byte_key()")] Vec<u8>),
    #[proptest(weight = 1)]
    Scan(#[proptest(strategy = "byte_key()")] Vec<u8>, #[proptest(strategy = "0usize..24")] usize),
}

#[derive(Clone, Debug, Arbitrary)]
enum IntOp {
    #[proptest(weight = 6)]
    Insert(#[proptest(strategy = "int_key()")] u64, u64),
    #[proptest(weight = 2)]
    Search(#[proptest(strategy = "int_key()")] u64),
    #[proptest(weight = 1)]
    Scan(#[proptest(strategy = "int_key()")] u64, #[proptest(strategy = "0usize..24")] usize),
    /// Rebuild the durable image from the journal and compare.
    #[proptest(weight = 1)]
    Recover,
}

/// Whether `key` and some other stored key are proper prefixes of each other.
fn conflicts(m: &BTreeMap<Vec<u8>, u64>, key: &[u8]) -> bool {
    m.keys()
        .any(|k| k.as_slice() != key && (k.starts_with(key) || key.starts_with(k)))
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 50_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_equivalence_bytes(ops in prop::collection::vec(any::<ByteOp>(), 0..=1000)) {
        let t = BytesWoart::new();
        let mut m: BTreeMap<Vec<u8>, u64> = BTreeMap::new();

        for op in ops {
            match op {
                ByteOp::Insert(key, value) => {
                    let got = t.insert(&key, value);
                    if conflicts(&m, &key) {
                        prop_assert!(matches!(got, Err(Error::PrefixConflict)), "{:?}", got);
                    } else {
                        prop_assert_eq!(got.ok(), Some(m.insert(key, value)));
                    }
                }
                ByteOp::Search(key) => {
                    prop_assert_eq!(t.search(&key), m.get(&key).copied());
                }
                ByteOp::Scan(min, count) => {
                    let expected: Vec<(Vec<u8>, u64)> =
                        m.range(min.clone()..).take(count).map(|(k, v)| (k.clone(), *v)).collect();
                    prop_assert_eq!(t.scan_entries(&min, count), expected);
                }
            }

            prop_assert_eq!(t.len(), m.len());
        }

        validate_tree(&t, m.len());
        let got = t.scan_entries(b"", usize::MAX);
        let expected: Vec<(Vec<u8>, u64)> = m.iter().map(|(k, v)| (k.clone(), *v)).collect();
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn prop_equivalence_integers(ops in prop::collection::vec(any::<IntOp>(), 0..=1000)) {
        let t: IntWoart<Journal> = Woart::with_backend(Config::default(), Journal::new()).unwrap();
        let mut m: BTreeMap<u64, u64> = BTreeMap::new();

        for op in ops {
            match op {
                IntOp::Insert(key, value) => {
                    prop_assert_eq!(t.insert(&key, value).unwrap(), m.insert(key, value));
                }
                IntOp::Search(key) => {
                    prop_assert_eq!(t.search(&key), m.get(&key).copied());
                }
                IntOp::Scan(min, count) => {
                    let expected: Vec<(u64, u64)> = m.range(min..).take(count).map(|(k, v)| (*k, *v)).collect();
                    prop_assert_eq!(t.scan_entries(&min, count), expected);
                }
                IntOp::Recover => {
                    let image = {
                        let journal = t.backend();
                        journal.image(t.config().chunk_size, journal.len())
                    };
                    let r: IntWoart = Woart::recover(Config::default(), image, NoFlush).unwrap();
                    let expected: Vec<(u64, u64)> = m.iter().map(|(k, v)| (*k, *v)).collect();
                    prop_assert_eq!(r.scan_entries(&0, usize::MAX), expected);
                    validate_tree(&r, m.len());
                }
            }

            prop_assert_eq!(t.len(), m.len());
        }

        validate_tree(&t, m.len());
        prop_assert_eq!(t.minimum(), m.iter().next().map(|(k, v)| (*k, *v)));
    }
}

fn for_each_permutation<T: Clone>(items: &[T], mut f: impl FnMut(Vec<T>)) {
    fn rec<T: Clone>(items: &[T], used: &mut [bool], out: &mut Vec<T>, f: &mut impl FnMut(Vec<T>)) {
        if out.len() == items.len() {
            f(out.clone());
            return;
        }
        for i in 0..items.len() {
            if used[i] {
                continue;
            }
            used[i] = true;
            out.push(items[i].clone());
            rec(items, used, out, f);
            out.pop();
            used[i] = false;
        }
    }

    let mut used = vec![false; items.len()];
    let mut out = Vec::with_capacity(items.len());
    rec(items, &mut used, &mut out, &mut f);
}

#[test]
fn exhaustive_insert_order_small_set() {
    // Every pair splits somewhere: leaf splits, mid-path splits at each offset
    // and a split of a path longer than the inline partial.
    let keys: Vec<Vec<u8>> = vec![
        b"ab".to_vec(),
        b"ac".to_vec(),
        b"ba".to_vec(),
        b"abcdefghij1".to_vec(),
        b"abcdefghij2".to_vec(),
        b"abcdXfghij3".to_vec(),
    ];

    for_each_permutation(&keys, |perm| {
        let t = BytesWoart::new();
        let mut m: BTreeMap<Vec<u8>, u64> = BTreeMap::new();

        for (i, k) in perm.into_iter().enumerate() {
            let v = i as u64;
            let got = t.insert(&k, v);
            if conflicts(&m, &k) {
                assert!(matches!(got, Err(Error::PrefixConflict)));
            } else {
                assert_eq!(got.unwrap(), m.insert(k, v));
            }
        }

        validate_tree(&t, m.len());
        let got = t.scan_entries(b"", usize::MAX);
        let expected: Vec<(Vec<u8>, u64)> = m.iter().map(|(k, v)| (k.clone(), *v)).collect();
        assert_eq!(got, expected);
    });
}

#[test]
fn exhaustive_insert_order_integers() {
    let keys: Vec<u64> = vec![0, 1, 0x10, 0x11, 0xF000_0000, 0xF000_0001, u64::MAX];

    for_each_permutation(&keys, |perm| {
        let t = IntWoart::new();
        for &k in &perm {
            assert_eq!(t.insert(&k, k ^ 0xFF).unwrap(), None);
        }
        validate_tree(&t, keys.len());

        let mut sorted = keys.clone();
        sorted.sort_unstable();
        let expected: Vec<(u64, u64)> = sorted.iter().map(|&k| (k, k ^ 0xFF)).collect();
        assert_eq!(t.scan_entries(&0, usize::MAX), expected);
    });
}
