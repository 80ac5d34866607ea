use std::sync::Arc;

use casgraph_core::{Cas, FsRef, IndexSpec};
use casgraph_types::builtin;
use casgraph_types::{IndexKind, KeyDirection, TypeSystem, TypeSystemBuilder};
use proptest::prelude::*;

fn ts() -> Arc<TypeSystem> {
    let mut b = TypeSystemBuilder::new();
    b.declare_type("Token", builtin::ANNOTATION).unwrap();
    b.declare_type("Word", "Token").unwrap();
    b.declare_feature("Token", "rank", builtin::INTEGER, false)
        .unwrap();
    b.declare_feature("Token", "label", builtin::STRING, false)
        .unwrap();
    b.commit().unwrap()
}

#[derive(Debug, Clone)]
enum Op {
    Add { begin: i32, end: i32, rank: i32, word: bool },
    Remove(usize),
    Rerank(usize, i32),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..50i32, 0..50i32, -5..5i32, any::<bool>())
            .prop_map(|(begin, end, rank, word)| Op::Add { begin, end, rank, word }),
        1 => any::<usize>().prop_map(Op::Remove),
        1 => (any::<usize>(), -5..5i32).prop_map(|(i, r)| Op::Rerank(i, r)),
    ]
}

fn key(cas: &Cas, fs: FsRef) -> (i32, std::cmp::Reverse<i32>, u32) {
    let (begin, end) = cas.span(fs).unwrap();
    let ty = cas.type_of(fs).unwrap();
    (begin, std::cmp::Reverse(end), cas.type_system().priority().rank(ty))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn sorted_indexes_stay_sorted_under_random_edits(ops in prop::collection::vec(op(), 1..80)) {
        let mut cas = Cas::new(ts()).unwrap();
        let view = cas.initial_view();
        let by_rank = IndexSpec::new("ByRank", "Token", IndexKind::Sorted)
            .with_key("rank", KeyDirection::Reverse)
            .with_key("label", KeyDirection::Standard);
        cas.declare_index(view, &by_rank).unwrap();
        let token = cas.type_system().get_type("Token").unwrap();
        let word = cas.type_system().get_type("Word").unwrap();

        let mut live: Vec<FsRef> = Vec::new();
        for op in ops {
            match op {
                Op::Add { begin, end, rank, word: is_word } => {
                    let ty = if is_word { word } else { token };
                    let fs = cas.create_annotation(view, ty, begin, end).unwrap();
                    let f = cas.feature_by_name(fs, "rank").unwrap();
                    cas.set_int(fs, f, rank).unwrap();
                    cas.add_to_index(view, fs).unwrap();
                    live.push(fs);
                }
                Op::Remove(i) if !live.is_empty() => {
                    let fs = live.swap_remove(i % live.len());
                    prop_assert!(cas.remove_from_index(view, fs).unwrap());
                }
                Op::Rerank(i, rank) if !live.is_empty() => {
                    let fs = live[i % live.len()];
                    let f = cas.feature_by_name(fs, "rank").unwrap();
                    cas.set_int(fs, f, rank).unwrap();
                }
                _ => {}
            }
        }

        let annotations: Vec<FsRef> = cas.annotation_index(view).unwrap().collect();
        prop_assert_eq!(annotations.len(), live.len());
        for pair in annotations.windows(2) {
            let (a, b) = (key(&cas, pair[0]), key(&cas, pair[1]));
            prop_assert!(a < b || (a == b && pair[0].id() < pair[1].id()));
        }

        let ranked: Vec<FsRef> = cas.iter(view, "ByRank", None).unwrap().collect();
        prop_assert_eq!(ranked.len(), live.len());
        let rank = cas.type_system().get_feature(token, "rank").unwrap();
        for pair in ranked.windows(2) {
            let a = cas.get_int(pair[0], rank).unwrap();
            let b = cas.get_int(pair[1], rank).unwrap();
            prop_assert!(a >= b);
        }

        let words: Vec<FsRef> = cas.iter(view, "ByRank", Some(word)).unwrap().collect();
        prop_assert!(words.iter().all(|fs| cas.type_of(*fs).unwrap() == word));
        let mut expected: Vec<FsRef> = live.iter().copied()
            .filter(|fs| cas.type_of(*fs).unwrap() == word)
            .collect();
        let mut got = words.clone();
        expected.sort();
        got.sort();
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn iterator_cursor_walks_back_and_forth(n in 0usize..30) {
        let mut cas = Cas::new(ts()).unwrap();
        let view = cas.initial_view();
        let token = cas.type_system().get_type("Token").unwrap();
        for i in 0..n {
            let fs = cas.create_annotation(view, token, i as i32, i as i32).unwrap();
            cas.add_to_index(view, fs).unwrap();
        }
        let mut it = cas.annotation_index(view).unwrap();
        let forward: Vec<FsRef> = it.clone().collect();
        let mut backward = Vec::new();
        it.move_to_last();
        while let Some(fs) = it.get() {
            backward.push(fs);
            it.retreat();
        }
        backward.reverse();
        prop_assert_eq!(forward, backward);
        it.restart();
        prop_assert_eq!(it.is_valid(), n > 0);
    }
}
