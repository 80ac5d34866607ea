//! Type priorities resolved into a total order.
//!
//! Each declared list `[A, B, C]` contributes the constraints `A < B` and
//! `B < C`. Listed types are topologically sorted (ties broken by type code,
//! i.e. hierarchy pre-order). A type that is not listed takes the position of
//! its nearest listed ancestor and sorts right after it; types with no listed
//! ancestor come last, in pre-order. Lists that contradict each other form a
//! cycle and are rejected with `PriorityCycle`.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use ahash::{AHashMap, AHashSet};

use crate::error::{Result, TypeSystemError};
use crate::type_system::{TypeCode, TypeInfo};

#[derive(Debug, Clone)]
pub struct LinearTypeOrder {
    rank: Vec<u32>,
    order: Vec<TypeCode>,
}

impl LinearTypeOrder {
    pub(crate) fn build(
        types: &[TypeInfo],
        by_name: &AHashMap<String, TypeCode>,
        lists: &[Vec<String>],
    ) -> Result<Self> {
        let n = types.len();
        let mut listed = vec![false; n];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut indegree = vec![0usize; n];
        let mut seen_edges: AHashSet<(usize, usize)> = AHashSet::new();

        for list in lists {
            let mut codes = Vec::with_capacity(list.len());
            for name in list {
                let code = by_name
                    .get(name)
                    .ok_or_else(|| TypeSystemError::UnknownType(name.clone()))?;
                codes.push(code.index());
            }
            for &c in &codes {
                listed[c] = true;
            }
            for pair in codes.windows(2) {
                let (a, b) = (pair[0], pair[1]);
                if seen_edges.insert((a, b)) {
                    successors[a].push(b);
                    indegree[b] += 1;
                }
            }
        }

        let listed_count = listed.iter().filter(|l| **l).count();
        let mut position: Vec<Option<usize>> = vec![None; n];
        let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
            .filter(|&t| listed[t] && indegree[t] == 0)
            .map(Reverse)
            .collect();
        let mut emitted = 0usize;
        while let Some(Reverse(t)) = ready.pop() {
            position[t] = Some(emitted);
            emitted += 1;
            for &s in &successors[t] {
                indegree[s] -= 1;
                if indegree[s] == 0 {
                    ready.push(Reverse(s));
                }
            }
        }
        if emitted < listed_count {
            let types = (0..n)
                .filter(|&t| listed[t] && position[t].is_none())
                .map(|t| types[t].name().to_string())
                .collect();
            return Err(TypeSystemError::PriorityCycle { types });
        }

        // Codes are pre-order, so a parent's anchor is known before its children.
        let mut anchor: Vec<usize> = vec![usize::MAX; n];
        for info in types {
            let t = info.code().index();
            anchor[t] = match position[t] {
                Some(p) => p,
                None => info
                    .supertype()
                    .map(|s| anchor[s.index()])
                    .unwrap_or(usize::MAX),
            };
        }

        let mut order: Vec<TypeCode> = types.iter().map(|t| t.code()).collect();
        order.sort_by_key(|t| (anchor[t.index()], t.raw()));
        let mut rank = vec![0u32; n];
        for (i, t) in order.iter().enumerate() {
            rank[t.index()] = i as u32;
        }

        Ok(Self { rank, order })
    }

    pub fn rank(&self, ty: TypeCode) -> u32 {
        self.rank[ty.index()]
    }

    pub fn compare(&self, a: TypeCode, b: TypeCode) -> Ordering {
        self.rank(a).cmp(&self.rank(b))
    }

    pub fn less_than(&self, a: TypeCode, b: TypeCode) -> bool {
        self.rank(a) < self.rank(b)
    }

    /// All types, highest priority first.
    pub fn order(&self) -> &[TypeCode] {
        &self.order
    }
}
