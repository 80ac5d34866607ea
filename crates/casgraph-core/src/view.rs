//! Views: named subjects of analysis, each with its own index repository.

use crate::index::IndexRepository;

/// Name of the view every CAS starts with.
pub const INITIAL_VIEW: &str = "_InitialView";

/// Handle to a view of a CAS. Views are never removed except by `reset`,
/// after which only the initial view remains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(u32);

impl ViewId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index as u32)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
pub(crate) struct View {
    pub name: String,
    /// Id of the backing `cas.Sofa` structure.
    pub sofa: u32,
    pub indexes: IndexRepository,
}

/// One index add or remove, recorded while a mark is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexEvent {
    pub view: u32,
    pub id: u32,
    pub added: bool,
}
