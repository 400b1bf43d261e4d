use core::fmt::Debug;
use core::hash::Hash;

/// Max parent links followed when walking a state hierarchy.
const MAX_DEPTH: usize = 16;

/// Identifier of a state in a closed catalog.
///
/// The hierarchy is expressed through [`StateId::parent`]; root states return
/// `None`. It is expected to be shallow (a few levels at most).
pub trait StateId: Copy + Ord + Eq + Hash + Debug + Send + 'static {
    fn name(self) -> &'static str;

    fn parent(self) -> Option<Self> {
        None
    }

    /// Parent, grandparent, ... up to the root.
    fn ancestors(self) -> Vec<Self> {
        let mut out = Vec::new();
        let mut cursor = self.parent();
        while let Some(state) = cursor {
            if out.len() >= MAX_DEPTH || state == self || out.contains(&state) {
                break;
            }
            out.push(state);
            cursor = state.parent();
        }
        out
    }

    /// `true` if `self` is `other` or one of its descendants.
    fn is_within(self, other: Self) -> bool {
        self == other || self.ancestors().contains(&other)
    }
}

impl StateId for &'static str {
    fn name(self) -> &'static str {
        self
    }
}
