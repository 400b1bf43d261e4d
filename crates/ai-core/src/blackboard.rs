use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BbKey<T: 'static> {
    id: u64,
    _phantom: PhantomData<fn() -> T>,
}

impl<T: 'static> Copy for BbKey<T> {}

impl<T: 'static> Clone for BbKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: 'static> BbKey<T> {
    pub const fn new(id: u64) -> Self {
        Self {
            id,
            _phantom: PhantomData,
        }
    }

    pub fn id(self) -> u64 {
        self.id
    }
}

/// Stored value has a different type than the key requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlackboardError {
    pub key_id: u64,
}

impl fmt::Display for BlackboardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "blackboard type mismatch for key id={} (stored type differs from requested)",
            self.key_id
        )
    }
}

impl std::error::Error for BlackboardError {}

/// Typed scratch storage shared by guards and tasks.
///
/// Values must be `Send` so the owning context can move into an async driver.
#[derive(Default)]
pub struct Blackboard {
    values: BTreeMap<u64, Box<dyn Any + Send>>,
}

impl fmt::Debug for Blackboard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blackboard")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Blackboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains<T: 'static>(&self, key: BbKey<T>) -> bool {
        self.values.contains_key(&key.id)
    }

    pub fn set<T: Send + 'static>(&mut self, key: BbKey<T>, value: T) {
        self.values.insert(key.id, Box::new(value));
    }

    /// Reads a value, reporting a type mismatch instead of hiding it.
    pub fn try_get<T: 'static>(&self, key: BbKey<T>) -> Result<Option<&T>, BlackboardError> {
        match self.values.get(&key.id) {
            None => Ok(None),
            Some(value) => value
                .downcast_ref::<T>()
                .map(Some)
                .ok_or(BlackboardError { key_id: key.id }),
        }
    }

    pub fn get<T: 'static>(&self, key: BbKey<T>) -> Option<&T> {
        self.try_get(key).ok().flatten()
    }

    pub fn get_mut<T: 'static>(&mut self, key: BbKey<T>) -> Option<&mut T> {
        self.values.get_mut(&key.id)?.downcast_mut::<T>()
    }

    pub fn remove<T: 'static>(&mut self, key: BbKey<T>) -> Option<T> {
        let value = self.values.remove(&key.id)?;
        match value.downcast::<T>() {
            Ok(boxed) => Some(*boxed),
            Err(original) => {
                // Wrong type: put it back untouched.
                self.values.insert(key.id, original);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HP: BbKey<u32> = BbKey::new(1);
    const NAME: BbKey<String> = BbKey::new(1);

    #[test]
    fn set_and_get_round_trip() {
        let mut bb = Blackboard::new();
        bb.set(HP, 42);
        assert_eq!(bb.get(HP), Some(&42));
        assert!(bb.contains(HP));
        assert_eq!(bb.remove(HP), Some(42));
        assert!(bb.is_empty());
    }

    #[test]
    fn type_mismatch_is_reported_not_panicked() {
        let mut bb = Blackboard::new();
        bb.set(HP, 7);
        assert_eq!(bb.try_get(NAME), Err(BlackboardError { key_id: 1 }));
        assert_eq!(bb.get(NAME), None);
        assert_eq!(bb.remove(NAME), None);
        assert_eq!(bb.get(HP), Some(&7));
    }
}
