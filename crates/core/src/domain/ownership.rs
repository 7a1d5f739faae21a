//! Owned-or-shared collaborators

use std::ops::Deref;
use std::sync::Arc;

/// A collaborator either owned by its user or shared with others
///
/// The variant is fixed at construction. Dropping an `Owned` value drops the
/// collaborator; dropping a `Borrowed` one only releases this reference.
#[derive(Debug)]
pub enum Ownership<T> {
    Owned(T),
    Borrowed(Arc<T>),
}

impl<T> Ownership<T> {
    pub fn is_owned(&self) -> bool {
        matches!(self, Ownership::Owned(_))
    }
}

impl<T> Deref for Ownership<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self {
            Ownership::Owned(value) => value,
            Ownership::Borrowed(shared) => shared,
        }
    }
}

impl<T> From<Arc<T>> for Ownership<T> {
    fn from(shared: Arc<T>) -> Self {
        Ownership::Borrowed(shared)
    }
}
