use std::sync::{Arc, RwLock};

/// Entity Reference - newtype to express entity boundaries
pub struct ERef<T: ?Sized>(Arc<RwLock<T>>);

impl<T: ?Sized> Clone for ERef<T> {
    fn clone(&self) -> Self {
        ERef(self.0.clone())
    }
}

impl<T: ?Sized> ERef<T> {
    pub fn new(element: T) -> Self
    where
        T: Sized,
    {
        Self(Arc::new(RwLock::new(element)))
    }

    pub fn read(&self) -> std::sync::RwLockReadGuard<'_, T> {
        self.0.read().unwrap()
    }

    pub fn write(&self) -> std::sync::RwLockWriteGuard<'_, T> {
        self.0.write().unwrap()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ERef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.read().unwrap().fmt(f)
    }
}
