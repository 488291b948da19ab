use serde::{Deserialize, Serialize};

macro_rules! impl_uuid {
    ($struct_name:ty) => {
        impl $struct_name {
            pub fn now_v7() -> Self {
                Self { inner: uuid::Uuid::now_v7() }
            }

            pub fn is_nil(&self) -> bool {
                self.inner.is_nil()
            }
        }

        impl From<uuid::Uuid> for $struct_name {
            fn from(value: uuid::Uuid) -> Self {
                Self { inner: value }
            }
        }

        impl std::fmt::Display for $struct_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.inner.fmt(f)
            }
        }
    };
}

/// Identity of a part in the backend scenario model.
#[derive(Clone, Copy, Debug, Hash, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartId {
    inner: uuid::Uuid,
}

impl_uuid!(PartId);

#[derive(Clone, Copy, Debug, Hash, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkId {
    inner: uuid::Uuid,
}

impl_uuid!(LinkId);

#[derive(Clone, Copy, Debug, Hash, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WaypointId {
    inner: uuid::Uuid,
}

impl_uuid!(WaypointId);

#[derive(Clone, Copy, Debug, Hash, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId {
    inner: uuid::Uuid,
}

impl_uuid!(PortId);

/// Session-local identity of a scene item. Unlike the backend ids these are
/// plain counters: items exist only for the lifetime of one scene.
#[derive(Clone, Copy, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ItemId(u64);

impl ItemId {
    pub const NIL: Self = ItemId(0);

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        ItemId(raw)
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct ItemIdGen {
    next: u64,
}

impl ItemIdGen {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    pub fn next(&mut self) -> ItemId {
        self.next += 1;
        ItemId(self.next)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_item_ids_are_unique_and_never_nil() {
        let mut ids = ItemIdGen::new();
        let a = ids.next();
        let b = ids.next();
        assert_ne!(a, b);
        assert_ne!(a, ItemId::NIL);
    }

    #[test]
    fn test_part_id_nil() {
        let id = PartId::from(uuid::Uuid::nil());
        assert!(id.is_nil());
        assert!(!PartId::now_v7().is_nil());
    }
}
