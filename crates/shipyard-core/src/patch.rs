//! Partial-update field type.
//!
//! A request body field is either absent (`Keep`) or present (`Set`). For
//! nullable fields use `Patch<Option<T>>`: JSON `null` becomes `Set(None)`.
//! Fields must be declared with `#[serde(default)]` so absence maps to `Keep`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Patch<T> {
    #[default]
    Keep,
    Set(T),
}

impl<T> Patch<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, Patch::Keep)
    }

    pub fn as_set(&self) -> Option<&T> {
        match self {
            Patch::Set(v) => Some(v),
            Patch::Keep => None,
        }
    }
}

impl<T: PartialEq + Clone> Patch<T> {
    /// Overwrite `target` when set and different. Returns whether it changed.
    pub fn apply_to(&self, target: &mut T) -> bool {
        match self {
            Patch::Set(v) if target != v => {
                *target = v.clone();
                true
            }
            _ => false,
        }
    }
}

impl<T> From<Option<T>> for Patch<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Patch::Set(v),
            None => Patch::Keep,
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Patch<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Patch::Set)
    }
}

impl<T: Serialize> Serialize for Patch<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Patch::Set(v) => v.serialize(serializer),
            Patch::Keep => serializer.serialize_none(),
        }
    }
}
