//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Natural keys are value objects: two `Isbn`s holding the same normalized
/// text are the same key no matter which service produced them. Entities, by
/// contrast, are identified by a surrogate id that only means something inside
/// the store that assigned it.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
