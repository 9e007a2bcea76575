//! Value representation
//!
//! A `Value` is what lives in object fields, root slots, static fields and
//! interpreter stacks: either nothing, a scalar, or a reference into the heap.

use crate::heap::ObjectRef;
use std::fmt;

/// A VM value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Value {
    /// Null reference / uninitialized slot
    #[default]
    Null,
    /// 64-bit integer scalar
    Int(i64),
    /// Reference to a heap object
    Ref(ObjectRef),
}

impl Value {
    /// The null value
    #[inline]
    pub const fn null() -> Self {
        Value::Null
    }

    /// An integer value
    #[inline]
    pub const fn int(v: i64) -> Self {
        Value::Int(v)
    }

    /// A reference value
    #[inline]
    pub const fn object(obj: ObjectRef) -> Self {
        Value::Ref(obj)
    }

    /// Check if this value points into the heap
    #[inline]
    pub fn is_heap_allocated(&self) -> bool {
        matches!(self, Value::Ref(_))
    }

    /// Check if this value is null
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the referenced object, if any
    #[inline]
    pub fn as_object(&self) -> Option<ObjectRef> {
        match self {
            Value::Ref(obj) => Some(*obj),
            _ => None,
        }
    }

    /// Get the integer payload, if any
    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<ObjectRef> for Value {
    fn from(obj: ObjectRef) -> Self {
        Value::Ref(obj)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Ref(obj) => write!(f, "@{}", obj),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::RegionId;

    #[test]
    fn test_value_kinds() {
        assert!(Value::null().is_null());
        assert!(!Value::int(3).is_heap_allocated());
        assert_eq!(Value::int(3).as_int(), Some(3));

        let obj = ObjectRef::new(RegionId(2), 7);
        let v = Value::object(obj);
        assert!(v.is_heap_allocated());
        assert_eq!(v.as_object(), Some(obj));
        assert_eq!(v.as_int(), None);
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::null().to_string(), "null");
        assert_eq!(Value::int(-4).to_string(), "-4");
        assert_eq!(Value::object(ObjectRef::new(RegionId(1), 5)).to_string(), "@r1:5");
    }
}
