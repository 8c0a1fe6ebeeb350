//! Typed node parameters.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// A tagged parameter value.
#[derive(Clone)]
pub enum ParameterValue {
    I32(i32),
    U32(u32),
    F32(f32),
    Bool(bool),
    Vec4([f32; 4]),
    Str(String),
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl std::fmt::Debug for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParameterValue::I32(v) => write!(f, "I32({v})"),
            ParameterValue::U32(v) => write!(f, "U32({v})"),
            ParameterValue::F32(v) => write!(f, "F32({v})"),
            ParameterValue::Bool(v) => write!(f, "Bool({v})"),
            ParameterValue::Vec4(v) => write!(f, "Vec4({v:?})"),
            ParameterValue::Str(v) => write!(f, "Str({v:?})"),
            ParameterValue::Opaque(_) => write!(f, "Opaque"),
        }
    }
}

/// Conversion out of a [`ParameterValue`].
pub trait FromParameter: Sized {
    fn from_parameter(value: &ParameterValue) -> Option<Self>;
}

impl FromParameter for i32 {
    fn from_parameter(value: &ParameterValue) -> Option<Self> {
        match value {
            ParameterValue::I32(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromParameter for u32 {
    fn from_parameter(value: &ParameterValue) -> Option<Self> {
        match value {
            ParameterValue::U32(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromParameter for f32 {
    fn from_parameter(value: &ParameterValue) -> Option<Self> {
        match value {
            ParameterValue::F32(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromParameter for bool {
    fn from_parameter(value: &ParameterValue) -> Option<Self> {
        match value {
            ParameterValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromParameter for [f32; 4] {
    fn from_parameter(value: &ParameterValue) -> Option<Self> {
        match value {
            ParameterValue::Vec4(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromParameter for String {
    fn from_parameter(value: &ParameterValue) -> Option<Self> {
        match value {
            ParameterValue::Str(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// Parameter map keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ParameterMap {
    values: HashMap<String, ParameterValue>,
}

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: ParameterValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values.get(name)
    }

    /// Typed read with a default fallback.
    pub fn get_value<T: FromParameter>(&self, name: &str, default: T) -> T {
        self.values
            .get(name)
            .and_then(T::from_parameter)
            .unwrap_or(default)
    }

    /// Typed read of an opaque parameter.
    pub fn get_opaque<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        match self.values.get(name) {
            Some(ParameterValue::Opaque(value)) => value.clone().downcast::<T>().ok(),
            _ => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
