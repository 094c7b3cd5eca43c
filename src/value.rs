//! Wire-typed values exchanged with the bus.
//!
//! Method arguments and property writes need an explicit D-Bus type. [`TypedValue`] pairs a
//! value with one of a small set of [`TypeTag`]s; [`normalize`] goes the other way and strips
//! the variant wrapper off dictionary values received from the bus.

use std::{collections::HashMap, hash::Hash, str::FromStr};

use zbus::zvariant::{OwnedValue, Value};

use crate::{error::ErrorKind, Error, Result};

/// The semantic type of a [`TypedValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    String,
    Int16,
    Boolean,
    Uint16,
    Dict,
}

impl TypeTag {
    /// Returns the D-Bus type code this tag is sent as.
    pub const fn signature(self) -> &'static str {
        // https://dbus.freedesktop.org/doc/dbus-specification.html
        match self {
            Self::String => "s",
            Self::Int16 => "n",
            Self::Boolean => "b",
            Self::Uint16 => "q",
            Self::Dict => "e",
        }
    }

    fn accepts(self, value: &Value<'_>) -> bool {
        matches!(
            (self, value),
            (Self::String, Value::Str(_))
                | (Self::Int16, Value::I16(_))
                | (Self::Boolean, Value::Bool(_))
                | (Self::Uint16, Value::U16(_))
                | (Self::Dict, Value::Dict(_))
        )
    }
}

impl FromStr for TypeTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "string" => Self::String,
            "int16" => Self::Int16,
            "boolean" => Self::Boolean,
            "uint16" => Self::Uint16,
            "dict" => Self::Dict,
            _ => return Err(Error::from(ErrorKind::UnrecognizedType)),
        })
    }
}

/// A value tagged with the wire type it is sent as.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedValue {
    tag: TypeTag,
    value: OwnedValue,
}

impl TypedValue {
    /// Builds a [`TypedValue`] from a textual type tag (`string`, `int16`, `boolean`, `uint16` or
    /// `dict`).
    ///
    /// Fails with [`ErrorKind::UnrecognizedType`] for any other tag, and when `value` does not
    /// have the shape the tag describes.
    pub fn build<'a>(tag: &str, value: impl Into<Value<'a>>) -> Result<Self> {
        let tag = tag.parse::<TypeTag>()?;
        let value = value.into();
        if !tag.accepts(&value) {
            return Err(Error::from(format!(
                "value of type `{}` cannot be sent as `{}`",
                value.value_signature(),
                tag.signature()
            )));
        }
        Ok(Self {
            tag,
            value: OwnedValue::from(value),
        })
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::new(TypeTag::String, Value::from(value.into()))
    }

    pub fn int16(value: i16) -> Self {
        Self::new(TypeTag::Int16, Value::from(value))
    }

    pub fn boolean(value: bool) -> Self {
        Self::new(TypeTag::Boolean, Value::from(value))
    }

    pub fn uint16(value: u16) -> Self {
        Self::new(TypeTag::Uint16, Value::from(value))
    }

    /// A string-keyed dictionary of typed values (`a{sv}` on the wire).
    pub fn dict<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, TypedValue)>,
        K: Into<String>,
    {
        Self::new(TypeTag::Dict, Value::from(dict(entries)))
    }

    fn new(tag: TypeTag, value: Value<'_>) -> Self {
        Self {
            tag,
            value: OwnedValue::from(value),
        }
    }

    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    /// Returns the D-Bus type code of this value.
    pub fn signature(&self) -> &'static str {
        self.tag.signature()
    }

    pub fn value(&self) -> &Value<'static> {
        &self.value
    }

    pub fn into_value(self) -> OwnedValue {
        self.value
    }
}

/// Builds an `a{sv}` option dictionary as taken by most BlueZ methods.
pub(crate) fn dict<I, K>(entries: I) -> HashMap<String, Value<'static>>
where
    I: IntoIterator<Item = (K, TypedValue)>,
    K: Into<String>,
{
    entries
        .into_iter()
        .map(|(key, value)| (key.into(), Value::clone(value.value())))
        .collect()
}

/// Same as [`dict`], ready to be passed as a method argument.
pub(crate) fn dict_arg<I, K>(entries: I) -> OwnedValue
where
    I: IntoIterator<Item = (K, TypedValue)>,
    K: Into<String>,
{
    OwnedValue::from(Value::from(dict(entries)))
}

/// Strips one level of variant wrapping from a value.
pub fn unwrap_variant(value: &OwnedValue) -> OwnedValue {
    match &**value {
        Value::Value(inner) => OwnedValue::from(Value::clone(inner)),
        _ => value.clone(),
    }
}

/// Returns a copy of `dict` where each variant-wrapped value is replaced by its inner value.
///
/// Values that are not wrapped are passed through unchanged. The input is left untouched.
pub fn normalize<K>(dict: &HashMap<K, OwnedValue>) -> HashMap<K, OwnedValue>
where
    K: Clone + Eq + Hash,
{
    dict.iter()
        .map(|(key, value)| (key.clone(), unwrap_variant(value)))
        .collect()
}

/// Converts a plain value received from the bus into a Rust type.
///
/// A shape mismatch is reported as the underlying `zvariant` error.
pub(crate) fn decode<T>(value: OwnedValue) -> Result<T>
where
    T: TryFrom<Value<'static>>,
    T::Error: Into<zbus::zvariant::Error>,
{
    T::try_from(Value::clone(&unwrap_variant(&value))).map_err(|e| {
        let e: zbus::zvariant::Error = e.into();
        Error::from(e)
    })
}

/// Decodes a dictionary of byte-buffer variants, as used by the advertisement properties.
pub(crate) fn decode_buffers<K>(value: OwnedValue) -> Result<HashMap<K, Vec<u8>>>
where
    K: Clone + Eq + Hash + TryFrom<Value<'static>>,
    K::Error: Into<zbus::zvariant::Error>,
    HashMap<K, OwnedValue>: TryFrom<Value<'static>>,
    <HashMap<K, OwnedValue> as TryFrom<Value<'static>>>::Error: Into<zbus::zvariant::Error>,
{
    let raw: HashMap<K, OwnedValue> = decode(value)?;
    normalize(&raw)
        .into_iter()
        .map(|(key, value)| Ok((key, decode::<Vec<u8>>(value)?)))
        .collect()
}
