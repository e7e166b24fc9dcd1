//! Query string form of `GET` messages.
//!
//! Top-level fields become query parameters. Strings are written verbatim,
//! numbers and booleans in their JSON form, sequences as repeated keys and
//! nested structures as JSON text. `null` fields and empty sequences are
//! omitted, so sequence fields should carry `#[serde(default)]`.
//!
//! Decoding is driven by the target type: each field is parsed as whatever
//! the message declares, and a sequence field accepts one or many values.

use std::str::FromStr;

use serde::de::value::{MapDeserializer, SeqDeserializer, StringDeserializer};
use serde::de::{self, DeserializeOwned, Deserializer, IntoDeserializer, Unexpected, Visitor};
use serde::{forward_to_deserialize_any, Serialize};
use serde_json::Value;
use url::form_urlencoded;

use crate::error::{ConquerorError, Result};

type DeResult<T> = std::result::Result<T, serde_json::Error>;

/// Encode a message into a query string (without the leading `?`).
pub(crate) fn encode<T: Serialize>(message: &T) -> Result<String> {
    let fields = match serde_json::to_value(message)? {
        Value::Null => return Ok(String::new()),
        Value::Object(fields) => fields,
        other => {
            return Err(ConquerorError::Protocol(format!(
                "GET messages must serialize to a struct, got `{other}`"
            )))
        }
    };

    let mut query = form_urlencoded::Serializer::new(String::new());
    for (key, value) in &fields {
        match value {
            Value::Null => {}
            Value::Array(items) => {
                for item in items {
                    query.append_pair(key, &scalar(item));
                }
            }
            other => {
                query.append_pair(key, &scalar(other));
            }
        }
    }
    Ok(query.finish())
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Decode a message from a query string.
pub(crate) fn decode<T: DeserializeOwned>(query: &str) -> Result<T> {
    let mut fields: Vec<(String, Vec<String>)> = Vec::new();
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        match fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value.into_owned()),
            None => fields.push((key.into_owned(), vec![value.into_owned()])),
        }
    }
    Ok(T::deserialize(QueryDeserializer { fields })?)
}

/// The whole query, seen as a map of field name to raw values.
struct QueryDeserializer {
    fields: Vec<(String, Vec<String>)>,
}

impl<'de> Deserializer<'de> for QueryDeserializer {
    type Error = serde_json::Error;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> DeResult<V::Value> {
        let values = self
            .fields
            .into_iter()
            .map(|(key, values)| (key, QueryValue(values)));
        let mut map: MapDeserializer<'de, _, serde_json::Error> = MapDeserializer::new(values);
        let value = visitor.visit_map(&mut map)?;
        map.end()?;
        Ok(value)
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> DeResult<V::Value> {
        if self.fields.is_empty() {
            visitor.visit_none()
        } else {
            visitor.visit_some(self)
        }
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> DeResult<V::Value> {
        if self.fields.is_empty() {
            visitor.visit_unit()
        } else {
            Err(de::Error::invalid_type(Unexpected::Map, &visitor))
        }
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> DeResult<V::Value> {
        self.deserialize_unit(visitor)
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf newtype_struct seq tuple tuple_struct map struct enum
        identifier ignored_any
    }
}

/// Every raw value given for one query key.
struct QueryValue(Vec<String>);

impl QueryValue {
    fn single(self) -> DeResult<String> {
        let mut values = self.0;
        if values.len() == 1 {
            Ok(values.remove(0))
        } else {
            Err(de::Error::invalid_length(values.len(), &"a single value"))
        }
    }

    fn parse<T>(self, expected: &'static str) -> DeResult<T>
    where
        T: FromStr,
    {
        let raw = self.single()?;
        raw.parse()
            .map_err(|_| de::Error::invalid_value(Unexpected::Str(&raw), &expected))
    }

    fn json(self) -> DeResult<Value> {
        serde_json::from_str(&self.single()?)
    }
}

impl<'de> IntoDeserializer<'de, serde_json::Error> for QueryValue {
    type Deserializer = Self;

    fn into_deserializer(self) -> Self {
        self
    }
}

macro_rules! deserialize_parsed {
    ($($method:ident => $visit:ident($ty:ty)),* $(,)?) => {
        $(
            fn $method<V: Visitor<'de>>(self, visitor: V) -> DeResult<V::Value> {
                visitor.$visit(self.parse::<$ty>(stringify!($ty))?)
            }
        )*
    };
}

impl<'de> Deserializer<'de> for QueryValue {
    type Error = serde_json::Error;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> DeResult<V::Value> {
        if self.0.len() == 1 {
            visitor.visit_string(self.single()?)
        } else {
            self.deserialize_seq(visitor)
        }
    }

    deserialize_parsed! {
        deserialize_bool => visit_bool(bool),
        deserialize_i8 => visit_i8(i8),
        deserialize_i16 => visit_i16(i16),
        deserialize_i32 => visit_i32(i32),
        deserialize_i64 => visit_i64(i64),
        deserialize_i128 => visit_i128(i128),
        deserialize_u8 => visit_u8(u8),
        deserialize_u16 => visit_u16(u16),
        deserialize_u32 => visit_u32(u32),
        deserialize_u64 => visit_u64(u64),
        deserialize_u128 => visit_u128(u128),
        deserialize_f32 => visit_f32(f32),
        deserialize_f64 => visit_f64(f64),
        deserialize_char => visit_char(char),
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> DeResult<V::Value> {
        visitor.visit_string(self.single()?)
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> DeResult<V::Value> {
        visitor.visit_string(self.single()?)
    }

    fn deserialize_identifier<V: Visitor<'de>>(self, visitor: V) -> DeResult<V::Value> {
        visitor.visit_string(self.single()?)
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> DeResult<V::Value> {
        visitor.visit_byte_buf(self.single()?.into_bytes())
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> DeResult<V::Value> {
        self.deserialize_bytes(visitor)
    }

    // A present key is always `Some`; absent keys never reach the deserializer.
    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> DeResult<V::Value> {
        visitor.visit_some(self)
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> DeResult<V::Value> {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> DeResult<V::Value> {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> DeResult<V::Value> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> DeResult<V::Value> {
        let items = self.0.into_iter().map(|value| QueryValue(vec![value]));
        let mut seq: SeqDeserializer<_, serde_json::Error> = SeqDeserializer::new(items);
        let value = visitor.visit_seq(&mut seq)?;
        seq.end()?;
        Ok(value)
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, _len: usize, visitor: V) -> DeResult<V::Value> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _len: usize,
        visitor: V,
    ) -> DeResult<V::Value> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> DeResult<V::Value> {
        self.json()?.deserialize_map(visitor)
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> DeResult<V::Value> {
        self.json()?.deserialize_struct(name, fields, visitor)
    }

    // Unit variants travel as their name, data-carrying ones as JSON text.
    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> DeResult<V::Value> {
        let raw = self.single()?;
        if raw.starts_with('{') {
            return serde_json::from_str::<Value>(&raw)?.deserialize_enum(name, variants, visitor);
        }
        let variant: StringDeserializer<serde_json::Error> = raw.into_deserializer();
        visitor.visit_enum(variant)
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> DeResult<V::Value> {
        visitor.visit_unit()
    }
}
