//! Declared, typed, defaulted attributes on operators.
//!
//! Each operator kind owns a static schema: a fixed slice of [`FieldDecl`]s naming every
//! attribute it carries, the attribute's [`FieldType`] and its [`FieldDefault`]. A generic
//! [`Fields`] map consults that schema on every read and write:
//!
//! - writes are type-checked immediately and never coerced;
//! - reads of unset fields return the declared default, so a field is only `Null` when its
//!   declaration says so;
//! - once sealed (when the owning operator joins a graph) the map is read-only.
//!
//! Only explicitly-set fields travel over the wire (see [`TaggedValue`]); the receiving side
//! rebuilds defaults from its own copy of the schema.

use crate::error::{GraphError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter, Result as FormatResult};

/// Scalar element types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    Bool,
    Int32,
    Int64,
    String,
}

impl ScalarType {
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::String => "string",
        }
    }

    fn admits(self, value: &FieldValue) -> bool {
        matches!(
            (self, value),
            (Self::Bool, FieldValue::Bool(_))
                | (Self::Int32, FieldValue::Int32(_))
                | (Self::Int64, FieldValue::Int64(_))
                | (Self::String, FieldValue::String(_))
        )
    }
}

/// A closed set of named variants that a reference field may point at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnumDecl {
    pub name: &'static str,
    pub variants: &'static [&'static str],
}

/// Rust enums usable as the target of a reference field.
pub trait FieldEnum: Sized + Copy {
    fn decl() -> &'static EnumDecl;
    fn variant(self) -> &'static str;
    fn from_variant(name: &str) -> Option<Self>;

    /// Wrap `self` as a field value.
    fn to_field(self) -> FieldValue {
        FieldValue::Reference(self.variant().to_string())
    }
}

/// Declared type of a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    Scalar(ScalarType),
    List(ScalarType),
    Reference(&'static EnumDecl),
}

impl FieldType {
    pub const BOOL: Self = Self::Scalar(ScalarType::Bool);
    pub const INT32: Self = Self::Scalar(ScalarType::Int32);
    pub const INT64: Self = Self::Scalar(ScalarType::Int64);
    pub const STRING: Self = Self::Scalar(ScalarType::String);

    /// Stable textual tag recorded next to each serialized value.
    #[must_use]
    pub fn tag(&self) -> String {
        match self {
            Self::Scalar(s) => s.tag().to_string(),
            Self::List(s) => format!("list<{}>", s.tag()),
            Self::Reference(e) => format!("ref<{}>", e.name),
        }
    }

    fn admits(&self, value: &FieldValue) -> bool {
        match (self, value) {
            (Self::Scalar(s), v) => s.admits(v),
            (Self::List(s), FieldValue::List(items)) => items.iter().all(|i| s.admits(i)),
            (Self::Reference(e), FieldValue::Reference(v)) => e.variants.contains(&v.as_str()),
            _ => false,
        }
    }
}

impl Display for FieldType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        f.write_str(&self.tag())
    }
}

/// A concrete field value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    String(String),
    List(Vec<FieldValue>),
    /// Variant name of a [`FieldEnum`].
    Reference(String),
}

impl FieldValue {
    /// Short description used in type-mismatch errors.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Null => "null".into(),
            Self::Bool(_) => "bool".into(),
            Self::Int32(_) => "int32".into(),
            Self::Int64(_) => "int64".into(),
            Self::String(_) => "string".into(),
            Self::List(items) => match items.first() {
                Some(first) => format!("list<{}>", first.describe()),
                None => "list".into(),
            },
            Self::Reference(v) => format!("ref `{v}`"),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(v: Vec<String>) -> Self {
        Self::List(v.into_iter().map(Self::String).collect())
    }
}

impl From<Vec<&str>> for FieldValue {
    fn from(v: Vec<&str>) -> Self {
        Self::List(v.into_iter().map(Self::from).collect())
    }
}

impl From<Vec<i64>> for FieldValue {
    fn from(v: Vec<i64>) -> Self {
        Self::List(v.into_iter().map(Self::Int64).collect())
    }
}

/// Declared default, representable in a `const` schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldDefault {
    /// The field is nullable and unset means `Null`.
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Str(&'static str),
    EmptyList,
    Variant(&'static str),
}

impl FieldDefault {
    #[must_use]
    pub fn to_value(self) -> FieldValue {
        match self {
            Self::Null => FieldValue::Null,
            Self::Bool(v) => FieldValue::Bool(v),
            Self::Int32(v) => FieldValue::Int32(v),
            Self::Int64(v) => FieldValue::Int64(v),
            Self::Str(v) => FieldValue::String(v.to_string()),
            Self::EmptyList => FieldValue::List(Vec::new()),
            Self::Variant(v) => FieldValue::Reference(v.to_string()),
        }
    }
}

/// One `(name, type, default)` entry of an operator kind's schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldDecl {
    pub name: &'static str,
    pub ty: FieldType,
    pub default: FieldDefault,
}

impl FieldDecl {
    pub const fn new(name: &'static str, ty: FieldType, default: FieldDefault) -> Self {
        Self { name, ty, default }
    }

    #[must_use]
    pub fn nullable(&self) -> bool {
        self.default == FieldDefault::Null
    }

    fn check(&self, kind: &'static str, value: &FieldValue) -> Result<()> {
        let ok = match value {
            FieldValue::Null => self.nullable(),
            v => self.ty.admits(v),
        };
        if ok {
            Ok(())
        } else {
            Err(GraphError::FieldType {
                kind,
                field: self.name,
                expected: self.ty.tag(),
                got: value.describe(),
            })
        }
    }
}

/// Serialized form of one explicitly-set field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedValue {
    pub type_tag: String,
    pub value: FieldValue,
}

/// Schema-validated field values of one operator instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fields {
    kind: &'static str,
    schema: &'static [FieldDecl],
    values: BTreeMap<&'static str, FieldValue>,
    sealed: bool,
}

impl Fields {
    #[must_use]
    pub fn new(kind: &'static str, schema: &'static [FieldDecl]) -> Self {
        Self {
            kind,
            schema,
            values: BTreeMap::new(),
            sealed: false,
        }
    }

    #[must_use]
    pub fn schema(&self) -> &'static [FieldDecl] {
        self.schema
    }

    /// Look up the declaration for `name`.
    ///
    /// # Errors
    ///
    /// `UnknownField` if the schema does not declare `name`.
    pub fn decl(&self, name: &str) -> Result<&'static FieldDecl> {
        self.schema
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| GraphError::UnknownField {
                kind: self.kind,
                field: name.to_string(),
            })
    }

    /// Write a field after validating it against the declaration.
    ///
    /// # Errors
    ///
    /// `SealedField` after sealing, `UnknownField` for undeclared names and `FieldType`
    /// when the value does not match the declared type.
    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) -> Result<()> {
        if self.sealed {
            return Err(GraphError::SealedField {
                kind: self.kind,
                field: name.to_string(),
            });
        }
        let decl = self.decl(name)?;
        let value = value.into();
        decl.check(self.kind, &value)?;
        self.values.insert(decl.name, value);
        Ok(())
    }

    /// Read a field, falling back to its declared default.
    ///
    /// # Errors
    ///
    /// `UnknownField` for undeclared names.
    pub fn get(&self, name: &str) -> Result<FieldValue> {
        let decl = self.decl(name)?;
        Ok(self
            .values
            .get(decl.name)
            .cloned()
            .unwrap_or_else(|| decl.default.to_value()))
    }

    #[must_use]
    pub fn is_set(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Explicitly-set fields in name order.
    pub fn explicit(&self) -> impl Iterator<Item = (&'static str, &FieldValue)> {
        self.values.iter().map(|(k, v)| (*k, v))
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub(crate) fn seal(&mut self) {
        self.sealed = true;
    }

    fn mismatch(&self, name: &str, expected: &str, got: &FieldValue) -> GraphError {
        GraphError::FieldType {
            kind: self.kind,
            field: self.decl(name).map_or("?", |d| d.name),
            expected: expected.to_string(),
            got: got.describe(),
        }
    }

    /// # Errors
    ///
    /// `UnknownField`, or `FieldType` if the stored value is not a bool.
    pub fn get_bool(&self, name: &str) -> Result<bool> {
        match self.get(name)? {
            FieldValue::Bool(v) => Ok(v),
            other => Err(self.mismatch(name, "bool", &other)),
        }
    }

    /// # Errors
    ///
    /// `UnknownField`, or `FieldType` if the value is null or not an int32.
    pub fn get_i32(&self, name: &str) -> Result<i32> {
        match self.get(name)? {
            FieldValue::Int32(v) => Ok(v),
            other => Err(self.mismatch(name, "int32", &other)),
        }
    }

    /// Nullable int32 read.
    ///
    /// # Errors
    ///
    /// `UnknownField`, or `FieldType` if the value is neither null nor an int32.
    pub fn get_opt_i32(&self, name: &str) -> Result<Option<i32>> {
        match self.get(name)? {
            FieldValue::Null => Ok(None),
            FieldValue::Int32(v) => Ok(Some(v)),
            other => Err(self.mismatch(name, "int32", &other)),
        }
    }

    /// # Errors
    ///
    /// `UnknownField`, or `FieldType` if the value is null or not an int64.
    pub fn get_i64(&self, name: &str) -> Result<i64> {
        match self.get(name)? {
            FieldValue::Int64(v) => Ok(v),
            other => Err(self.mismatch(name, "int64", &other)),
        }
    }

    /// Nullable string read.
    ///
    /// # Errors
    ///
    /// `UnknownField`, or `FieldType` if the value is neither null nor a string.
    pub fn get_string(&self, name: &str) -> Result<Option<String>> {
        match self.get(name)? {
            FieldValue::Null => Ok(None),
            FieldValue::String(s) => Ok(Some(s)),
            other => Err(self.mismatch(name, "string", &other)),
        }
    }

    /// # Errors
    ///
    /// `UnknownField`, or `FieldType` if the value is not a list of strings.
    pub fn get_strings(&self, name: &str) -> Result<Vec<String>> {
        match self.get(name)? {
            FieldValue::List(items) => items
                .into_iter()
                .map(|i| match i {
                    FieldValue::String(s) => Ok(s),
                    other => Err(self.mismatch(name, "list<string>", &other)),
                })
                .collect(),
            other => Err(self.mismatch(name, "list<string>", &other)),
        }
    }

    /// # Errors
    ///
    /// `UnknownField`, or `FieldType` if the value is not a list of int64.
    pub fn get_i64s(&self, name: &str) -> Result<Vec<i64>> {
        match self.get(name)? {
            FieldValue::List(items) => items
                .into_iter()
                .map(|i| match i {
                    FieldValue::Int64(v) => Ok(v),
                    other => Err(self.mismatch(name, "list<int64>", &other)),
                })
                .collect(),
            other => Err(self.mismatch(name, "list<int64>", &other)),
        }
    }

    /// # Errors
    ///
    /// `UnknownField`, or `FieldType` if the value does not name a variant of `E`.
    pub fn get_enum<E: FieldEnum>(&self, name: &str) -> Result<E> {
        match self.get(name)? {
            FieldValue::Reference(v) => {
                E::from_variant(&v).ok_or_else(|| {
                    self.mismatch(name, E::decl().name, &FieldValue::Reference(v))
                })
            }
            other => Err(self.mismatch(name, E::decl().name, &other)),
        }
    }

    /// Explicit fields in wire form.
    #[must_use]
    pub fn to_tagged(&self) -> BTreeMap<String, TaggedValue> {
        self.values
            .iter()
            .filter_map(|(name, value)| {
                let decl = self.decl(name).ok()?;
                Some((
                    (*name).to_string(),
                    TaggedValue {
                        type_tag: decl.ty.tag(),
                        value: value.clone(),
                    },
                ))
            })
            .collect()
    }

    /// Rebuild a field map from wire form, validating every entry against `schema`.
    ///
    /// # Errors
    ///
    /// `Schema` for undeclared names, type tags that disagree with the declaration, or
    /// values of the wrong shape.
    pub fn from_tagged(
        kind: &'static str,
        schema: &'static [FieldDecl],
        tagged: BTreeMap<String, TaggedValue>,
    ) -> Result<Self> {
        let mut fields = Self::new(kind, schema);
        for (name, TaggedValue { type_tag, value }) in tagged {
            let decl = fields.decl(&name).map_err(|_| {
                GraphError::Schema(format!("{kind} does not declare field `{name}`"))
            })?;
            if decl.ty.tag() != type_tag {
                return Err(GraphError::Schema(format!(
                    "field `{name}` of {kind} recorded as `{type_tag}`, declared `{}`",
                    decl.ty
                )));
            }
            fields
                .set(&name, value)
                .map_err(|e| GraphError::Schema(e.to_string()))?;
        }
        Ok(fields)
    }
}
