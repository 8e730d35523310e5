use std::collections::HashSet;
use std::fmt;

use crate::coerce::{coerce, Value};
use crate::error::{CoerceError, DecodeError};

/// Semantic type of a record field, as far as coercion is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Float,
    Str,
    Int,
    Uint,
    /// A declared type with no coercion rule; carries the type's name.
    Unsupported(&'static str),
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Float => f.write_str("float"),
            FieldKind::Str => f.write_str("string"),
            FieldKind::Int => f.write_str("int"),
            FieldKind::Uint => f.write_str("uint"),
            FieldKind::Unsupported(name) => f.write_str(name),
        }
    }
}

/// One field of a record type: its name, kind and declared column tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub kind: FieldKind,
    /// Column label; untagged fields are never populated.
    pub tag: Option<&'static str>,
}

/// A type whose instances are decoded from delimited lines.
///
/// Usually implemented through [`csv_record!`](crate::csv_record), which keeps
/// the descriptor table and the field assignments in step at compile time.
pub trait Record: Default + Send + 'static {
    /// Field descriptors in declaration order.
    fn fields() -> &'static [FieldDescriptor];

    /// Coerce `raw` into the field at `index` of [`Record::fields`].
    ///
    /// On error the field keeps whatever value it had.
    fn assign(&mut self, index: usize, raw: &str) -> Result<(), CoerceError>;
}

/// A field type the decoder knows how to fill.
pub trait Column: Sized {
    const KIND: FieldKind;

    /// Narrow a coerced value into `Self`. `None` means out of range.
    fn from_value(value: Value) -> Option<Self>;

    fn parse(raw: &str) -> Result<Self, CoerceError> {
        let value = coerce(Self::KIND, raw)?;
        Self::from_value(value).ok_or_else(|| {
            CoerceError::coercion(
                Self::KIND,
                raw,
                format!("out of range for {}", std::any::type_name::<Self>()),
            )
        })
    }
}

impl Column for f64 {
    const KIND: FieldKind = FieldKind::Float;
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Float(v) => Some(v),
            _ => None,
        }
    }
}

impl Column for f32 {
    const KIND: FieldKind = FieldKind::Float;
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Float(v) => Some(v as f32),
            _ => None,
        }
    }
}

impl Column for String {
    const KIND: FieldKind = FieldKind::Str;
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }
}

macro_rules! integer_column {
    ($variant:ident, $kind:ident: $($ty:ty),*) => {
        $(
            impl Column for $ty {
                const KIND: FieldKind = FieldKind::$kind;
                fn from_value(value: Value) -> Option<Self> {
                    match value {
                        Value::$variant(v) => <$ty>::try_from(v).ok(),
                        _ => None,
                    }
                }
            }
        )*
    };
}

integer_column!(Int, Int: i8, i16, i32, i64, isize);
integer_column!(Uint, Uint: u8, u16, u32, u64, usize);

macro_rules! unsupported_column {
    ($($ty:ty),*) => {
        $(
            impl Column for $ty {
                const KIND: FieldKind = FieldKind::Unsupported(stringify!($ty));
                fn from_value(_: Value) -> Option<Self> {
                    None
                }
            }
        )*
    };
}

unsupported_column!(bool, char);

/// Reject descriptor tables the decoder cannot map unambiguously.
pub(crate) fn validate(fields: &[FieldDescriptor]) -> Result<(), DecodeError> {
    if fields.is_empty() {
        return Err(DecodeError::Configuration(
            "record type declares no fields".into(),
        ));
    }

    let mut seen = HashSet::new();
    for fld in fields {
        let Some(tag) = fld.tag else { continue };
        if tag.is_empty() {
            return Err(DecodeError::Configuration(format!(
                "field `{}` has an empty csv tag",
                fld.name
            )));
        }
        if !seen.insert(tag) {
            return Err(DecodeError::Configuration(format!(
                "csv tag `{}` is declared by more than one field (second: `{}`)",
                tag, fld.name
            )));
        }
    }
    Ok(())
}

/// Declare a struct together with its [`Record`] implementation.
///
/// Fields tagged with `#[csv = "label"]` receive the column carrying that
/// label; untagged fields keep their default value. Every field type must
/// implement [`Column`].
///
/// ```
/// csvstream::csv_record! {
///     #[derive(Debug, Default, Clone, PartialEq)]
///     pub struct Bar {
///         #[csv = "timestamp"]
///         pub timestamp: String,
///         pub symbol: String,
///         #[csv = "open"]
///         pub open: f64,
///         #[csv = "volume"]
///         pub volume: i64,
///     }
/// }
/// ```
#[macro_export]
macro_rules! csv_record {
    (@tag $tag:literal) => {
        ::core::option::Option::Some($tag)
    };
    (@tag) => {
        ::core::option::Option::None
    };
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[csv = $tag:literal])?
                $fvis:vis $field:ident : $ty:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $( $fvis $field: $ty, )*
        }

        impl $crate::Record for $name {
            fn fields() -> &'static [$crate::FieldDescriptor] {
                const FIELDS: &[$crate::FieldDescriptor] = &[
                    $(
                        $crate::FieldDescriptor {
                            name: ::core::stringify!($field),
                            kind: <$ty as $crate::Column>::KIND,
                            tag: $crate::csv_record!(@tag $($tag)?),
                        },
                    )*
                ];
                FIELDS
            }

            #[allow(unused_assignments)]
            fn assign(
                &mut self,
                index: usize,
                raw: &str,
            ) -> ::core::result::Result<(), $crate::CoerceError> {
                let mut i = 0usize;
                $(
                    if index == i {
                        self.$field = <$ty as $crate::Column>::parse(raw)?;
                        return ::core::result::Result::Ok(());
                    }
                    i += 1;
                )*
                ::core::result::Result::Ok(())
            }
        }
    };
}
