//! Typed message instances.
//!
//! A [`Message`] is one concrete value of a kind declared in a [`Schema`]. It is validated
//! against its [`MessageDefinition`] when constructed, so a `Message` in hand always carries
//! exactly the declared arguments with the declared types.
//!
//! Arguments are supplied through [`Args`], usually with the [`args!`](crate::args) macro:
//!
//! ```rust
//! use tether::{ArgType, DefinitionList, Message, args};
//!
//! let mut list = DefinitionList::new();
//! list.add("ItIs", &[("hours", ArgType::Int), ("minutes", ArgType::Int)]).unwrap();
//! let schema = list.instantiate().unwrap();
//!
//! let msg = Message::new(&schema, "ItIs", args!(hours = 9, minutes = 30)).unwrap();
//! assert_eq!(msg.get_int("minutes"), Some(30));
//! ```
use std::{fmt, sync::Arc};

use crate::{
    protocol::error::ProtocolError,
    schema::{ArgType, MessageDefinition, Schema},
};

/// One argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl Value {
    pub fn arg_type(&self) -> ArgType {
        match self {
            Value::Int(_) => ArgType::Int,
            Value::Float(_) => ArgType::Float,
            Value::Str(_) => ArgType::Str,
            Value::Bool(_) => ArgType::Bool,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v:?}"),
            Value::Bool(v) => write!(f, "{v}"),
        }
    }
}

macro_rules! value_from {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$t> for Value {
                fn from(value: $t) -> Self {
                    Value::$variant(value.into())
                }
            }
        )*
    };
}

value_from! {
    i64 => Int,
    i32 => Int,
    i16 => Int,
    u32 => Int,
    u16 => Int,
    u8 => Int,
    f64 => Float,
    f32 => Float,
    bool => Bool,
    String => Str,
    &str => Str,
}

/// Named argument values supplied when building a [`Message`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<(String, Value)>);

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Builds [`Args`] from `name = value` pairs.
///
/// ```rust
/// use tether::args;
///
/// let none = args!();
/// let some = args!(hours = 9, label = "morning");
/// assert_eq!(none.len(), 0);
/// assert_eq!(some.len(), 2);
/// ```
#[macro_export]
macro_rules! args {
    () => {
        $crate::Args::new()
    };
    ($($name:ident = $value:expr),+ $(,)?) => {
        $crate::Args::new()$(.with(stringify!($name), $value))+
    };
}

/// A validated instance of a message kind.
#[derive(Debug, Clone)]
pub struct Message {
    definition: Arc<MessageDefinition>,
    values: Vec<Value>,
}

impl Message {
    /// Builds a message of kind `name`, checking `args` against its definition.
    ///
    /// Every declared argument must be present with its declared type and nothing else may be
    /// supplied; values are never coerced.
    pub fn new(schema: &Schema, name: &str, args: Args) -> Result<Self, ProtocolError> {
        let definition = schema
            .get(name)
            .ok_or_else(|| ProtocolError::UnknownMessage(name.to_string()))?;

        let mut slots: Vec<Option<Value>> = vec![None; definition.arity()];
        for (argument, value) in args.0 {
            let position = definition.position(&argument).ok_or_else(|| {
                ProtocolError::UnexpectedArgument {
                    message: name.to_string(),
                    argument: argument.clone(),
                }
            })?;
            if slots[position].is_some() {
                return Err(ProtocolError::UnexpectedArgument {
                    message: name.to_string(),
                    argument,
                });
            }
            slots[position] = Some(value);
        }

        let mut values = Vec::with_capacity(slots.len());
        for ((argument, _), slot) in definition.arguments().zip(slots) {
            let value = slot.ok_or_else(|| ProtocolError::MissingArgument {
                message: name.to_string(),
                argument: argument.to_string(),
            })?;
            values.push(value);
        }

        Self::from_parts(Arc::clone(definition), values)
    }

    /// Pairs a definition with positional values, checking arity and types.
    pub(crate) fn from_parts(
        definition: Arc<MessageDefinition>,
        values: Vec<Value>,
    ) -> Result<Self, ProtocolError> {
        if values.len() != definition.arity() {
            return Err(ProtocolError::MalformedMessage(format!(
                "'{}' expects {} arguments, got {}",
                definition.name(),
                definition.arity(),
                values.len()
            )));
        }
        check_types(&definition, &values)?;

        Ok(Self { definition, values })
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }

    pub fn definition(&self) -> &MessageDefinition {
        &self.definition
    }

    pub fn get(&self, argument: &str) -> Option<&Value> {
        self.definition
            .position(argument)
            .map(|i| &self.values[i])
    }

    pub fn get_int(&self, argument: &str) -> Option<i64> {
        self.get(argument).and_then(Value::as_int)
    }

    pub fn get_float(&self, argument: &str) -> Option<f64> {
        self.get(argument).and_then(Value::as_float)
    }

    pub fn get_str(&self, argument: &str) -> Option<&str> {
        self.get(argument).and_then(Value::as_str)
    }

    pub fn get_bool(&self, argument: &str) -> Option<bool> {
        self.get(argument).and_then(Value::as_bool)
    }

    /// Values in declared order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn arguments(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.definition
            .arguments()
            .map(|(n, _)| n)
            .zip(self.values.iter())
    }

    pub(crate) fn is_builtin(&self) -> bool {
        self.definition.is_builtin()
    }
}

pub(crate) fn check_types(
    definition: &MessageDefinition,
    values: &[Value],
) -> Result<(), ProtocolError> {
    for ((argument, expected), value) in definition.arguments().zip(values) {
        if value.arg_type() != expected {
            return Err(ProtocolError::TypeMismatch {
                message: definition.name().to_string(),
                argument: argument.to_string(),
                expected,
                found: value.arg_type().to_string(),
            });
        }
    }
    Ok(())
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.definition.name() == other.definition.name() && self.values == other.values
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        if !self.values.is_empty() {
            let args = self
                .arguments()
                .map(|(n, v)| format!("{n}={v}"))
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, "({args})")?;
        }
        Ok(())
    }
}
