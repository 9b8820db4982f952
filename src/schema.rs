//! Message schema definitions.
//!
//! This module declares the vocabulary that a server and its clients agree on. Every message
//! kind is described by a [`MessageDefinition`]: a unique name plus an ordered list of typed
//! arguments. Definitions are collected in a [`DefinitionList`] and compiled into an immutable
//! [`Schema`] by [`DefinitionList::instantiate`].
//!
//! # Overview
//!
//! A [`Schema`] is cheap to clone and is handed to every codec, connection and client that
//! needs it. Nothing is stored globally; two peers simply have to build byte-identical
//! definition sets.
//!
//! # Text Format
//!
//! Definitions can be loaded from a line-oriented description:
//!
//! ```text
//! # comments and blank lines are ignored
//! Ping
//! ItIs hours=int minutes=int
//! Greeting text=str loud=bool
//! ```
//!
//! # Example
//! ```rust
//! use tether::{ArgType, DefinitionList};
//!
//! let mut list = DefinitionList::new();
//! list.add("ItIs", &[("hours", ArgType::Int), ("minutes", ArgType::Int)]).unwrap();
//! let schema = list.instantiate().unwrap();
//!
//! assert!(schema.get("ItIs").is_some());
//! ```
use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};

use thiserror::Error;

/// Name of the built-in keepalive request.
pub const PING: &str = "_ping";
/// Name of the built-in keepalive reply.
pub const PONG: &str = "_pong";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("message '{0}' is already defined")]
    DuplicateDefinition(String),

    #[error("invalid message name '{0}'")]
    InvalidName(String),

    #[error("invalid argument name '{argument}' in message '{definition}'")]
    InvalidArgumentName { definition: String, argument: String },

    #[error("argument '{argument}' declared twice in message '{definition}'")]
    DuplicateArgument { definition: String, argument: String },

    #[error("unknown argument type '{0}'")]
    UnknownType(String),

    #[error("line {line}: {reason}")]
    MalformedLine { line: usize, reason: String },

    #[error("definition list is already instantiated")]
    AlreadyInstantiated,

    #[error("definition list is empty")]
    Empty,
}

/// Closed set of argument types a message may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgType {
    Int,
    Float,
    Str,
    Bool,
}

impl FromStr for ArgType {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "int" => Ok(ArgType::Int),
            "float" => Ok(ArgType::Float),
            "str" => Ok(ArgType::Str),
            "bool" => Ok(ArgType::Bool),
            other => Err(SchemaError::UnknownType(other.to_string())),
        }
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            ArgType::Int => "int",
            ArgType::Float => "float",
            ArgType::Str => "str",
            ArgType::Bool => "bool",
        };
        write!(f, "{token}")
    }
}

/// Schema of a single message kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDefinition {
    name: String,
    arguments: Vec<(String, ArgType)>,
}

impl MessageDefinition {
    fn new(name: &str, arguments: &[(&str, ArgType)]) -> Result<Self, SchemaError> {
        if !is_identifier(name) {
            return Err(SchemaError::InvalidName(name.to_string()));
        }

        let mut declared: Vec<(String, ArgType)> = Vec::with_capacity(arguments.len());
        for (argument, kind) in arguments {
            if !is_identifier(argument) {
                return Err(SchemaError::InvalidArgumentName {
                    definition: name.to_string(),
                    argument: argument.to_string(),
                });
            }
            if declared.iter().any(|(n, _)| n == argument) {
                return Err(SchemaError::DuplicateArgument {
                    definition: name.to_string(),
                    argument: argument.to_string(),
                });
            }
            declared.push((argument.to_string(), *kind));
        }

        Ok(Self {
            name: name.to_string(),
            arguments: declared,
        })
    }

    fn builtin(name: &str) -> Self {
        Self {
            name: name.to_string(),
            arguments: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arguments in wire order.
    pub fn arguments(&self) -> impl Iterator<Item = (&str, ArgType)> {
        self.arguments.iter().map(|(n, t)| (n.as_str(), *t))
    }

    pub fn arity(&self) -> usize {
        self.arguments.len()
    }

    pub fn argument_type(&self, argument: &str) -> Option<ArgType> {
        self.position(argument).map(|i| self.arguments[i].1)
    }

    pub fn position(&self, argument: &str) -> Option<usize> {
        self.arguments.iter().position(|(n, _)| n == argument)
    }

    /// `true` for the reserved keepalive kinds.
    pub fn is_builtin(&self) -> bool {
        self.name.starts_with('_')
    }
}

impl fmt::Display for MessageDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for (name, kind) in &self.arguments {
            write!(f, " {name}={kind}")?;
        }
        Ok(())
    }
}

// User-defined names start with a letter; the leading underscore is reserved for built-ins.
fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
        _ => false,
    }
}

/// Mutable collection of definitions, locked by [`DefinitionList::instantiate`].
#[derive(Debug, Default)]
pub struct DefinitionList {
    definitions: Vec<MessageDefinition>,
    instantiated: bool,
}

impl DefinitionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new message kind.
    pub fn add(
        &mut self,
        name: &str,
        arguments: &[(&str, ArgType)],
    ) -> Result<&mut Self, SchemaError> {
        if self.instantiated {
            return Err(SchemaError::AlreadyInstantiated);
        }
        if self.definitions.iter().any(|d| d.name == name) {
            return Err(SchemaError::DuplicateDefinition(name.to_string()));
        }

        self.definitions.push(MessageDefinition::new(name, arguments)?);
        Ok(self)
    }

    /// Parses a line-oriented description into a new list.
    ///
    /// Each non-blank line reads `Name [arg=type ...]`; anything after a `#` is a comment.
    pub fn from_text(source: &str) -> Result<Self, SchemaError> {
        let mut list = Self::new();

        for (index, line) in source.lines().enumerate() {
            let line_no = index + 1;
            let line = match line.find('#') {
                Some(i) => &line[..i],
                None => line,
            };

            let mut parts = line.split_whitespace();
            let Some(name) = parts.next() else {
                continue;
            };

            let mut arguments = Vec::new();
            for part in parts {
                let (argument, token) =
                    part.split_once('=').ok_or_else(|| SchemaError::MalformedLine {
                        line: line_no,
                        reason: format!("expected name=type, got '{part}'"),
                    })?;
                let kind: ArgType = token.parse()?;
                arguments.push((argument, kind));
            }

            list.add(name, &arguments)?;
        }

        Ok(list)
    }

    /// Locks the list and compiles it into a queryable [`Schema`].
    pub fn instantiate(&mut self) -> Result<Schema, SchemaError> {
        if self.instantiated {
            return Err(SchemaError::AlreadyInstantiated);
        }
        if self.definitions.is_empty() {
            return Err(SchemaError::Empty);
        }
        self.instantiated = true;

        let mut definitions: Vec<Arc<MessageDefinition>> = [PING, PONG]
            .into_iter()
            .map(|n| Arc::new(MessageDefinition::builtin(n)))
            .collect();
        definitions.extend(self.definitions.iter().cloned().map(Arc::new));

        let by_name = definitions
            .iter()
            .enumerate()
            .map(|(i, d)| (d.name.clone(), i))
            .collect();

        Ok(Schema {
            inner: Arc::new(SchemaInner {
                definitions,
                by_name,
            }),
        })
    }

    pub fn is_instantiated(&self) -> bool {
        self.instantiated
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[derive(Debug)]
struct SchemaInner {
    definitions: Vec<Arc<MessageDefinition>>,
    by_name: HashMap<String, usize>,
}

/// Immutable, shareable registry produced by [`DefinitionList::instantiate`].
#[derive(Debug, Clone)]
pub struct Schema {
    inner: Arc<SchemaInner>,
}

impl Schema {
    pub fn get(&self, name: &str) -> Option<&Arc<MessageDefinition>> {
        self.inner
            .by_name
            .get(name)
            .map(|&i| &self.inner.definitions[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.by_name.contains_key(name)
    }

    /// All definitions, built-ins first, then in declaration order.
    pub fn definitions(&self) -> impl Iterator<Item = &MessageDefinition> {
        self.inner.definitions.iter().map(|d| d.as_ref())
    }

    pub fn len(&self) -> usize {
        self.inner.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.definitions.is_empty()
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.inner.definitions.len() == other.inner.definitions.len()
            && self
                .definitions()
                .zip(other.definitions())
                .all(|(a, b)| a == b)
    }
}
