use std::{collections::HashMap, fmt};

use crate::message::Value;

/// Authenticated identity bound to a connection.
///
/// Produced by the server's user validator. Applications attach their own fields as typed
/// properties, which a [`Room`](super::Room) can read back through
/// [`Connection::user`](super::Connection::user).
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    name: String,
    properties: HashMap<String, Value>,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
