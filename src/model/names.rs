//! Names used as registry keys, locking keys and correlation identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::errors::{MediatorError, Result};

/// Built-in type names that never need resolving or locking
pub const PRIMITIVE_TYPES: &[&str] = &[
    "any", "void", "bool", "boolean", "int", "integer", "long", "float", "double", "number",
    "string", "bytes",
];

/// Qualified action or type name: `namespace:name` with an optional `@version`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActionName {
    namespace: String,
    name: String,
    version: Option<u32>,
}

impl ActionName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (qualified, version) = match raw.rsplit_once('@') {
            Some((head, v)) => {
                let version = v
                    .parse::<u32>()
                    .map_err(|_| MediatorError::parse(format!("invalid version in '{}'", raw)))?;
                (head, Some(version))
            }
            None => (raw, None),
        };
        let (namespace, name) = qualified
            .split_once(':')
            .ok_or_else(|| MediatorError::parse(format!("'{}' is not a qualified name", raw)))?;
        if namespace.is_empty() || name.is_empty() || name.contains(':') {
            return Err(MediatorError::parse(format!(
                "'{}' is not a qualified name",
                raw
            )));
        }
        if !is_identifier_path(namespace) || !is_identifier_path(name) {
            return Err(MediatorError::parse(format!(
                "'{}' contains invalid characters",
                raw
            )));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            version,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Option<u32> {
        self.version
    }

    /// True when this name lives in `namespace` or one of its sub-namespaces
    pub fn in_namespace(&self, namespace: &str) -> bool {
        namespace == "*"
            || self.namespace == namespace
            || self
                .namespace
                .strip_prefix(namespace)
                .map_or(false, |rest| rest.starts_with('.'))
    }
}

fn is_identifier_path(s: &str) -> bool {
    s.split('.').all(|part| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    })
}

impl fmt::Display for ActionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)?;
        if let Some(v) = self.version {
            write!(f, "@{}", v)?;
        }
        Ok(())
    }
}

impl FromStr for ActionName {
    type Err = MediatorError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ActionName {
    type Error = MediatorError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ActionName> for String {
    fn from(value: ActionName) -> Self {
        value.to_string()
    }
}

/// A type reference as written in a declaration
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeRef {
    Primitive(String),
    Named(ActionName),
    /// `list<X>` or `X[]`
    Collection(Box<TypeRef>),
}

impl TypeRef {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if let Some(inner) = raw.strip_suffix("[]") {
            return Ok(Self::Collection(Box::new(Self::parse(inner)?)));
        }
        if let Some(inner) = raw
            .strip_prefix("list<")
            .and_then(|rest| rest.strip_suffix('>'))
        {
            return Ok(Self::Collection(Box::new(Self::parse(inner)?)));
        }
        if PRIMITIVE_TYPES.contains(&raw.to_ascii_lowercase().as_str()) {
            return Ok(Self::Primitive(raw.to_ascii_lowercase()));
        }
        Ok(Self::Named(ActionName::parse(raw)?))
    }

    /// Innermost element type of nested collections
    pub fn element(&self) -> &TypeRef {
        match self {
            Self::Collection(inner) => inner.element(),
            other => other,
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primitive(p) => f.write_str(p),
            Self::Named(n) => write!(f, "{}", n),
            Self::Collection(inner) => write!(f, "list<{}>", inner),
        }
    }
}

/// Correlation identifier for one execution attempt
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionUid(String);

impl TransactionUid {
    pub fn generate() -> Self {
        Self(format!("tx_{}", cuid2::create_id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TransactionUid {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TransactionUid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TransactionUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
