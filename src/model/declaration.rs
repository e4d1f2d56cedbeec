use serde::{Deserialize, Serialize};

use crate::core::errors::Result;
use crate::model::names::{ActionName, TypeRef};

/// Parameter direction within an action signature
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub direction: Direction,
    #[serde(rename = "type")]
    pub type_name: String,
}

impl Parameter {
    pub fn input(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: Direction::In,
            type_name: type_name.into(),
        }
    }

    pub fn output(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Out,
            type_name: type_name.into(),
        }
    }

    pub fn is_output(&self) -> bool {
        self.direction == Direction::Out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeclarationKind {
    /// Data type; never executed
    Type,
    /// Primitive action run by a registered executor
    Action,
    /// Composite action with a body interpreted by the engine
    Procedure,
    /// Action already defined inside the engine
    Predefined,
}

/// Immutable description of an action or type
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    pub name: ActionName,
    pub kind: DeclarationKind,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<ActionName>,
    /// Additional names this declaration needs, e.g. actions called from a body
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<String>,
}

impl Declaration {
    pub fn new(name: ActionName, kind: DeclarationKind) -> Self {
        Self {
            name,
            kind,
            parameters: Vec::new(),
            extends: None,
            requires: Vec::new(),
            body: None,
            constraints: None,
        }
    }

    pub fn type_decl(name: ActionName) -> Self {
        Self::new(name, DeclarationKind::Type)
    }

    pub fn action(name: ActionName) -> Self {
        Self::new(name, DeclarationKind::Action)
    }

    pub fn procedure(name: ActionName, body: impl Into<String>) -> Self {
        let mut decl = Self::new(name, DeclarationKind::Procedure);
        decl.body = Some(body.into());
        decl
    }

    pub fn predefined(name: ActionName) -> Self {
        Self::new(name, DeclarationKind::Predefined)
    }

    pub fn with_param(mut self, param: Parameter) -> Self {
        self.parameters.push(param);
        self
    }

    pub fn with_requires(mut self, name: impl Into<String>) -> Self {
        self.requires.push(name.into());
        self
    }

    pub fn with_extends(mut self, parent: ActionName) -> Self {
        self.extends = Some(parent);
        self
    }

    pub fn with_constraints(mut self, constraints: impl Into<String>) -> Self {
        self.constraints = Some(constraints.into());
        self
    }

    /// Whether this declaration can be executed
    pub fn is_action(&self) -> bool {
        !matches!(self.kind, DeclarationKind::Type)
    }

    pub fn arity(&self) -> usize {
        self.parameters.len()
    }

    /// Positions of output parameters, in signature order
    pub fn output_positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.parameters
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_output())
            .map(|(i, _)| i)
    }

    /// Every type or action name this declaration depends on, in declaration
    /// order and without repeats. The declaration's own name is skipped.
    pub fn required_types(&self) -> Result<Vec<TypeRef>> {
        let mut out: Vec<TypeRef> = Vec::new();
        let mut push = |t: TypeRef| {
            if !out.contains(&t) {
                out.push(t);
            }
        };
        if let Some(parent) = &self.extends {
            push(TypeRef::Named(parent.clone()));
        }
        for param in &self.parameters {
            push(TypeRef::parse(&param.type_name)?);
        }
        for name in &self.requires {
            push(TypeRef::parse(name)?);
        }
        out.retain(|t| !matches!(t.element(), TypeRef::Named(n) if n == &self.name));
        Ok(out)
    }
}
