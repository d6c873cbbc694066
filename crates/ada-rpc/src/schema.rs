//! Per-endpoint argument schemas.

use crate::error::RpcError;
use crate::message::Payload;
use thiserror::Error;

/// Why a request's arguments do not fit an endpoint's schema.
///
/// The messages are part of the wire contract and are sent verbatim to the
/// caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("extra arguement {0} provided")]
    ExtraArgument(String),

    #[error("Not all required arguements provided [{}]", quoted(.0))]
    MissingArguments(Vec<String>),

    #[error("arguments must be a mapping")]
    NotAMapping,
}

fn quoted(names: &[String]) -> String {
    names
        .iter()
        .map(|name| format!("'{}'", name))
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<ValidationError> for RpcError {
    fn from(err: ValidationError) -> Self {
        RpcError::InvalidArguments {
            message: err.to_string(),
        }
    }
}

/// Argument names an endpoint accepts, each marked required or optional.
///
/// Declaration order is kept so missing arguments are reported in the order
/// they were declared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgumentSchema {
    arguments: Vec<(String, bool)>,
}

impl ArgumentSchema {
    /// A schema that accepts no arguments.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(self, name: impl Into<String>) -> Self {
        self.with(name, true)
    }

    pub fn optional(self, name: impl Into<String>) -> Self {
        self.with(name, false)
    }

    /// Declare `name`, replacing any earlier declaration of the same name.
    pub fn with(mut self, name: impl Into<String>, required: bool) -> Self {
        let name = name.into();
        match self.arguments.iter_mut().find(|(known, _)| *known == name) {
            Some(entry) => entry.1 = required,
            None => self.arguments.push((name, required)),
        }
        self
    }

    pub fn is_required(&self, name: &str) -> Option<bool> {
        self.arguments
            .iter()
            .find(|(known, _)| known == name)
            .map(|(_, required)| *required)
    }

    /// Check `args` against this schema.
    ///
    /// Every supplied name must be declared, and every required name must be
    /// supplied. A binary payload supplies no names.
    pub fn validate(&self, args: &Payload) -> Result<(), ValidationError> {
        let supplied: Vec<&str> = match args {
            Payload::Binary(_) => Vec::new(),
            Payload::Json(_) => args
                .as_object()
                .ok_or(ValidationError::NotAMapping)?
                .keys()
                .map(String::as_str)
                .collect(),
        };

        let mut required: Vec<&str> = self
            .arguments
            .iter()
            .filter(|(_, required)| *required)
            .map(|(name, _)| name.as_str())
            .collect();

        for name in supplied {
            if let Some(index) = required.iter().position(|r| *r == name) {
                required.remove(index);
            } else if self.is_required(name).is_none() {
                return Err(ValidationError::ExtraArgument(name.to_string()));
            }
        }

        if !required.is_empty() {
            return Err(ValidationError::MissingArguments(
                required.into_iter().map(String::from).collect(),
            ));
        }
        Ok(())
    }
}

impl<S: Into<String>> FromIterator<(S, bool)> for ArgumentSchema {
    fn from_iter<I: IntoIterator<Item = (S, bool)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |schema, (name, required)| schema.with(name, required))
    }
}
