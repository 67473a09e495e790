#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ft_schema::{AliasInfo, Argument, FunctionSchema, SchemaError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaArgType {
    Input,
    Output,
}

impl SchemaArgType {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

/// Names one input or output slot of a schema by list and position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaArgument {
    pub kind: SchemaArgType,
    pub index: usize,
}

impl SchemaArgument {
    #[must_use]
    pub const fn new(kind: SchemaArgType, index: usize) -> Self {
        Self { kind, index }
    }

    #[must_use]
    pub const fn input(index: usize) -> Self {
        Self::new(SchemaArgType::Input, index)
    }

    #[must_use]
    pub const fn output(index: usize) -> Self {
        Self::new(SchemaArgType::Output, index)
    }
}

impl fmt::Display for SchemaArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind.label(), self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaInfoError {
    OutOfRange {
        kind: SchemaArgType,
        index: usize,
        len: usize,
    },
    NotFound {
        name: String,
    },
    InvalidSchema(SchemaError),
}

impl fmt::Display for SchemaInfoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange { kind, index, len } => write!(
                f,
                "{} slot {index} is out of range (schema declares {len})",
                kind.label()
            ),
            Self::NotFound { name } => write!(f, "schema has no input slot named '{name}'"),
            Self::InvalidSchema(error) => write!(f, "invalid schema: {error}"),
        }
    }
}

impl std::error::Error for SchemaInfoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidSchema(error) => Some(error),
            _ => None,
        }
    }
}

impl From<SchemaError> for SchemaInfoError {
    fn from(value: SchemaError) -> Self {
        Self::InvalidSchema(value)
    }
}

/// Read-only mutation and aliasing queries over one operator schema.
///
/// The schema is shared, never mutated, and validated once at construction.
/// Aliasing follows the declared alias sets: two slots alias when their
/// sets intersect or when either carries the wildcard set, whatever the
/// other slot declares. The relation is reflexive and symmetric but not
/// transitive.
#[derive(Debug, Clone)]
pub struct SchemaInfo {
    schema: Arc<FunctionSchema>,
    input_positions: Arc<HashMap<String, usize>>,
}

impl SchemaInfo {
    pub fn new(schema: FunctionSchema) -> Result<Self, SchemaInfoError> {
        Self::from_shared(Arc::new(schema))
    }

    pub fn from_shared(schema: Arc<FunctionSchema>) -> Result<Self, SchemaInfoError> {
        schema.validate()?;
        let input_positions = schema
            .arguments
            .iter()
            .enumerate()
            .map(|(index, arg)| (arg.name.clone(), index))
            .collect();
        Ok(Self {
            schema,
            input_positions: Arc::new(input_positions),
        })
    }

    #[must_use]
    pub fn schema(&self) -> &FunctionSchema {
        &self.schema
    }

    #[must_use]
    pub fn shared_schema(&self) -> Arc<FunctionSchema> {
        Arc::clone(&self.schema)
    }

    #[must_use]
    pub fn num_inputs(&self) -> usize {
        self.schema.arguments.len()
    }

    #[must_use]
    pub fn num_outputs(&self) -> usize {
        self.schema.returns.len()
    }

    pub fn is_mutating(&self, index: usize) -> Result<bool, SchemaInfoError> {
        let arg = self.argument(SchemaArgument::input(index))?;
        Ok(arg.is_write())
    }

    pub fn is_mutating_by_name(&self, name: &str) -> Result<bool, SchemaInfoError> {
        let index = self.input_position(name)?;
        self.is_mutating(index)
    }

    pub fn are_aliasing(
        &self,
        lhs: SchemaArgument,
        rhs: SchemaArgument,
    ) -> Result<bool, SchemaInfoError> {
        let lhs_arg = self.argument(lhs)?;
        let rhs_arg = self.argument(rhs)?;
        if lhs == rhs {
            return Ok(true);
        }
        Ok(match (&lhs_arg.alias_info, &rhs_arg.alias_info) {
            (Some(left), Some(right)) => sets_alias(left, right),
            (Some(info), None) | (None, Some(info)) => info.is_wildcard(),
            (None, None) => false,
        })
    }

    /// Like [`Self::are_aliasing`], but also considers element annotations of
    /// container slots on either side.
    pub fn may_contain_alias(
        &self,
        lhs: SchemaArgument,
        rhs: SchemaArgument,
    ) -> Result<bool, SchemaInfoError> {
        if self.are_aliasing(lhs, rhs)? {
            return Ok(true);
        }
        Ok(
            match (
                self.argument(lhs)?.alias_info.as_ref(),
                self.argument(rhs)?.alias_info.as_ref(),
            ) {
                (Some(left), Some(right)) => {
                    let right_all = flatten_alias_info(right);
                    flatten_alias_info(left)
                        .iter()
                        .any(|l| right_all.iter().any(|r| sets_alias(l, r)))
                }
                (Some(info), None) | (None, Some(info)) => flatten_alias_info(info)
                    .iter()
                    .any(|element| element.is_wildcard()),
                (None, None) => false,
            },
        )
    }

    #[must_use]
    pub fn is_mutable(&self) -> bool {
        self.schema.is_mutable()
    }

    #[must_use]
    pub fn mutated_inputs(&self) -> Vec<usize> {
        self.schema
            .arguments
            .iter()
            .enumerate()
            .filter(|(_, arg)| arg.is_write())
            .map(|(index, _)| index)
            .collect()
    }

    #[must_use]
    pub fn has_argument(&self, name: &str) -> bool {
        self.input_positions.contains_key(name)
    }

    pub fn input_position(&self, name: &str) -> Result<usize, SchemaInfoError> {
        self.input_positions
            .get(name)
            .copied()
            .ok_or_else(|| SchemaInfoError::NotFound {
                name: name.to_string(),
            })
    }

    /// Input positions documented to alias output slot `index`.
    pub fn output_aliases(&self, index: usize) -> Result<Vec<usize>, SchemaInfoError> {
        let output = SchemaArgument::output(index);
        self.argument(output)?;
        let mut aliases = Vec::new();
        for input in 0..self.num_inputs() {
            if self.are_aliasing(SchemaArgument::input(input), output)? {
                aliases.push(input);
            }
        }
        Ok(aliases)
    }

    pub fn argument(&self, locator: SchemaArgument) -> Result<&Argument, SchemaInfoError> {
        let slots = match locator.kind {
            SchemaArgType::Input => &self.schema.arguments,
            SchemaArgType::Output => &self.schema.returns,
        };
        slots
            .get(locator.index)
            .ok_or(SchemaInfoError::OutOfRange {
                kind: locator.kind,
                index: locator.index,
                len: slots.len(),
            })
    }
}

fn sets_alias(left: &AliasInfo, right: &AliasInfo) -> bool {
    left.is_wildcard() || right.is_wildcard() || left.intersects(right)
}

fn flatten_alias_info(info: &AliasInfo) -> Vec<&AliasInfo> {
    let mut out = vec![info];
    let mut cursor = 0;
    while cursor < out.len() {
        let current = out[cursor];
        out.extend(current.contained.iter());
        cursor += 1;
    }
    out
}
