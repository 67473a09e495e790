#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Alias-set symbol meaning "may alias anything".
pub const WILDCARD_ALIAS_SET: &str = "*";
const MAX_SCHEMA_PAYLOAD_BYTES: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgumentType {
    Tensor,
    OptionalTensor,
    TensorList,
    Int,
    Float,
    Bool,
    Scalar,
    IntList,
    Str,
    Generic,
}

impl ArgumentType {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Tensor => "Tensor",
            Self::OptionalTensor => "Tensor?",
            Self::TensorList => "Tensor[]",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Scalar => "Scalar",
            Self::IntList => "int[]",
            Self::Str => "str",
            Self::Generic => "Any",
        }
    }

    fn render(self, alias_info: Option<&AliasInfo>) -> String {
        let top = alias_info.map(ToString::to_string).unwrap_or_default();
        match self {
            Self::OptionalTensor => format!("Tensor{top}?"),
            Self::TensorList => {
                let element = alias_info
                    .and_then(|info| info.contained.first())
                    .map(ToString::to_string)
                    .unwrap_or_default();
                format!("Tensor{element}[]{top}")
            }
            other => format!("{}{top}", other.label()),
        }
    }
}

/// Alias annotation attached to one slot: the alias sets it belongs to,
/// whether the operator writes through it, and annotations of contained
/// element types (e.g. the elements of a `Tensor(a)[]`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AliasInfo {
    #[serde(default)]
    pub sets: BTreeSet<String>,
    #[serde(default)]
    pub is_write: bool,
    #[serde(default)]
    pub contained: Vec<AliasInfo>,
}

impl AliasInfo {
    #[must_use]
    pub fn read(set: impl Into<String>) -> Self {
        Self {
            sets: BTreeSet::from([set.into()]),
            is_write: false,
            contained: Vec::new(),
        }
    }

    #[must_use]
    pub fn write(set: impl Into<String>) -> Self {
        Self {
            is_write: true,
            ..Self::read(set)
        }
    }

    #[must_use]
    pub fn wildcard() -> Self {
        Self::read(WILDCARD_ALIAS_SET)
    }

    /// Annotation with no top-level set that only describes contained elements.
    #[must_use]
    pub fn containing(element: AliasInfo) -> Self {
        Self {
            sets: BTreeSet::new(),
            is_write: false,
            contained: vec![element],
        }
    }

    #[must_use]
    pub fn with_contained(mut self, element: AliasInfo) -> Self {
        self.contained.push(element);
        self
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.sets.contains(WILDCARD_ALIAS_SET)
    }

    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.sets.iter().any(|set| other.sets.contains(set))
    }

    fn validate(&self, argument: &str) -> Result<(), SchemaError> {
        for symbol in &self.sets {
            if symbol != WILDCARD_ALIAS_SET && !is_alias_symbol(symbol) {
                return Err(SchemaError::InvalidAliasSymbol {
                    argument: argument.to_string(),
                    symbol: symbol.clone(),
                });
            }
        }
        if self.is_write && self.sets.is_empty() {
            return Err(SchemaError::WriteWithoutAliasSet {
                argument: argument.to_string(),
            });
        }
        if self.is_wildcard() && self.sets.len() > 1 {
            return Err(SchemaError::MixedWildcardSet {
                argument: argument.to_string(),
            });
        }
        for element in &self.contained {
            element.validate(argument)?;
        }
        Ok(())
    }
}

impl fmt::Display for AliasInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sets.is_empty() && !self.is_write {
            return Ok(());
        }
        let joined = self
            .sets
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("|");
        let marker = if self.is_write { "!" } else { "" };
        write!(f, "({joined}{marker})")
    }
}

fn is_alias_symbol(symbol: &str) -> bool {
    let mut chars = symbol.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Argument {
    #[serde(default)]
    pub name: String,
    pub ty: ArgumentType,
    #[serde(default)]
    pub alias_info: Option<AliasInfo>,
    #[serde(default)]
    pub kwarg_only: bool,
}

impl Argument {
    #[must_use]
    pub fn new(name: impl Into<String>, ty: ArgumentType) -> Self {
        Self {
            name: name.into(),
            ty,
            alias_info: None,
            kwarg_only: false,
        }
    }

    #[must_use]
    pub fn tensor(name: impl Into<String>) -> Self {
        Self::new(name, ArgumentType::Tensor)
    }

    /// Unnamed slot, the usual shape of a return value.
    #[must_use]
    pub fn unnamed(ty: ArgumentType) -> Self {
        Self::new(String::new(), ty)
    }

    #[must_use]
    pub fn with_alias(mut self, alias_info: AliasInfo) -> Self {
        self.alias_info = Some(alias_info);
        self
    }

    #[must_use]
    pub fn keyword_only(mut self) -> Self {
        self.kwarg_only = true;
        self
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        self.alias_info.as_ref().is_some_and(|info| info.is_write)
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self.ty.render(self.alias_info.as_ref());
        if self.name.is_empty() {
            write!(f, "{rendered}")
        } else {
            write!(f, "{rendered} {}", self.name)
        }
    }
}

/// Declared signature of one operator overload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FunctionSchema {
    pub name: String,
    #[serde(default)]
    pub overload_name: String,
    #[serde(default)]
    pub arguments: Vec<Argument>,
    #[serde(default)]
    pub returns: Vec<Argument>,
}

impl FunctionSchema {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        overload_name: impl Into<String>,
        arguments: Vec<Argument>,
        returns: Vec<Argument>,
    ) -> Self {
        Self {
            name: name.into(),
            overload_name: overload_name.into(),
            arguments,
            returns,
        }
    }

    #[must_use]
    pub fn qualified_name(&self) -> String {
        if self.overload_name.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.name, self.overload_name)
        }
    }

    #[must_use]
    pub fn argument_index_with_name(&self, name: &str) -> Option<usize> {
        self.arguments.iter().position(|arg| arg.name == name)
    }

    #[must_use]
    pub fn is_mutable(&self) -> bool {
        self.arguments.iter().any(Argument::is_write)
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.name.trim().is_empty() {
            return Err(SchemaError::EmptyOperatorName);
        }

        let mut seen = HashSet::with_capacity(self.arguments.len());
        for (index, arg) in self.arguments.iter().enumerate() {
            if arg.name.is_empty() {
                return Err(SchemaError::EmptyArgumentName { index });
            }
            if !seen.insert(arg.name.as_str()) {
                return Err(SchemaError::DuplicateArgumentName {
                    name: arg.name.clone(),
                });
            }
            if let Some(info) = &arg.alias_info {
                info.validate(arg.name.as_str())?;
            }
        }

        let mut seen_returns = HashSet::with_capacity(self.returns.len());
        for (index, ret) in self.returns.iter().enumerate() {
            if !ret.name.is_empty() && !seen_returns.insert(ret.name.as_str()) {
                return Err(SchemaError::DuplicateReturnName {
                    name: ret.name.clone(),
                });
            }
            if let Some(info) = &ret.alias_info {
                let label = if ret.name.is_empty() {
                    format!("return {index}")
                } else {
                    ret.name.clone()
                };
                info.validate(label.as_str())?;
            }
        }

        Ok(())
    }
}

impl fmt::Display for FunctionSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.qualified_name())?;
        let mut star_emitted = false;
        for (index, arg) in self.arguments.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            if arg.kwarg_only && !star_emitted {
                write!(f, "*, ")?;
                star_emitted = true;
            }
            write!(f, "{arg}")?;
        }
        write!(f, ") -> ")?;
        match self.returns.as_slice() {
            [single] => write!(f, "{single}"),
            many => {
                let rendered = many
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "({rendered})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    EmptyOperatorName,
    EmptyArgumentName { index: usize },
    DuplicateArgumentName { name: String },
    DuplicateReturnName { name: String },
    InvalidAliasSymbol { argument: String, symbol: String },
    MixedWildcardSet { argument: String },
    WriteWithoutAliasSet { argument: String },
    InvalidJson { diagnostic: String },
    UnknownField { field: String },
    PayloadTooLarge { actual: usize, max: usize },
    IncompatiblePayload { reason: String },
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyOperatorName => write!(f, "schema operator name is empty"),
            Self::EmptyArgumentName { index } => {
                write!(f, "schema input slot {index} has an empty name")
            }
            Self::DuplicateArgumentName { name } => {
                write!(f, "schema declares input '{name}' more than once")
            }
            Self::DuplicateReturnName { name } => {
                write!(f, "schema declares return '{name}' more than once")
            }
            Self::InvalidAliasSymbol { argument, symbol } => {
                write!(f, "invalid alias set symbol '{symbol}' on '{argument}'")
            }
            Self::MixedWildcardSet { argument } => {
                write!(
                    f,
                    "wildcard alias set on '{argument}' cannot be combined with named sets"
                )
            }
            Self::WriteWithoutAliasSet { argument } => {
                write!(f, "write annotation on '{argument}' names no alias set")
            }
            Self::InvalidJson { diagnostic } => write!(f, "invalid json: {diagnostic}"),
            Self::UnknownField { field } => write!(f, "unknown field '{field}'"),
            Self::PayloadTooLarge { actual, max } => {
                write!(f, "schema payload exceeds max bytes: actual={actual} max={max}")
            }
            Self::IncompatiblePayload { reason } => write!(f, "incompatible payload: {reason}"),
        }
    }
}

impl std::error::Error for SchemaError {}

/// Decodes a structured schema description and validates it.
pub fn decode_schema_json(input: &str) -> Result<FunctionSchema, SchemaError> {
    if input.len() > MAX_SCHEMA_PAYLOAD_BYTES {
        return Err(SchemaError::PayloadTooLarge {
            actual: input.len(),
            max: MAX_SCHEMA_PAYLOAD_BYTES,
        });
    }
    let schema: FunctionSchema = serde_json::from_str(input).map_err(|error| {
        let message = error.to_string();
        if let Some(field) = extract_unknown_field(message.as_str()) {
            SchemaError::UnknownField { field }
        } else {
            SchemaError::InvalidJson {
                diagnostic: bounded(message.as_str(), 200),
            }
        }
    })?;
    schema.validate()?;
    Ok(schema)
}

pub fn encode_schema_json(schema: &FunctionSchema) -> Result<String, SchemaError> {
    serde_json::to_string(schema).map_err(|error| SchemaError::IncompatiblePayload {
        reason: format!("schema encoding failed: {error}"),
    })
}

fn extract_unknown_field(message: &str) -> Option<String> {
    // serde_json message shape: "unknown field `x`, expected ..."
    let marker = "unknown field `";
    let start = message.find(marker)? + marker.len();
    let tail = &message[start..];
    let end = tail.find('`')?;
    Some(tail[..end].to_string())
}

fn bounded(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut boundary = max_len;
    while boundary > 0 && !input.is_char_boundary(boundary) {
        boundary -= 1;
    }
    format!("{}...", &input[..boundary])
}
