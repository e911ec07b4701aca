//! Symbol model: locations, kinds, queries and resolution candidates.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::lsp::{Position, Range};

/// A resolved location in the workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub file: PathBuf,
    pub range: Range,
}

impl Location {
    pub fn new(file: PathBuf, range: Range) -> Self {
        Self { file, range }
    }

    pub fn point(file: PathBuf, pos: Position) -> Self {
        Self {
            file,
            range: Range::point(pos),
        }
    }

    /// 1-indexed (line, column) for caller display
    pub fn display_position(&self) -> (u32, u32) {
        self.range.start.to_display()
    }
}

/// Symbol kind, a readable subset of the LSP numeric kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    File,
    Module,
    Namespace,
    Package,
    Class,
    Method,
    Property,
    Field,
    Constructor,
    Enum,
    Interface,
    Function,
    Variable,
    Constant,
    EnumMember,
    Struct,
    TypeParameter,
    Other,
}

impl SymbolKind {
    /// Map an LSP numeric symbol kind (1..=26) to the domain kind
    pub fn from_lsp(value: u32) -> Self {
        match value {
            1 => Self::File,
            2 => Self::Module,
            3 => Self::Namespace,
            4 => Self::Package,
            5 => Self::Class,
            6 => Self::Method,
            7 => Self::Property,
            8 => Self::Field,
            9 => Self::Constructor,
            10 => Self::Enum,
            11 => Self::Interface,
            12 => Self::Function,
            13 => Self::Variable,
            14 => Self::Constant,
            22 => Self::EnumMember,
            23 => Self::Struct,
            26 => Self::TypeParameter,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::File => "file",
            Self::Module => "module",
            Self::Namespace => "namespace",
            Self::Package => "package",
            Self::Class => "class",
            Self::Method => "method",
            Self::Property => "property",
            Self::Field => "field",
            Self::Constructor => "constructor",
            Self::Enum => "enum",
            Self::Interface => "interface",
            Self::Function => "function",
            Self::Variable => "variable",
            Self::Constant => "constant",
            Self::EnumMember => "enum member",
            Self::Struct => "struct",
            Self::TypeParameter => "type parameter",
            Self::Other => "symbol",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for SymbolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "function" | "fn" | "func" => Ok(Self::Function),
            "method" => Ok(Self::Method),
            "class" => Ok(Self::Class),
            "struct" => Ok(Self::Struct),
            "enum" => Ok(Self::Enum),
            "interface" | "trait" => Ok(Self::Interface),
            "variable" | "var" => Ok(Self::Variable),
            "constant" | "const" => Ok(Self::Constant),
            "field" => Ok(Self::Field),
            "property" => Ok(Self::Property),
            "module" | "mod" => Ok(Self::Module),
            "namespace" => Ok(Self::Namespace),
            _ => Err(format!("Unknown symbol kind: '{}'", s)),
        }
    }
}

/// How the caller identifies the symbol to operate on.
///
/// Name queries are ambiguous and may yield several candidates; an exact
/// position bypasses the lexical scan entirely and degrades to a
/// single-location query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolTarget {
    Named {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<SymbolKind>,
        /// Approximate caller-supplied position; may be 1-based or off by one
        #[serde(skip_serializing_if = "Option::is_none")]
        near: Option<Position>,
    },
    /// Verified 0-indexed position; no probing, no disambiguation
    Exact(Position),
}

impl SymbolTarget {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named {
            name: name.into(),
            kind: None,
            near: None,
        }
    }

    pub fn named_with_kind(name: impl Into<String>, kind: SymbolKind) -> Self {
        Self::Named {
            name: name.into(),
            kind: Some(kind),
            near: None,
        }
    }
}

/// A tentatively matched symbol awaiting confirmation or disambiguation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub name: String,
    /// Position in the queried file where the name occurs (0-indexed)
    pub query_position: Position,
    /// Definition this occurrence resolves to
    pub location: Location,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<SymbolKind>,
}
