//! Process Configuration
//!
//! The immutable record produced once by the command line layer and handed
//! to the engine during bootstrap. The host never parses or mutates it after
//! `initialize()`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How deprecation warnings raised by scripts are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeprecationPolicy {
    /// Print the warning and continue.
    #[default]
    Warn,
    /// Suppress the warning (`--no-deprecation`).
    Silence,
    /// Raise the warning as an exception (`--throw-deprecation`).
    Throw,
}

/// What the script source string means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptOp {
    /// A module specifier or file name to load.
    #[default]
    Specifier,
    /// Source text to evaluate (`--eval`).
    Eval,
    /// Source text to evaluate and print the result of (`--print`).
    Print,
}

/// Module type assumed for string input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputType {
    Module,
    #[default]
    #[serde(rename = "commonjs")]
    CommonJs,
}

impl InputType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "module" => Some(Self::Module),
            "commonjs" => Some(Self::CommonJs),
            _ => None,
        }
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Module => write!(f, "module"),
            Self::CommonJs => write!(f, "commonjs"),
        }
    }
}

/// Extension resolution algorithm for ES module specifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpecifierResolution {
    /// Node-style: extensions and directory indexes are tried.
    #[default]
    NodeStyle,
    /// Specifiers must name the file exactly.
    ExplicitExtension,
}

impl SpecifierResolution {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "node" => Some(Self::NodeStyle),
            "explicit" => Some(Self::ExplicitExtension),
            _ => None,
        }
    }
}

impl fmt::Display for SpecifierResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeStyle => write!(f, "node"),
            Self::ExplicitExtension => write!(f, "explicit"),
        }
    }
}

/// The script to run and how to interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScriptSource {
    pub op: ScriptOp,
    /// Specifier for [`ScriptOp::Specifier`], source text otherwise.
    pub source: String,
}

/// Immutable start-up configuration consumed by [`crate::RuntimeHost::initialize`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Configuration {
    pub deprecation: DeprecationPolicy,
    /// Expose a `gc()` function to scripts.
    pub expose_gc: bool,
    /// Allow importing internal builtin modules.
    pub expose_internals: bool,
    pub preserve_symlinks: bool,
    pub preserve_symlinks_main: bool,
    /// Custom module loader specifier.
    pub loader: Option<String>,
    pub script: ScriptSource,
    pub input_type: InputType,
    pub specifier_resolution: SpecifierResolution,
    /// CommonJS modules to preload, in order.
    pub require: Vec<String>,
    /// ES modules to preload, in order.
    pub import: Vec<String>,
    /// Extra conditions for conditional exports and imports, in order.
    pub conditions: Vec<String>,
    pub argv0: String,
    /// The host's own arguments that preceded the script.
    pub exec_argv: Vec<String>,
    /// The script's arguments.
    pub argv: Vec<String>,
}

impl Configuration {
    /// Configuration that runs the given specifier with every other field at its default.
    pub fn for_specifier(specifier: impl Into<String>) -> Self {
        Self {
            script: ScriptSource {
                op: ScriptOp::Specifier,
                source: specifier.into(),
            },
            ..Self::default()
        }
    }
}
