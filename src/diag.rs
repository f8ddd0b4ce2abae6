use std::fmt;

/// Where a problem was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// 1-based line in an assembly source.
    Line(usize),
    /// A block in a block graph, optionally narrowed to one of its ports.
    Block {
        block: String,
        port: Option<String>,
    },
    /// The compilation as a whole.
    Global,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Line(n) => write!(f, "line {n}"),
            Self::Block { block, port: None } => write!(f, "block `{block}`"),
            Self::Block {
                block,
                port: Some(port),
            } => write!(f, "block `{block}` port `{port}`"),
            Self::Global => f.write_str("program"),
        }
    }
}

/// A single problem reported by the assembler or the graph compiler.
///
/// Fatal diagnostics make the whole compile fail; non-fatal ones are
/// warnings and do not prevent output.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub location: Location,
    pub fatal: bool,
    pub message: String,
}

impl Diagnostic {
    pub fn error_at(line: usize, message: impl Into<String>) -> Self {
        Self {
            location: Location::Line(line),
            fatal: true,
            message: message.into(),
        }
    }

    pub fn warning_at(line: usize, message: impl Into<String>) -> Self {
        Self {
            location: Location::Line(line),
            fatal: false,
            message: message.into(),
        }
    }

    pub fn error_for(block: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            location: Location::Block {
                block: block.into(),
                port: None,
            },
            fatal: true,
            message: message.into(),
        }
    }

    pub fn error_for_port(
        block: impl Into<String>,
        port: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            location: Location::Block {
                block: block.into(),
                port: Some(port.into()),
            },
            fatal: true,
            message: message.into(),
        }
    }

    pub fn warning_for(block: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            location: Location::Block {
                block: block.into(),
                port: None,
            },
            fatal: false,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            location: Location::Global,
            fatal: true,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            location: Location::Global,
            fatal: false,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = if self.fatal { "error" } else { "warning" };
        write!(f, "{severity}: {}: {}", self.location, self.message)
    }
}

impl std::error::Error for Diagnostic {}

/// True when any diagnostic in the list is fatal.
#[must_use]
pub fn any_fatal(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(|d| d.fatal)
}
