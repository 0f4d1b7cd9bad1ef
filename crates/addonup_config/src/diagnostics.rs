use std::path::PathBuf;

/// A diagnostic message that can be either a warning or an error
#[derive(Debug, Clone)]
pub enum Diagnostic {
    Warning(Warning),
    Error(Error),
}

/// Warning messages that don't prevent options loading
#[derive(Debug, Clone)]
pub enum Warning {
    EmptyOptions { file_path: PathBuf },
}

/// Error messages that indicate problems with the options file
#[derive(Debug, Clone)]
pub enum Error {
    Load(LoadError),
    Validation(ValidationError),
}

/// Error type for options loading failures (missing file, IO errors, parse errors)
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    /// The options file does not exist. Every launcher treats this as fatal,
    /// matching the hard failure on a missing /data/options.json.
    #[error("No {} file", path.display())]
    Missing { path: PathBuf },

    #[error("Failed to read options file {}: {error}", path.display())]
    Io {
        path: PathBuf,
        error: String, // Kept as a String since std::io::Error is not Clone
    },

    #[error("Failed to parse options file {}: {error}", path.display())]
    Parse { path: PathBuf, error: String },

    /// The file parsed but the top level was not a JSON object.
    #[error("Options file {} is not a JSON object", path.display())]
    NotAnObject { path: PathBuf },
}

/// Error type for per-option validation failures
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Dotted path to the offending option, e.g. `wireguard.private_key`
    pub field_path: String,
    pub message: String,
    /// The options file the value came from, when known
    pub source: Option<PathBuf>,
}

/// A collection of diagnostics (warnings and/or errors)
#[derive(Debug, Clone)]
pub struct Diagnostics(pub Vec<Diagnostic>);

impl std::fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format_diagnostics(&self.0))
    }
}

impl std::error::Error for Diagnostics {}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format_diagnostics(std::slice::from_ref(self)))
    }
}

impl Diagnostic {
    /// Returns true if this diagnostic is an error
    pub fn is_error(&self) -> bool {
        matches!(self, Diagnostic::Error(_))
    }

    /// Returns true if this diagnostic is a warning
    pub fn is_warning(&self) -> bool {
        matches!(self, Diagnostic::Warning(_))
    }
}

impl Diagnostics {
    pub fn has_errors(&self) -> bool {
        self.0.iter().any(Diagnostic::is_error)
    }
}

/// Format all diagnostics for display, one block per diagnostic
pub fn format_diagnostics(diagnostics: &[Diagnostic]) -> String {
    use std::fmt::Write;

    let mut output = String::new();

    for diagnostic in diagnostics {
        match diagnostic {
            Diagnostic::Warning(warning) => match warning {
                Warning::EmptyOptions { file_path } => {
                    writeln!(&mut output, "\x1b[33mWarning\x1b[0m: Empty options file").ok();
                    writeln!(&mut output, "  ┌─ {}", file_path.display()).ok();
                    writeln!(&mut output, "  │").ok();
                    writeln!(
                        &mut output,
                        "  = Options file '{}' contains no options",
                        file_path.display()
                    )
                    .ok();
                    writeln!(&mut output).ok();
                }
            },
            Diagnostic::Error(error) => match error {
                Error::Load(load_error) => {
                    writeln!(&mut output, "\x1b[31mError\x1b[0m: {}", load_error).ok();
                    writeln!(&mut output).ok();
                }
                Error::Validation(validation_error) => {
                    let file_path = validation_error
                        .source
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "<unknown>".to_string());

                    writeln!(
                        &mut output,
                        "\x1b[31mError\x1b[0m: Invalid option '{}'",
                        validation_error.field_path
                    )
                    .ok();
                    writeln!(&mut output, "  ┌─ {}", file_path).ok();
                    writeln!(&mut output, "  │").ok();
                    writeln!(&mut output, "  = {}", validation_error.message).ok();
                    writeln!(&mut output).ok();
                }
            },
        }
    }

    output
}
