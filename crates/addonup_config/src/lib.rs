mod diagnostics;
mod options;
mod render;

// Re-export diagnostic types
pub use diagnostics::Diagnostic;
pub use diagnostics::Diagnostics;
pub use diagnostics::Error;
pub use diagnostics::LoadError;
pub use diagnostics::ValidationError;
pub use diagnostics::Warning;
pub use diagnostics::format_diagnostics;
pub use options::Options;
pub use options::Scope;
pub use options::scalar_to_string;
pub use render::RenderError;
pub use render::render;
