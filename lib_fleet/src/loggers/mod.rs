/// Tracing subscriber setup with console and rolling file output.
pub mod logger;
