pub mod changelog;
pub mod config;
pub mod measure;
pub mod program;
pub mod state;
pub mod tokenize;
pub mod vm;

pub use config::InterpreterConfig;
pub use program::{LineData, ParsedProgram, ProgramSummary};
pub use vm::{GeometrySink, Interpreter, NullSink, VmState};
