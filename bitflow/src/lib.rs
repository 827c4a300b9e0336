//! Bit-precise dataflow analysis for native-code decompilation.
//!
//! The crate consumes a function's intermediate representation (a control-flow graph of basic
//! blocks whose statements manipulate term expressions) and computes, by abstract
//! interpretation over a bit-precise value lattice, an abstract value for every term, a memory
//! location for terms denoting memory, the definitions reaching every read, and the
//! stack-offset and product flags later passes use to reconstruct variables and addressing.
//!
//! The entry point is [`analyzer::DataflowAnalyzer::analyze`]; the results accumulate in a
//! [`dataflow::Dataflow`] that survives the call.

pub mod abstract_value;
pub mod analysis_config;
pub mod analyzer;
pub mod arch;
pub mod cancellation;
pub mod cfg;
pub mod containers;
pub mod dataflow;
pub mod ir;
pub mod memory_location;
pub mod reaching_definitions;
pub mod tests;
pub mod value;

pub mod log {
    pub use slog_scope::{crit, debug, error, info, trace, warn};

    /// Build a logger writing compact output to stderr, for embedders that do not bring their
    /// own drain. Debug level: 0-warn, 1-info, 2-debug, 3-trace. Install it with
    /// `slog_scope::set_global_logger` and hold on to the returned guard.
    pub fn terminal_logger(debug_level: usize) -> slog::Logger {
        use sloggers::Build;

        let level = match debug_level {
            0 => sloggers::types::Severity::Warning,
            1 => sloggers::types::Severity::Info,
            2 => sloggers::types::Severity::Debug,
            _ => sloggers::types::Severity::Trace,
        };

        sloggers::terminal::TerminalLoggerBuilder::new()
            .destination(sloggers::terminal::Destination::Stderr)
            .level(level)
            .format(sloggers::types::Format::Compact)
            .build()
            .unwrap()
    }
}
