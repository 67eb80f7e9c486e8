//! reloj - wall-clock sampling profiler driving GDB
//!
//! Attributes runtime to call stacks of a native target by periodically
//! interrupting it through a GDB subprocess and aggregating the symbolic
//! backtraces GDB reports. The library exposes the driver protocol engine,
//! the backtrace parsers, and the aggregation tables; the binary wires
//! them to the command line.

pub mod aggregator;
pub mod backtrace;
pub mod cli;
pub mod driver;
pub mod error;
pub mod report;
pub mod sampler;
