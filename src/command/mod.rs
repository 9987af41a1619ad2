//! Safe execution of external tools and scripts.
//!
//! Everything this crate does to the host happens through external
//! executables (distribution CLI, hypervisor binary, disk-image tool, GPU
//! query tool), so this module carries the guarantees the rest of the crate
//! leans on:
//!
//! - stdout and stderr are drained concurrently while the child runs, never
//!   via a single blocking read (a child writing to a full pipe while the
//!   parent blocks on the other stream is a deadlock, not a slow command)
//! - completion means the process exited AND both streams hit end-of-stream,
//!   raced against a deadline
//! - failures are always surfaced to the caller as typed errors
//!
//! [`parser::OutputParser`] is the declarative mini-language used to scrape
//! values and tables out of tool output.

pub mod parser;
pub mod runner;
pub mod script;

pub use parser::OutputParser;
pub use runner::{
    is_elevated, CommandCapture, CommandDriver, CommandHandlers, CommandRequest, CommandRunner,
    OutputEncoding,
};
pub use script::{ScriptHandlers, ScriptRunner};
