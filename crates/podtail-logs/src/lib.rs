//! Log tailing for podtail
//!
//! This crate provides the per-container tail (line codec, resume tracking,
//! content filtering), the tail manager that runs one tail per target under
//! a concurrency budget, and the sinks accepted lines are written to.

mod codec;
mod color;
mod filter;
mod manager;
mod parser;
mod restart;
mod resume;
mod sink;
mod tail;

#[cfg(test)]
mod testing;

pub use codec::{MalformedLineError, canonicalize, split_line};
pub use color::{PALETTE, color_index, colors_for};
pub use filter::ContentFilter;
pub use manager::{ManagerConfig, TailManager};
pub use parser::Payload;
pub use restart::{ExponentialBackoff, Immediate, RestartPolicy};
pub use resume::{ResumeTracker, should_skip};
pub use sink::{
    ConsoleConfig, ConsoleSink, ExportConfig, ExportSink, OutputFormat, Sink, SinkError, SinkKind,
    SinkSet, TimestampFormat, Timezone,
};
pub use tail::{Tail, TailOutcome, TailState};

// Re-export types used in our public API
pub use podtail_types::{LogLevel, LogLine, ResumeRequest, Target, Watermark};
