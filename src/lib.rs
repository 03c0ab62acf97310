//! Convert Chrome CPU profiles into Spall-friendly begin/end events.
//!
//! Chrome's Performance panel records JavaScript execution as a sampled
//! CPU profile: `Profile` and `ProfileChunk` trace events carrying a call
//! tree and, for each sample, only the node at the top of the stack. Viewers
//! such as Spall want explicit begin/end events instead. This crate
//! reconstructs the call stack sample by sample and emits the transitions.
//!
//! # Modules
//!
//! - [`trace`] - Trace event records, classification and output events
//! - [`stack`] - Call stack reconstruction for a single profile
//! - [`profile`] - Per-process profile registry
//! - [`convert`] - Line-by-line conversion of a whole trace
//!
//! # Example
//!
//! ```
//! use chrome_to_spall::convert::Converter;
//! use std::io::Cursor;
//!
//! let input = concat!(
//!     r#"[{"args":{"data":{"startTime":1000}},"cat":"disabled-by-default-v8.cpu_profiler","name":"Profile","ph":"P","pid":1,"tid":1,"ts":0},"#,
//!     "\n",
//!     r#"{"args":{"data":{"cpuProfile":{"nodes":[{"id":1,"callFrame":{"functionName":"main"}}],"samples":[1]},"timeDeltas":[5]}},"cat":"disabled-by-default-v8.cpu_profiler","name":"ProfileChunk","ph":"P","pid":1,"tid":1,"ts":0}]"#,
//!     "\n",
//! );
//!
//! let mut output = Vec::new();
//! Converter::new().convert(Cursor::new(input), &mut output).unwrap();
//!
//! assert_eq!(
//!     String::from_utf8(output).unwrap(),
//!     "{\"name\":\"main\",\"cat\":\"function\",\"ph\":\"B\",\"ts\":1005,\"pid\":1,\"tid\":1},\n"
//! );
//! ```

pub mod convert;
pub mod profile;
pub mod stack;
pub mod trace;

pub use convert::{ConvertError, ConvertStats, Converter, ConverterConfig};
