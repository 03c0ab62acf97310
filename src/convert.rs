//! Line-oriented conversion of a Chrome trace into Spall begin/end events.
//!
//! The input is a JSON array of trace events written one element per line,
//! as Chrome's Performance panel exports it. Every line is handled on its
//! own: `Profile` and `ProfileChunk` events are replaced by the begin/end
//! events reconstructed from their samples, and every other line is copied
//! to the output untouched.
//!
//! # Example
//!
//! ```no_run
//! use chrome_to_spall::convert::Converter;
//! use std::fs::File;
//! use std::io::{BufReader, BufWriter};
//!
//! let input = BufReader::new(File::open("trace.json").unwrap());
//! let output = BufWriter::new(File::create("trace.spall.json").unwrap());
//!
//! let mut converter = Converter::new();
//! let stats = converter.convert(input, output).unwrap();
//! eprintln!("{} begin events", stats.begin_events);
//! ```

use crate::profile::ProfileRegistry;
use crate::trace::{RecordKind, SpallEvent, TraceEvent, trim_framing};
use log::warn;
use std::io::{BufRead, Write};
use thiserror::Error;

/// Errors that abort a conversion.
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConvertError>;

/// Options for a conversion.
#[derive(Debug, Clone, Default)]
pub struct ConverterConfig {
    /// Emit an end event for every frame still open once the input is
    /// exhausted, so each thread's events balance.
    pub close_open_frames_at_eof: bool,
}

/// Counters collected over one conversion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvertStats {
    /// Input lines read.
    pub lines: usize,
    /// Lines copied to the output unchanged, including framing lines.
    pub passed_through: usize,
    pub profiles_started: usize,
    pub chunks: usize,
    pub samples: usize,
    pub begin_events: usize,
    pub end_events: usize,
    /// Lines skipped because they could not be decoded.
    pub decode_errors: usize,
    /// Chunks skipped because no `Profile` event preceded them.
    pub unknown_profile_chunks: usize,
}

/// Converter from a Chrome trace to Spall events.
pub struct Converter {
    config: ConverterConfig,
    registry: ProfileRegistry,
    stats: ConvertStats,
    events: Vec<SpallEvent>,
}

impl Converter {
    /// Create a new converter with the default configuration.
    pub fn new() -> Self {
        Self::with_config(ConverterConfig::default())
    }

    pub fn with_config(config: ConverterConfig) -> Self {
        Self {
            config,
            registry: ProfileRegistry::new(),
            stats: ConvertStats::default(),
            events: Vec::new(),
        }
    }

    /// Profiles seen so far.
    pub fn registry(&self) -> &ProfileRegistry {
        &self.registry
    }

    /// Convert every line of `reader`, writing the result to `writer`.
    pub fn convert<R: BufRead, W: Write>(
        &mut self,
        mut reader: R,
        mut writer: W,
    ) -> Result<ConvertStats> {
        let mut raw = Vec::new();

        loop {
            raw.clear();
            if reader.read_until(b'\n', &mut raw)? == 0 {
                break;
            }
            self.stats.lines += 1;

            let line = strip_line_ending(&raw);
            self.convert_line(line, &mut writer)?;
        }

        if self.config.close_open_frames_at_eof {
            self.registry.close_all(&mut self.events);
            self.flush_events(&mut writer)?;
        }

        writer.flush()?;
        Ok(self.stats.clone())
    }

    fn convert_line<W: Write>(&mut self, line: &[u8], writer: &mut W) -> Result<()> {
        let trimmed = trim_framing(line);
        if trimmed.is_empty() {
            return self.pass_through(line, writer);
        }

        let event = match TraceEvent::from_slice(trimmed) {
            Ok(event) => event,
            Err(e) => {
                self.decode_error(&e);
                return Ok(());
            }
        };

        let kind = event.kind();
        if kind == RecordKind::Other {
            return self.pass_through(line, writer);
        }

        let (pid, tid) = match event.ids() {
            Ok(ids) => ids,
            Err(e) => {
                self.decode_error(&e);
                return Ok(());
            }
        };

        match kind {
            RecordKind::ProfileStart => match event.profile_args() {
                Ok(args) => {
                    self.registry.start_profile(pid, args.data.start_time);
                    self.stats.profiles_started += 1;
                }
                Err(e) => self.decode_error(&e),
            },
            RecordKind::ProfileChunk => match event.profile_chunk_args() {
                Ok(args) => {
                    match self
                        .registry
                        .ingest_chunk(pid, tid, args.data, &mut self.events)
                    {
                        Ok(samples) => {
                            self.stats.chunks += 1;
                            self.stats.samples += samples;
                        }
                        Err(e) => {
                            warn!("line {}: {}", self.stats.lines, e);
                            self.stats.unknown_profile_chunks += 1;
                        }
                    }
                    self.flush_events(writer)?;
                }
                Err(e) => self.decode_error(&e),
            },
            RecordKind::Other => {}
        }

        Ok(())
    }

    fn pass_through<W: Write>(&mut self, line: &[u8], writer: &mut W) -> Result<()> {
        writer.write_all(line)?;
        writer.write_all(b"\n")?;
        self.stats.passed_through += 1;
        Ok(())
    }

    fn decode_error(&mut self, error: &dyn std::error::Error) {
        warn!("line {}: {}", self.stats.lines, error);
        self.stats.decode_errors += 1;
    }

    /// Write out pending events, each followed by a comma so they stay valid
    /// array elements.
    fn flush_events<W: Write>(&mut self, writer: &mut W) -> Result<()> {
        for event in self.events.drain(..) {
            if event.is_begin() {
                self.stats.begin_events += 1;
            } else {
                self.stats.end_events += 1;
            }
            let json = serde_json::to_string(&event).map_err(ConvertError::Encode)?;
            writeln!(writer, "{json},")?;
        }
        Ok(())
    }
}

impl Default for Converter {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove a trailing `\n` or `\r\n`.
fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
