// src/coder/mod.rs
// Coder-domain streaming: pattern extraction and UI event adaptation

mod adapter;
mod patterns;

pub use adapter::{AutoExecCallback, CoderStreamAdapter, EventEmitter};
pub use patterns::{ExtractorEvent, PatternName, StreamingPatternExtractor};
