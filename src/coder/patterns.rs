// src/coder/patterns.rs
// Incremental extractor for top-level <MESSAGE> / <TOOL_CALL> blocks

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternName {
    Message,
    ToolCall,
}

impl PatternName {
    pub fn open_tag(&self) -> &'static str {
        match self {
            PatternName::Message => "<MESSAGE>",
            PatternName::ToolCall => "<TOOL_CALL>",
        }
    }

    pub fn close_tag(&self) -> &'static str {
        match self {
            PatternName::Message => "</MESSAGE>",
            PatternName::ToolCall => "</TOOL_CALL>",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PatternName::Message => "message",
            PatternName::ToolCall => "tool_call",
        }
    }
}

const PATTERNS: [PatternName; 2] = [PatternName::Message, PatternName::ToolCall];

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractorEvent {
    PatternStart {
        name: PatternName,
    },
    PatternContent {
        name: PatternName,
        chunk: String,
    },
    PatternEnd {
        name: PatternName,
        content: String,
    },
}

enum State {
    Outside,
    Inside {
        name: PatternName,
        content: String,
        emitted: usize,
    },
}

/// Streaming block parser. Content is emitted incrementally with a
/// holdback: no emitted chunk ever ends in a suffix that could grow into
/// the enclosing close tag, so consumers never see a partial `</MESSAGE>`.
pub struct StreamingPatternExtractor {
    buffer: String,
    state: State,
    completed: Vec<(PatternName, String)>,
}

impl Default for StreamingPatternExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingPatternExtractor {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            state: State::Outside,
            completed: Vec::new(),
        }
    }

    pub fn feed_chunk(&mut self, text: &str) -> Vec<ExtractorEvent> {
        self.buffer.push_str(text);
        let mut events = Vec::new();
        loop {
            let progressed = match &mut self.state {
                State::Outside => self.scan_for_open(&mut events),
                State::Inside { .. } => self.scan_for_close(&mut events),
            };
            if !progressed {
                break;
            }
        }
        events
    }

    /// Close out the stream. Returns completed segments plus any
    /// unterminated block content keyed by pattern name.
    pub fn finalize(mut self) -> (Vec<(PatternName, String)>, HashMap<&'static str, String>) {
        let mut malformed = HashMap::new();
        if let State::Inside { name, mut content, .. } = self.state {
            content.push_str(&self.buffer);
            malformed.insert(name.as_str(), content);
        }
        (std::mem::take(&mut self.completed), malformed)
    }

    fn scan_for_open(&mut self, events: &mut Vec<ExtractorEvent>) -> bool {
        let hit = PATTERNS
            .iter()
            .filter_map(|p| self.buffer.find(p.open_tag()).map(|at| (at, *p)))
            .min_by_key(|(at, _)| *at);

        match hit {
            Some((at, name)) => {
                self.buffer.drain(..at + name.open_tag().len());
                self.state = State::Inside {
                    name,
                    content: String::new(),
                    emitted: 0,
                };
                events.push(ExtractorEvent::PatternStart { name });
                true
            }
            None => {
                // Drop text that can no longer begin an open tag, keeping
                // any suffix that is a prefix of one.
                let keep = PATTERNS
                    .iter()
                    .map(|p| partial_suffix_len(&self.buffer, p.open_tag()))
                    .max()
                    .unwrap_or(0);
                let cut = self.buffer.len() - keep;
                if cut > 0 {
                    self.buffer.drain(..cut);
                }
                false
            }
        }
    }

    fn scan_for_close(&mut self, events: &mut Vec<ExtractorEvent>) -> bool {
        let State::Inside { name, content, emitted } = &mut self.state else {
            return false;
        };
        let close = name.close_tag();

        if let Some(at) = self.buffer.find(close) {
            content.push_str(&self.buffer[..at]);
            let full = content.clone();
            if full.len() > *emitted {
                events.push(ExtractorEvent::PatternContent {
                    name: *name,
                    chunk: full[*emitted..].to_string(),
                });
            }
            events.push(ExtractorEvent::PatternEnd {
                name: *name,
                content: full.clone(),
            });
            self.completed.push((*name, full));
            self.buffer.drain(..at + close.len());
            self.state = State::Outside;
            return true;
        }

        // Hold back up to len(close)-1 trailing characters that could be
        // the start of the close tag.
        let holdback = partial_suffix_len(&self.buffer, close);
        let safe = self.buffer.len() - holdback;
        if safe > 0 {
            let chunk: String = self.buffer.drain(..safe).collect();
            content.push_str(&chunk);
            *emitted = content.len();
            events.push(ExtractorEvent::PatternContent { name: *name, chunk });
        }
        false
    }
}

/// Length of the longest suffix of `buffer` that is a strict prefix of
/// `tag`.
fn partial_suffix_len(buffer: &str, tag: &str) -> usize {
    let max = (tag.len() - 1).min(buffer.len());
    for len in (1..=max).rev() {
        if buffer.is_char_boundary(buffer.len() - len) && tag.starts_with(&buffer[buffer.len() - len..]) {
            return len;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(extractor: &mut StreamingPatternExtractor, chunks: &[&str]) -> Vec<ExtractorEvent> {
        chunks
            .iter()
            .flat_map(|c| extractor.feed_chunk(c))
            .collect()
    }

    #[test]
    fn extracts_message_block_across_chunks() {
        let mut extractor = StreamingPatternExtractor::new();
        let events = feed_all(
            &mut extractor,
            &["<MESS", "AGE>hel", "lo world</MES", "SAGE>"],
        );

        assert!(matches!(
            events.first(),
            Some(ExtractorEvent::PatternStart { name: PatternName::Message })
        ));
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                ExtractorEvent::PatternContent { chunk, .. } => Some(chunk.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "hello world");
        assert!(matches!(
            events.last(),
            Some(ExtractorEvent::PatternEnd { content, .. }) if content == "hello world"
        ));
    }

    #[test]
    fn never_emits_partial_close_tag() {
        let mut extractor = StreamingPatternExtractor::new();
        let events = extractor.feed_chunk("<MESSAGE>almost done</MES");
        for event in &events {
            if let ExtractorEvent::PatternContent { chunk, .. } = event {
                assert!(
                    !chunk.contains('<'),
                    "partial close tag leaked into content: {chunk:?}"
                );
            }
        }
        // The held-back suffix arrives once it turns out not to be a tag
        let events = extractor.feed_chunk("SING still going");
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                ExtractorEvent::PatternContent { chunk, .. } => Some(chunk.as_str()),
                _ => None,
            })
            .collect();
        assert!(text.contains("</MESSING"));
    }

    #[test]
    fn tool_call_follows_message() {
        let mut extractor = StreamingPatternExtractor::new();
        let events = extractor
            .feed_chunk("<MESSAGE>hi</MESSAGE><TOOL_CALL><TOOL>file.write</TOOL></TOOL_CALL>");
        let starts: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ExtractorEvent::PatternStart { name } => Some(*name),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec![PatternName::Message, PatternName::ToolCall]);
    }

    #[test]
    fn unterminated_block_reports_malformed() {
        let mut extractor = StreamingPatternExtractor::new();
        extractor.feed_chunk("<TOOL_CALL><TOOL>file.write</TOOL>");
        let (completed, malformed) = extractor.finalize();
        assert!(completed.is_empty());
        assert!(malformed.contains_key("tool_call"));
    }
}
