//! XML tool-call scanning (spec §4.4 "XML tool-call mode"), off by default.
//!
//! Scans a continuous concatenation of emitted text for well-formed
//! `<tool name="…"><arg name="…">…</arg>…</tool>` regions, synthesizing tool
//! calls from them and suppressing the matched regions from the emitted
//! text. Only complete tags are converted; a tag split across a chunk
//! boundary is held back as unflushed buffer until it closes (spec §9).

use std::sync::OnceLock;

use regex::Regex;

use crate::message::ToolCall;

#[derive(Debug, Clone, Copy)]
pub struct XmlScannerConfig {
    pub max_tool_calls: usize,
}

fn tool_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<tool\s+name="([^"]*)">(.*?)</tool>"#).expect("valid regex")
    })
}

fn arg_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?s)<arg\s+name="([^"]*)">(.*?)</arg>"#).expect("valid regex"))
}

pub(super) struct XmlScanner {
    config: XmlScannerConfig,
    buffer: String,
    synthesized_count: usize,
}

impl XmlScanner {
    pub fn new(config: XmlScannerConfig) -> Self {
        Self {
            config,
            buffer: String::new(),
            synthesized_count: 0,
        }
    }

    /// Feed more text; returns `(non_suppressed_text, synthesized_calls)`.
    /// Concatenating every call's returned text is a faithful rendering of
    /// the non-suppressed text (spec §4.4).
    pub fn scan(&mut self, new_text: &str) -> (String, Vec<ToolCall>) {
        self.buffer.push_str(new_text);
        let mut result = String::new();
        let mut synthesized = Vec::new();

        loop {
            if self.synthesized_count >= self.config.max_tool_calls {
                result.push_str(&self.buffer);
                self.buffer.clear();
                break;
            }

            match tool_block_re().find(&self.buffer) {
                Some(m) => {
                    result.push_str(&self.buffer[..m.start()]);
                    let block = self.buffer[m.start()..m.end()].to_string();
                    if let Some(call) = parse_tool_block(&block, self.synthesized_count) {
                        synthesized.push(call);
                        self.synthesized_count += 1;
                    } else {
                        // Malformed despite matching the outer shape: keep it
                        // visible rather than silently eating it.
                        result.push_str(&block);
                    }
                    self.buffer = self.buffer[m.end()..].to_string();
                }
                None => {
                    if let Some(partial_start) = self.buffer.find("<tool") {
                        result.push_str(&self.buffer[..partial_start]);
                        self.buffer = self.buffer[partial_start..].to_string();
                    } else {
                        result.push_str(&self.buffer);
                        self.buffer.clear();
                    }
                    break;
                }
            }
        }

        (result, synthesized)
    }
}

fn parse_tool_block(block: &str, index: usize) -> Option<ToolCall> {
    let caps = tool_block_re().captures(block)?;
    let name = caps.get(1)?.as_str().to_string();
    let inner = caps.get(2)?.as_str();

    let mut args = serde_json::Map::new();
    for arg_caps in arg_re().captures_iter(inner) {
        let arg_name = arg_caps.get(1)?.as_str().to_string();
        let arg_value = arg_caps.get(2)?.as_str().to_string();
        args.insert(arg_name, serde_json::Value::String(arg_value));
    }

    let arguments = serde_json::to_string(&serde_json::Value::Object(args)).ok()?;
    Some(ToolCall::new(format!("xml_call_{index}"), name, arguments))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_tag_in_one_chunk_is_converted() {
        let mut scanner = XmlScanner::new(XmlScannerConfig { max_tool_calls: 5 });
        let (text, calls) = scanner.scan(
            r#"before <tool name="add"><arg name="a">2</arg><arg name="b">3</arg></tool> after"#,
        );
        assert_eq!(text, "before  after");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "add");
        let parsed: serde_json::Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        assert_eq!(parsed["a"], "2");
        assert_eq!(parsed["b"], "3");
    }

    #[test]
    fn tag_split_across_chunks_is_held_back_until_closed() {
        let mut scanner = XmlScanner::new(XmlScannerConfig { max_tool_calls: 5 });
        let (text1, calls1) = scanner.scan(r#"hello <tool name="add"><arg name="a">"#);
        assert_eq!(text1, "hello ");
        assert!(calls1.is_empty());
        let (text2, calls2) = scanner.scan("2</arg></tool> world");
        assert_eq!(text2, " world");
        assert_eq!(calls2.len(), 1);
    }

    #[test]
    fn respects_max_tool_calls_limit() {
        let mut scanner = XmlScanner::new(XmlScannerConfig { max_tool_calls: 1 });
        let input = r#"<tool name="a"></tool><tool name="b"></tool>"#;
        let (_text, calls) = scanner.scan(input);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "a");
    }

    #[test]
    fn plain_text_with_no_tags_passes_through_unchanged() {
        let mut scanner = XmlScanner::new(XmlScannerConfig { max_tool_calls: 5 });
        let (text, calls) = scanner.scan("just plain text, nothing to see");
        assert_eq!(text, "just plain text, nothing to see");
        assert!(calls.is_empty());
    }
}
