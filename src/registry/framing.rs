//! Splits a byte stream of concatenated (newline-delimited or bare) JSON
//! objects into individual top-level object strings, tracking brace depth
//! and string/escape state so braces inside quoted values don't confuse the
//! split. Emits one notification per top-level JSON object; partial
//! fragments are buffered until they complete.

#[derive(Debug, Default)]
pub struct JsonFrameSplitter {
    buffer: String,
    depth: i32,
    in_string: bool,
    escape_next: bool,
    frame_start: Option<usize>,
    /// How many chars of `buffer` (from the start) have already been run
    /// through the scanner and folded into `depth`/`in_string`/
    /// `escape_next`. A `push` only scans chars at or past this index —
    /// re-scanning the retained prefix would double-apply state that's
    /// already accounted for.
    scanned: usize,
}

impl JsonFrameSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds more bytes in, returning any complete top-level JSON object
    /// strings found so far.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut completed = Vec::new();

        let bytes: Vec<char> = self.buffer.chars().collect();
        let mut consumed_up_to = 0usize;

        for i in self.scanned..bytes.len() {
            let c = bytes[i];
            if self.escape_next {
                self.escape_next = false;
                continue;
            }
            if self.in_string {
                match c {
                    '\\' => self.escape_next = true,
                    '"' => self.in_string = false,
                    _ => {}
                }
                continue;
            }
            match c {
                '"' => self.in_string = true,
                '{' => {
                    if self.depth == 0 {
                        self.frame_start = Some(i);
                    }
                    self.depth += 1;
                }
                '}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        if let Some(start) = self.frame_start.take() {
                            let frame: String = bytes[start..=i].iter().collect();
                            completed.push(frame);
                            consumed_up_to = i + 1;
                        }
                    }
                }
                _ => {}
            }
        }

        if consumed_up_to > 0 {
            self.buffer = bytes[consumed_up_to..].iter().collect();
            self.scanned = bytes.len() - consumed_up_to;
            if let Some(start) = self.frame_start {
                self.frame_start = Some(start - consumed_up_to);
            }
        } else {
            self.scanned = bytes.len();
        }

        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_consecutive_objects() {
        let mut splitter = JsonFrameSplitter::new();
        let out = splitter.push(r#"{"a":1}{"b":2}"#);
        assert_eq!(out, vec![r#"{"a":1}"#, r#"{"b":2}"#]);
    }

    #[test]
    fn buffers_partial_fragments_across_calls() {
        let mut splitter = JsonFrameSplitter::new();
        let out1 = splitter.push(r#"{"a":"hel"#);
        assert!(out1.is_empty());
        let out2 = splitter.push(r#"lo"}"#);
        assert_eq!(out2, vec![r#"{"a":"hello"}"#]);
    }

    #[test]
    fn ignores_braces_inside_strings() {
        let mut splitter = JsonFrameSplitter::new();
        let out = splitter.push(r#"{"value":"{not a frame}"}"#);
        assert_eq!(out, vec![r#"{"value":"{not a frame}"}"#]);
    }

    #[test]
    fn handles_escaped_quotes() {
        let mut splitter = JsonFrameSplitter::new();
        let out = splitter.push(r#"{"value":"a\"b"}"#);
        assert_eq!(out, vec![r#"{"value":"a\"b"}"#]);
    }

    #[test]
    fn newline_delimited_also_works() {
        let mut splitter = JsonFrameSplitter::new();
        let out = splitter.push("{\"a\":1}\n{\"b\":2}\n");
        assert_eq!(out, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn does_not_rescan_retained_prefix_across_many_partial_pushes() {
        // A string value split across three separate pushes must not
        // re-process already-scanned chars with carried-over state.
        let mut splitter = JsonFrameSplitter::new();
        assert!(splitter.push(r#"{"a":"#).is_empty());
        assert!(splitter.push(r#""hel"#).is_empty());
        let out = splitter.push(r#"lo"}"#);
        assert_eq!(out, vec![r#"{"a":"hello"}"#]);
    }

    #[test]
    fn trailing_partial_frame_after_a_completed_one_is_retained_correctly() {
        // One push completes a frame and leaves a partial tail; a later push
        // must complete that tail using the correctly offset `frame_start`.
        let mut splitter = JsonFrameSplitter::new();
        let out1 = splitter.push(r#"{"a":1}{"b":"#);
        assert_eq!(out1, vec![r#"{"a":1}"#]);
        let out2 = splitter.push(r#"2}"#);
        assert_eq!(out2, vec![r#"{"b":2}"#]);
    }
}
