//! Best-effort parsing of truncated JSON.
//!
//! Tool-call arguments stream in as arbitrary fragments. For live previews we
//! want whatever structure is already there: `{"path": "src/ma` should read as
//! `{"path": "src/ma"}`. The parser closes the open string and containers and,
//! when the tail is not salvageable (a dangling key, a half-written literal),
//! cuts back to the last structural boundary.

use serde_json::Value;

/// Parse `input` as JSON, completing whatever is still open.
///
/// Never fails: returns `None` when no prefix of the input forms a value.
pub fn parse_partial(input: &str) -> Option<Value> {
    if input.trim().is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str(input) {
        return Some(value);
    }

    let scan = Scan::run(input);

    if let Some(value) = try_parse(&scan.completed_tail(input)) {
        return Some(value);
    }

    scan.boundaries
        .iter()
        .rev()
        .find_map(|b| try_parse(&format!("{}{}", &input[..b.offset], b.closers)))
}

fn try_parse(candidate: &str) -> Option<Value> {
    serde_json::from_str(candidate).ok()
}

/// A prefix length at which the text can be cut and closed.
struct Boundary {
    offset: usize,
    closers: String,
}

#[derive(Default)]
struct Scan {
    stack: Vec<char>,
    in_string: bool,
    escaped: bool,
    /// Byte offset of a `\u` escape still missing hex digits, and how many.
    open_unicode: Option<(usize, u8)>,
    boundaries: Vec<Boundary>,
}

impl Scan {
    fn run(input: &str) -> Self {
        let mut scan = Scan::default();
        for (i, c) in input.char_indices() {
            if scan.in_string {
                scan.string_char(i, c);
                continue;
            }
            match c {
                '"' => scan.in_string = true,
                '{' | '[' => {
                    scan.stack.push(c);
                    scan.mark(i + 1);
                }
                '}' | ']' => {
                    scan.stack.pop();
                }
                ',' => scan.mark(i),
                _ => {}
            }
        }
        scan
    }

    fn string_char(&mut self, i: usize, c: char) {
        if let Some((start, remaining)) = self.open_unicode {
            self.open_unicode = match (c.is_ascii_hexdigit(), remaining) {
                (true, 1) | (false, _) => None,
                (true, n) => Some((start, n - 1)),
            };
            return;
        }
        if self.escaped {
            self.escaped = false;
            if c == 'u' {
                // the backslash sits one byte before the 'u'
                self.open_unicode = Some((i - 1, 4));
            }
            return;
        }
        match c {
            '\\' => self.escaped = true,
            '"' => self.in_string = false,
            _ => {}
        }
    }

    fn mark(&mut self, offset: usize) {
        self.boundaries.push(Boundary {
            offset,
            closers: self.closers(),
        });
    }

    fn closers(&self) -> String {
        self.stack
            .iter()
            .rev()
            .map(|open| if *open == '{' { '}' } else { ']' })
            .collect()
    }

    /// The whole input with the open string terminated and containers closed.
    fn completed_tail(&self, input: &str) -> String {
        let mut text = input.to_string();
        if self.in_string {
            if let Some((start, _)) = self.open_unicode {
                text.truncate(start);
            } else if self.escaped {
                text.pop();
            }
            text.push('"');
        }
        text.push_str(&self.closers());
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn complete_input_parses_directly() {
        assert_eq!(parse_partial(r#"{"q":"x"}"#), Some(json!({"q": "x"})));
    }

    #[test]
    fn nothing_to_show_yet() {
        assert_eq!(parse_partial(""), None);
        assert_eq!(parse_partial("   "), None);
        assert_eq!(parse_partial("tr"), None);
    }

    #[test]
    fn open_object_yields_empty_object() {
        assert_eq!(parse_partial("{"), Some(json!({})));
        assert_eq!(parse_partial(r#"{"q":"#), Some(json!({})));
        assert_eq!(parse_partial(r#"{"qu"#), Some(json!({})));
    }

    #[test]
    fn open_string_value_is_closed() {
        assert_eq!(
            parse_partial(r#"{"path": "src/ma"#),
            Some(json!({"path": "src/ma"}))
        );
    }

    #[test]
    fn dangling_key_falls_back_to_previous_entry() {
        assert_eq!(
            parse_partial(r#"{"a":"x","b"#),
            Some(json!({"a": "x"}))
        );
        assert_eq!(
            parse_partial(r#"{"a":1,"b":tru"#),
            Some(json!({"a": 1}))
        );
    }

    #[test]
    fn nested_containers_are_closed_in_order() {
        assert_eq!(
            parse_partial(r#"{"items":[{"id":1},{"id":2"#),
            Some(json!({"items": [{"id": 1}, {"id": 2}]}))
        );
        assert_eq!(
            parse_partial(r#"{"a":{"b":[1,2"#),
            Some(json!({"a": {"b": [1, 2]}}))
        );
    }

    #[test]
    fn closed_inner_container_does_not_leak_closers() {
        assert_eq!(
            parse_partial(r#"{"a":[1],"b":{"c":"d"#),
            Some(json!({"a": [1], "b": {"c": "d"}}))
        );
    }

    #[test]
    fn trailing_escape_is_dropped() {
        assert_eq!(
            parse_partial(r#"{"s":"line\"#),
            Some(json!({"s": "line"}))
        );
        assert_eq!(
            parse_partial(r#"{"s":"caf\u00"#),
            Some(json!({"s": "caf"}))
        );
    }

    #[test]
    fn escaped_quote_does_not_end_string() {
        assert_eq!(
            parse_partial(r#"{"s":"say \"hi"#),
            Some(json!({"s": "say \"hi"}))
        );
    }

    #[test]
    fn braces_inside_strings_are_ignored() {
        assert_eq!(
            parse_partial(r#"{"code":"fn main() { let v = [1"#),
            Some(json!({"code": "fn main() { let v = [1"}))
        );
    }

    #[test]
    fn every_prefix_is_handled_without_panicking() {
        let full = r#"{"path":"a/b.rs","edits":[{"line":3,"text":"x \"y\" é"},{"line":4}],"ok":true}"#;
        for end in 0..=full.len() {
            if full.is_char_boundary(end) {
                let _ = parse_partial(&full[..end]);
            }
        }
        assert_eq!(
            parse_partial(full),
            Some(serde_json::from_str(full).unwrap())
        );
    }
}
