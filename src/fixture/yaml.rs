use std::collections::BTreeMap;

use serde::Serialize;

const BLOCK_INDENT: &str = "  ";

/// How a text field is rendered on the write path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScalarStyle {
    /// Whatever the YAML serializer picks.
    #[default]
    Plain,
    /// A `|` block scalar holding the text verbatim, when the text allows it.
    Literal,
}

/// Builds a top-level YAML mapping one field at a time, so field order is fixed by the caller
/// and individual text fields can be rendered as block scalars.
#[derive(Debug, Default)]
pub struct DocumentWriter {
    out: String,
}

impl DocumentWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field<T>(&mut self, name: &str, value: &T) -> Result<(), serde_yaml::Error>
    where
        T: Serialize + ?Sized,
    {
        let mut entry = BTreeMap::new();
        entry.insert(name, value);
        self.out.push_str(&serde_yaml::to_string(&entry)?);
        Ok(())
    }

    pub fn text_field(
        &mut self,
        name: &str,
        value: &str,
        style: ScalarStyle,
    ) -> Result<(), serde_yaml::Error> {
        match style {
            ScalarStyle::Literal if literal_allowed(value) => {
                self.push_literal(name, value);
                Ok(())
            }
            _ => self.field(name, value),
        }
    }

    pub fn finish(self) -> String {
        self.out
    }

    fn push_literal(&mut self, name: &str, value: &str) {
        let content = value.trim_end_matches('\n');
        let trailing_breaks = value.len() - content.len();
        let chomp = match trailing_breaks {
            0 => "-",
            1 => "",
            _ => "+",
        };
        let first_line = content
            .split('\n')
            .find(|line| !line.is_empty())
            .unwrap_or_default();
        let indicator = if first_line.starts_with([' ', '\t']) {
            "2"
        } else {
            ""
        };

        self.out.push_str(name);
        self.out.push_str(": |");
        self.out.push_str(indicator);
        self.out.push_str(chomp);
        self.out.push('\n');
        for line in content.split('\n') {
            if !line.is_empty() {
                self.out.push_str(BLOCK_INDENT);
                self.out.push_str(line);
            }
            self.out.push('\n');
        }
        for _ in 1..trailing_breaks {
            self.out.push('\n');
        }
    }
}

/// Block scalars cannot carry text without a content line, carriage returns, characters YAML
/// refuses to print, or spaces before a line break (emitters disagree on those).
fn literal_allowed(value: &str) -> bool {
    if value.trim_end_matches('\n').is_empty() {
        return false;
    }
    if value.trim_end_matches('\n').ends_with(' ') || value.contains(" \n") {
        return false;
    }
    value.chars().all(printable_in_block)
}

fn printable_in_block(c: char) -> bool {
    match c {
        '\t' | '\n' => true,
        '\u{20}'..='\u{7e}' => true,
        '\u{a0}'..='\u{d7ff}' => !matches!(c, '\u{2028}' | '\u{2029}'),
        '\u{e000}'..='\u{fffd}' => c != '\u{feff}',
        '\u{10000}'..='\u{10ffff}' => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(value: &str) -> String {
        let mut writer = DocumentWriter::new();
        writer
            .text_field("v", value, ScalarStyle::Literal)
            .expect("render");
        writer.finish()
    }

    fn parse(document: &str) -> String {
        let mut map: BTreeMap<String, String> =
            serde_yaml::from_str(document).expect("document parses");
        map.remove("v").expect("field present")
    }

    #[test]
    fn chomping_follows_trailing_line_breaks() {
        assert_eq!(render("one\ntwo"), "v: |-\n  one\n  two\n");
        assert_eq!(render("one\ntwo\n"), "v: |\n  one\n  two\n");
        assert_eq!(render("one\n\n\n"), "v: |+\n  one\n\n\n");
    }

    #[test]
    fn empty_lines_are_not_indented() {
        assert_eq!(render("a\n\nb\n"), "v: |\n  a\n\n  b\n");
    }

    #[test]
    fn leading_whitespace_gets_an_indentation_indicator() {
        assert_eq!(render("  nested\nflat\n"), "v: |2\n    nested\n  flat\n");
        assert_eq!(render("\n\n  x"), "v: |2-\n\n\n    x\n");
    }

    #[test]
    fn literal_blocks_parse_back_verbatim() {
        let values = [
            "plain",
            "a\n",
            "a\n\n\n",
            "\nleading break\n",
            "  indented first\nnext\n",
            "\tTabbed\n",
            "<html>\n  <body>\n    <p>x</p>\n  </body>\n</html>\n",
            "{\"key\": [1, 2, \"three\"]}",
            "key: value\n- item\n# not a comment\n",
            "---\n...\n",
            "unicode ünïcödé 日本語 🎉\n",
            "'quoted' \"double\" |pipe >fold &anchor *alias !tag %dir @at `tick`",
        ];
        for value in values {
            let document = render(value);
            assert!(document.starts_with("v: |"), "{value:?} rendered as {document:?}");
            assert_eq!(parse(&document), value, "document {document:?}");
        }
    }

    #[test]
    fn unsuitable_text_falls_back_to_serializer() {
        let values = [
            "",
            "crlf\r\nline\r\n",
            "bell\u{7}",
            "trailing space \nnext",
            "ends with space ",
            "line\u{2028}separator",
            "\u{feff}bom",
        ];
        for value in values {
            let document = render(value);
            assert!(!document.starts_with("v: |"), "{value:?} rendered as {document:?}");
            assert_eq!(parse(&document), value, "document {document:?}");
        }
    }

    #[test]
    fn plain_style_defers_to_serializer() {
        let mut writer = DocumentWriter::new();
        writer
            .text_field("v", "hello", ScalarStyle::Plain)
            .unwrap();
        assert_eq!(writer.finish(), "v: hello\n");
    }

    #[test]
    fn fields_keep_insertion_order() {
        let mut writer = DocumentWriter::new();
        writer.field("zeta", &1u16).unwrap();
        writer.text_field("alpha", "x\n", ScalarStyle::Literal).unwrap();
        writer.field("mid", &BTreeMap::from([("k", "v")])).unwrap();
        assert_eq!(writer.finish(), "zeta: 1\nalpha: |\n  x\nmid:\n  k: v\n");
    }
}
