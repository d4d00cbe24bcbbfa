use std::fmt;

use anyhow::{Result, bail};
use http::StatusCode;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::yaml::{DocumentWriter, ScalarStyle};

/// Ordered header entries. Names keep the casing they arrived with and repeated names are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    entries: Vec<(String, String)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`, compared case-sensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn contains_ignore_case(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|(entry, _)| entry.eq_ignore_ascii_case(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N, V> FromIterator<(N, V)> for HeaderList
where
    N: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }
}

impl Serialize for HeaderList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for HeaderList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeaderListVisitor;

        impl<'de> Visitor<'de> for HeaderListVisitor {
            type Value = HeaderList;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of header names to string values")
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<HeaderList, E> {
                Ok(HeaderList::new())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<HeaderList, A::Error> {
                let mut headers = HeaderList::new();
                while let Some((name, value)) = access.next_entry::<String, String>()? {
                    headers.push(name, value);
                }
                Ok(headers)
            }
        }

        deserializer.deserialize_any(HeaderListVisitor)
    }
}

/// One recorded upstream exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub code: u16,
    pub body: String,
    #[serde(default)]
    pub headers: HeaderList,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
}

impl ExchangeRecord {
    /// Status to replay. Records loaded through [`ExchangeRecord::from_yaml`] always carry a
    /// valid code.
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Renders the record as a YAML document. `body_style` applies to both bodies.
    pub fn to_yaml(&self, body_style: ScalarStyle) -> Result<String, serde_yaml::Error> {
        let mut writer = DocumentWriter::new();
        writer.field("code", &self.code)?;
        writer.text_field("body", &self.body, body_style)?;
        writer.field("headers", &self.headers)?;
        if let Some(request_body) = &self.request_body {
            writer.text_field("request_body", request_body, body_style)?;
        }
        Ok(writer.finish())
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let record: ExchangeRecord = serde_yaml::from_str(text)?;
        if StatusCode::from_u16(record.code).is_err() {
            bail!("invalid status code {}", record.code);
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ExchangeRecord {
        ExchangeRecord {
            code: 200,
            body: "<html>\n  <p>hi</p>\n</html>\n".to_string(),
            headers: [("Content-Type", "text/html"), ("Server", "nginx")]
                .into_iter()
                .collect(),
            request_body: None,
        }
    }

    #[test]
    fn renders_bodies_as_literal_blocks() {
        let mut record = sample();
        record.request_body = Some("x=1".to_string());
        let yaml = record.to_yaml(ScalarStyle::Literal).unwrap();
        assert_eq!(
            yaml,
            "code: 200\n\
             body: |\n  <html>\n    <p>hi</p>\n  </html>\n\
             headers:\n  Content-Type: text/html\n  Server: nginx\n\
             request_body: |-\n  x=1\n"
        );
    }

    #[test]
    fn round_trips_through_yaml() {
        let mut record = sample();
        record.request_body = Some("{\"a\": [1, 2]}\n".to_string());
        for style in [ScalarStyle::Literal, ScalarStyle::Plain] {
            let yaml = record.to_yaml(style).unwrap();
            assert_eq!(ExchangeRecord::from_yaml(&yaml).unwrap(), record);
        }
    }

    #[test]
    fn request_body_is_omitted_when_absent() {
        let yaml = sample().to_yaml(ScalarStyle::Literal).unwrap();
        assert!(!yaml.contains("request_body"));
    }

    #[test]
    fn header_order_and_casing_survive() {
        let record = ExchangeRecord {
            code: 302,
            body: String::new(),
            headers: [("location", "/b"), ("Server", "x"), ("Content-Type", "text/plain")]
                .into_iter()
                .collect(),
            request_body: None,
        };
        let parsed =
            ExchangeRecord::from_yaml(&record.to_yaml(ScalarStyle::Literal).unwrap()).unwrap();
        let names: Vec<&str> = parsed.headers.iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["location", "Server", "Content-Type"]);
        assert_eq!(parsed.headers.get("Server"), Some("x"));
        assert_eq!(parsed.headers.get("server"), None);
    }

    #[test]
    fn reads_documents_from_other_emitters() {
        let yaml = "body: |\n  hello\nheaders:\n  Content-Type: text/plain\ncode: 200\n";
        let record = ExchangeRecord::from_yaml(yaml).unwrap();
        assert_eq!(record.code, 200);
        assert_eq!(record.body, "hello\n");
        assert_eq!(record.headers.get("Content-Type"), Some("text/plain"));
        assert_eq!(record.request_body, None);

        let empty_headers = "code: 204\nbody: ''\nheaders: {}\n";
        let record = ExchangeRecord::from_yaml(empty_headers).unwrap();
        assert!(record.headers.is_empty());
    }

    #[test]
    fn rejects_wrong_shapes() {
        assert!(ExchangeRecord::from_yaml("body: hello\n").is_err());
        assert!(ExchangeRecord::from_yaml("code: ok\nbody: hello\n").is_err());
        assert!(ExchangeRecord::from_yaml("code: 200\nbody: hi\nheaders: [a, b]\n").is_err());
        assert!(ExchangeRecord::from_yaml("- just\n- a list\n").is_err());
        let err = ExchangeRecord::from_yaml("code: 42\nbody: hi\n").unwrap_err();
        assert!(err.to_string().contains("invalid status code 42"));
    }
}
