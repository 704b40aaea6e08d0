use regex::Regex;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::OnceLock;

/// Namespace URI bound to the `xsi` prefix
pub const SCHEMA_INSTANCE_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";

/// How far into a document the root element may start
const ROOT_SCAN_LIMIT: u64 = 1024 * 1024;

/// Cached regex for `name="value"` / `name='value'` attribute pairs
static ATTRIBUTE_REGEX: OnceLock<Regex> = OnceLock::new();

fn attribute_regex() -> &'static Regex {
    ATTRIBUTE_REGEX.get_or_init(|| {
        Regex::new(r#"([A-Za-z_][\w:.\-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
            .expect("Failed to compile attribute regex")
    })
}

/// The document's first element, with its attributes as written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaLocationError {
    /// Neither `schemaLocation` nor `noNamespaceSchemaLocation` is present
    Missing,
    /// `schemaLocation` is not a list of namespace/location pairs
    InvalidFormat,
}

impl std::fmt::Display for SchemaLocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaLocationError::Missing => write!(f, "No schema location found in the XML document."),
            SchemaLocationError::InvalidFormat => write!(f, "Invalid schema location format."),
        }
    }
}

impl RootElement {
    /// Read only as much of `path` as it takes to reach the root element
    pub fn read_from(path: &Path) -> io::Result<Option<RootElement>> {
        let mut prefix = Vec::new();
        File::open(path)?
            .take(ROOT_SCAN_LIMIT)
            .read_to_end(&mut prefix)?;
        Ok(Self::parse(&String::from_utf8_lossy(&prefix)))
    }

    pub fn parse(text: &str) -> Option<RootElement> {
        let tag = find_root_tag(text)?;
        let name_end = tag
            .find(|c: char| c.is_whitespace() || c == '/')
            .unwrap_or(tag.len());
        let name = &tag[..name_end];
        if name.is_empty() {
            return None;
        }

        let attributes = attribute_regex()
            .captures_iter(&tag[name_end..])
            .filter_map(|caps| {
                let key = caps.get(1)?.as_str().to_string();
                let value = caps.get(2).or_else(|| caps.get(3))?.as_str().to_string();
                Some((key, value))
            })
            .collect();

        Some(RootElement {
            name: name.to_string(),
            attributes,
        })
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Attribute `local` in the schema-instance namespace, whatever prefix the
    /// document binds to it
    pub fn schema_instance_attribute(&self, local: &str) -> Option<&str> {
        let prefix = self
            .attributes
            .iter()
            .find(|(key, value)| key.starts_with("xmlns:") && value == SCHEMA_INSTANCE_NS)
            .map(|(key, _)| &key["xmlns:".len()..])
            .unwrap_or("xsi");
        self.attribute(&format!("{}:{}", prefix, local))
    }

    /// The location of the governing schema.
    ///
    /// `schemaLocation` holds namespace/location pairs and the last location
    /// wins; `noNamespaceSchemaLocation` is a single location.
    pub fn schema_location(&self) -> Result<String, SchemaLocationError> {
        if let Some(value) = self
            .schema_instance_attribute("schemaLocation")
            .filter(|value| !value.trim().is_empty())
        {
            let parts: Vec<&str> = value.split_whitespace().collect();
            if parts.len() % 2 != 0 {
                return Err(SchemaLocationError::InvalidFormat);
            }
            return parts
                .last()
                .map(|location| location.to_string())
                .ok_or(SchemaLocationError::InvalidFormat);
        }

        self.schema_instance_attribute("noNamespaceSchemaLocation")
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or(SchemaLocationError::Missing)
    }

    /// Version declared by the schema file name, else the `version` attribute
    pub fn declared_version(&self, schema_name: &str) -> Option<String> {
        self.schema_location()
            .ok()
            .and_then(|location| {
                version_from_schema_file(schema_file_name(&location), schema_name)
                    .map(str::to_string)
            })
            .or_else(|| {
                self.attribute("version")
                    .filter(|version| !version.is_empty())
                    .map(str::to_string)
            })
    }
}

/// Last `/`-separated segment of a schema location
pub fn schema_file_name(location: &str) -> &str {
    location.rsplit('/').next().unwrap_or(location)
}

/// `1.2.0` from `mzIdentML1.2.0.xsd` when `schema_name` is `mzIdentML`
pub fn version_from_schema_file<'a>(file_name: &'a str, schema_name: &str) -> Option<&'a str> {
    file_name
        .strip_prefix(schema_name)?
        .strip_suffix(".xsd")
        .filter(|version| !version.is_empty())
}

/// Body of the first start tag, between `<` and `>`, skipping the prolog
fn find_root_tag(text: &str) -> Option<&str> {
    let mut rest = text.trim_start_matches('\u{feff}');

    loop {
        rest = &rest[rest.find('<')?..];

        if rest.starts_with("<?") {
            rest = &rest[rest.find("?>")? + 2..];
        } else if rest.starts_with("<!--") {
            rest = &rest[rest.find("-->")? + 3..];
        } else if rest.starts_with("<!") {
            rest = &rest[declaration_end(rest)? + 1..];
        } else {
            let end = tag_end(rest)?;
            return Some(rest[1..end].trim_end_matches('/'));
        }
    }
}

/// Index of the `>` closing a `<!DOCTYPE ...>` including any internal subset
fn declaration_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (index, c) in text.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            '>' if depth == 0 => return Some(index),
            _ => {}
        }
    }
    None
}

/// Index of the `>` closing a start tag, ignoring any inside quoted values
fn tag_end(text: &str) -> Option<usize> {
    let mut quote = None;
    for (index, c) in text.char_indices() {
        match (c, quote) {
            ('"' | '\'', None) => quote = Some(c),
            (c, Some(open)) if c == open => quote = None,
            ('>', None) => return Some(index),
            _ => {}
        }
    }
    None
}
