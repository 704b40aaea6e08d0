use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

use mzid_mirror::{LibXml2Wrapper, ValidationResult};

const SIMPLE_XSD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
    <xs:element name="root">
        <xs:complexType>
            <xs:sequence>
                <xs:element name="item" type="xs:integer" maxOccurs="unbounded"/>
            </xs:sequence>
        </xs:complexType>
    </xs:element>
</xs:schema>"#;

const VALID_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<root><item>1</item><item>2</item></root>"#;

fn temp_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

/// `count` items that are not integers
fn invalid_xml(count: usize) -> String {
    let items: String = (0..count).map(|i| format!("<item>x{}</item>\n", i)).collect();
    format!("<?xml version=\"1.0\"?>\n<root>\n{}</root>", items)
}

#[test]
fn test_validation_success() {
    let wrapper = LibXml2Wrapper::new();
    let schema_file = temp_file(SIMPLE_XSD);
    let document_file = temp_file(VALID_XML);

    let schema = wrapper.parse_schema_file(schema_file.path()).unwrap();
    let document = wrapper.parse_document(document_file.path()).unwrap();
    let result = wrapper.validate_document(&schema, &document, 20).unwrap();

    assert_eq!(result, ValidationResult::Valid);
    assert!(result.is_valid());
}

#[test]
fn test_validation_failure_caps_reported_errors() {
    let wrapper = LibXml2Wrapper::new();
    let schema_file = temp_file(SIMPLE_XSD);
    let document_file = temp_file(&invalid_xml(30));

    let schema = wrapper.parse_schema_file(schema_file.path()).unwrap();
    let document = wrapper.parse_document(document_file.path()).unwrap();
    let result = wrapper.validate_document(&schema, &document, 20).unwrap();

    assert!(result.is_invalid());
    match result {
        ValidationResult::Invalid { error_count, errors } => {
            assert_eq!(errors.len(), 20);
            assert!(error_count >= 20);
            assert!(errors[0].to_string().starts_with("Error: "));
            assert!(errors[0].line >= 3);
        }
        other => panic!("expected invalid result, got {:?}", other),
    }
}

#[test]
fn test_well_formedness() {
    let wrapper = LibXml2Wrapper::new();
    let good = temp_file(VALID_XML);
    let broken = temp_file("<root><item>1</root>");

    assert_eq!(wrapper.check_well_formed(good.path()).unwrap(), Ok(()));
    let message = wrapper.check_well_formed(broken.path()).unwrap().unwrap_err();
    assert!(message.contains("line"));
}

#[test]
fn test_nonexistent_document() {
    let wrapper = LibXml2Wrapper::new();
    let missing = PathBuf::from("/nonexistent/file.xml");

    assert!(wrapper.parse_document(&missing).is_err());
    assert!(wrapper.parse_schema_file(&missing).is_err());
}

#[test]
fn test_schema_reuse() {
    let wrapper = LibXml2Wrapper::new();
    let schema_file = temp_file(SIMPLE_XSD);
    let schema = wrapper.parse_schema_file(schema_file.path()).unwrap();

    for i in 0..3 {
        let document_file = temp_file(VALID_XML);
        let document = wrapper.parse_document(document_file.path()).unwrap();
        let result = wrapper.validate_document(&schema, &document, 20).unwrap();
        assert!(result.is_valid(), "Validation {} failed", i);
    }
}

#[tokio::test]
async fn test_well_formedness_on_blocking_threads() {
    let files: Vec<NamedTempFile> = (0..5).map(|_| temp_file(VALID_XML)).collect();

    let tasks: Vec<_> = files
        .iter()
        .map(|file| {
            let path = file.path().to_path_buf();
            tokio::task::spawn_blocking(move || LibXml2Wrapper::new().check_well_formed(&path))
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), Ok(()));
    }
}
