//! LibXML2 FFI wrapper.
//!
//! Two entry points are used by the pipeline:
//!
//! - a streaming well-formedness check built on `xmlTextReader`, which holds
//!   only the current node and so stays bounded for multi-gigabyte documents;
//! - full-document schema validation (`xmlReadFile` + `xmlSchemaValidateDoc`),
//!   which needs the whole tree in memory and therefore only ever runs inside
//!   the isolated validation worker.
//!
//! libxml2 keeps allocator state across documents within one process, which is
//! why schema validation never runs in the long-lived pipeline process.

use std::ffi::{CStr, CString};
use std::fmt;
use std::path::Path;
use std::sync::Once;

use libc::{c_char, c_int, c_void};

use crate::error::{LibXml2Error, LibXml2Result};

/// Global initialization flag for libxml2
///
/// libxml2's initialization functions are NOT thread-safe, so they run exactly
/// once behind `std::sync::Once`.
static LIBXML2_INIT: Once = Once::new();

/// Relax hardcoded limits on node depth and text size
const XML_PARSE_HUGE: c_int = 1 << 19;
/// Never fetch external resources over the network
const XML_PARSE_NONET: c_int = 1 << 11;

const PARSE_OPTIONS: c_int = XML_PARSE_HUGE | XML_PARSE_NONET;

/// `XML_ERR_ERROR`; warnings sit below it
const XML_ERR_ERROR: c_int = 2;

// Opaque libxml2 structures
#[repr(C)]
pub struct XmlSchema {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlSchemaParserCtxt {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlSchemaValidCtxt {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlDoc {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlTextReader {
    _private: [u8; 0],
}

#[repr(C)]
pub struct xmlError {
    pub domain: c_int,
    pub code: c_int,
    pub message: *const c_char,
    pub level: c_int,
    pub file: *const c_char,
    pub line: c_int,
    pub str1: *const c_char,
    pub str2: *const c_char,
    pub str3: *const c_char,
    pub int1: c_int,
    pub int2: c_int,
    pub ctxt: *mut c_void,
    pub node: *mut c_void,
}

pub type XmlStructuredErrorFunc =
    Option<unsafe extern "C" fn(user_data: *mut c_void, error: *mut xmlError)>;

// External libxml2 FFI declarations
#[cfg_attr(target_os = "windows", link(name = "libxml2"))]
#[cfg_attr(not(target_os = "windows"), link(name = "xml2"))]
unsafe extern "C" {
    pub fn xmlInitParser();
    pub fn xmlInitGlobals();

    pub fn xmlSetStructuredErrorFunc(ctx: *mut c_void, handler: XmlStructuredErrorFunc);

    // Streaming reader
    pub fn xmlReaderForFile(
        filename: *const c_char,
        encoding: *const c_char,
        options: c_int,
    ) -> *mut XmlTextReader;
    pub fn xmlTextReaderRead(reader: *mut XmlTextReader) -> c_int;
    pub fn xmlFreeTextReader(reader: *mut XmlTextReader);
    pub fn xmlTextReaderSetStructuredErrorHandler(
        reader: *mut XmlTextReader,
        handler: XmlStructuredErrorFunc,
        arg: *mut c_void,
    );

    // Whole-document parsing
    pub fn xmlReadFile(
        filename: *const c_char,
        encoding: *const c_char,
        options: c_int,
    ) -> *mut XmlDoc;
    pub fn xmlFreeDoc(doc: *mut XmlDoc);

    // Schema parsing functions
    pub fn xmlSchemaNewParserCtxt(url: *const c_char) -> *mut XmlSchemaParserCtxt;
    pub fn xmlSchemaSetParserStructuredErrors(
        ctxt: *mut XmlSchemaParserCtxt,
        serror: XmlStructuredErrorFunc,
        ctx: *mut c_void,
    );
    pub fn xmlSchemaParse(ctxt: *mut XmlSchemaParserCtxt) -> *mut XmlSchema;
    pub fn xmlSchemaFreeParserCtxt(ctxt: *mut XmlSchemaParserCtxt);
    pub fn xmlSchemaFree(schema: *mut XmlSchema);

    // Schema validation functions
    pub fn xmlSchemaNewValidCtxt(schema: *mut XmlSchema) -> *mut XmlSchemaValidCtxt;
    pub fn xmlSchemaFreeValidCtxt(ctxt: *mut XmlSchemaValidCtxt);
    pub fn xmlSchemaSetValidStructuredErrors(
        ctxt: *mut XmlSchemaValidCtxt,
        serror: XmlStructuredErrorFunc,
        ctx: *mut c_void,
    );
    pub fn xmlSchemaValidateDoc(ctxt: *mut XmlSchemaValidCtxt, doc: *mut XmlDoc) -> c_int;
}

/// One error reported by libxml2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlIssue {
    pub message: String,
    pub line: i32,
}

impl fmt::Display for XmlIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error: {}, Line: {}", self.message, self.line)
    }
}

/// Receives structured errors; keeps the first `limit`, counts the rest
struct IssueCollector {
    issues: Vec<XmlIssue>,
    limit: usize,
    seen: usize,
}

impl IssueCollector {
    fn new(limit: usize) -> Self {
        Self {
            issues: Vec::new(),
            limit,
            seen: 0,
        }
    }

    fn as_user_data(&mut self) -> *mut c_void {
        self as *mut IssueCollector as *mut c_void
    }

    fn first_message(&self) -> Option<String> {
        self.issues
            .first()
            .map(|issue| format!("{}, line {}", issue.message, issue.line))
    }
}

/// Callback for libxml2 to report errors (structured)
unsafe extern "C" fn collect_issue(user_data: *mut c_void, error: *mut xmlError) {
    if user_data.is_null() || error.is_null() {
        return;
    }
    let collector = unsafe { &mut *(user_data as *mut IssueCollector) };
    let error = unsafe { &*error };
    if error.level < XML_ERR_ERROR {
        return;
    }

    collector.seen += 1;
    if collector.issues.len() >= collector.limit {
        return;
    }

    let message = if error.message.is_null() {
        format!("libxml2 error {}", error.code)
    } else {
        unsafe { CStr::from_ptr(error.message) }
            .to_string_lossy()
            .trim()
            .to_string()
    };
    collector.issues.push(XmlIssue {
        message,
        line: error.line,
    });
}

/// Owned parsed schema, freed on drop
#[derive(Debug)]
pub struct XmlSchemaPtr {
    ptr: *mut XmlSchema,
}

impl Drop for XmlSchemaPtr {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { xmlSchemaFree(self.ptr) };
            self.ptr = std::ptr::null_mut();
        }
    }
}

/// Owned parsed document, freed on drop
#[derive(Debug)]
pub struct XmlDocument {
    ptr: *mut XmlDoc,
}

impl Drop for XmlDocument {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { xmlFreeDoc(self.ptr) };
            self.ptr = std::ptr::null_mut();
        }
    }
}

/// Validation result from libxml2
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    /// Validation succeeded (return code 0)
    Valid,
    /// Validation failed; `errors` holds at most the requested number of issues
    Invalid {
        error_count: usize,
        errors: Vec<XmlIssue>,
    },
    /// Internal error occurred (return code < 0)
    InternalError { code: i32 },
}

impl ValidationResult {
    fn from_code(code: c_int, collector: IssueCollector) -> Self {
        match code {
            0 => ValidationResult::Valid,
            n if n > 0 => ValidationResult::Invalid {
                error_count: collector.seen.max(collector.issues.len()),
                errors: collector.issues,
            },
            n => ValidationResult::InternalError { code: n },
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, ValidationResult::Invalid { .. })
    }
}

fn c_path(path: &Path) -> LibXml2Result<CString> {
    path.to_str()
        .and_then(|s| CString::new(s).ok())
        .ok_or_else(|| LibXml2Error::InvalidPath {
            file: path.to_path_buf(),
        })
}

/// Safe access to the libxml2 operations the pipeline needs
pub struct LibXml2Wrapper {
    _private: (),
}

impl LibXml2Wrapper {
    /// Initializes libxml2 on first use; cheap afterwards
    pub fn new() -> Self {
        LIBXML2_INIT.call_once(|| unsafe {
            xmlInitParser();
            xmlInitGlobals();
        });

        LibXml2Wrapper { _private: () }
    }

    /// Stream through `path` node by node. `Ok(Err(message))` means the
    /// document is not well-formed; `message` carries the first parse error.
    pub fn check_well_formed(&self, path: &Path) -> LibXml2Result<Result<(), String>> {
        let c_path = c_path(path)?;
        let mut collector = IssueCollector::new(1);

        unsafe {
            let reader = xmlReaderForFile(c_path.as_ptr(), std::ptr::null(), PARSE_OPTIONS);
            if reader.is_null() {
                return Err(LibXml2Error::ReaderCreationFailed {
                    file: path.to_path_buf(),
                });
            }
            xmlTextReaderSetStructuredErrorHandler(
                reader,
                Some(collect_issue),
                collector.as_user_data(),
            );

            let mut status = xmlTextReaderRead(reader);
            while status == 1 {
                status = xmlTextReaderRead(reader);
            }
            xmlFreeTextReader(reader);

            if status == 0 && collector.issues.is_empty() {
                Ok(Ok(()))
            } else {
                Ok(Err(collector
                    .first_message()
                    .unwrap_or_else(|| "XML parse error".to_string())))
            }
        }
    }

    /// Parse an XSD from disk; includes and imports resolve relative to it
    pub fn parse_schema_file(&self, schema_path: &Path) -> LibXml2Result<XmlSchemaPtr> {
        let c_path = c_path(schema_path)?;
        let mut collector = IssueCollector::new(1);

        unsafe {
            let parser_ctxt = xmlSchemaNewParserCtxt(c_path.as_ptr());
            if parser_ctxt.is_null() {
                return Err(LibXml2Error::SchemaParseFailed {
                    schema: schema_path.to_path_buf(),
                });
            }
            xmlSchemaSetParserStructuredErrors(
                parser_ctxt,
                Some(collect_issue),
                collector.as_user_data(),
            );

            let schema = xmlSchemaParse(parser_ctxt);
            xmlSchemaFreeParserCtxt(parser_ctxt);

            if schema.is_null() {
                return Err(LibXml2Error::SchemaParseFailed {
                    schema: schema_path.to_path_buf(),
                });
            }
            Ok(XmlSchemaPtr { ptr: schema })
        }
    }

    /// Parse the whole document into memory
    pub fn parse_document(&self, path: &Path) -> LibXml2Result<XmlDocument> {
        let c_path = c_path(path)?;
        let mut collector = IssueCollector::new(1);

        unsafe {
            xmlSetStructuredErrorFunc(collector.as_user_data(), Some(collect_issue));
            let doc = xmlReadFile(c_path.as_ptr(), std::ptr::null(), PARSE_OPTIONS);
            xmlSetStructuredErrorFunc(std::ptr::null_mut(), None);

            if doc.is_null() {
                return Err(LibXml2Error::DocumentParseFailed {
                    file: path.to_path_buf(),
                    message: collector
                        .first_message()
                        .unwrap_or_else(|| "XML parse error".to_string()),
                });
            }
            Ok(XmlDocument { ptr: doc })
        }
    }

    /// Validate a parsed document, keeping at most `max_errors` issues
    pub fn validate_document(
        &self,
        schema: &XmlSchemaPtr,
        document: &XmlDocument,
        max_errors: usize,
    ) -> LibXml2Result<ValidationResult> {
        let mut collector = IssueCollector::new(max_errors);

        unsafe {
            let valid_ctxt = xmlSchemaNewValidCtxt(schema.ptr);
            if valid_ctxt.is_null() {
                return Err(LibXml2Error::ValidationContextCreationFailed);
            }
            xmlSchemaSetValidStructuredErrors(
                valid_ctxt,
                Some(collect_issue),
                collector.as_user_data(),
            );

            let code = xmlSchemaValidateDoc(valid_ctxt, document.ptr);
            xmlSchemaFreeValidCtxt(valid_ctxt);

            Ok(ValidationResult::from_code(code, collector))
        }
    }
}

impl Default for LibXml2Wrapper {
    fn default() -> Self {
        Self::new()
    }
}
