//! Compile/request-line job documents.
//!
//! A request payload is a small XML document whose root element carries the
//! job as attributes:
//!
//! ```text
//! <Compile Version="2.1" JobType="Compile" Profile="ps_5_0" Program="..."
//!          Entry="main" CompileFlags="0x1" Platform="PC" HashStop="1"
//!          ShaderRequest="<1>Illum@Common_ZPass()" Project="Game" .../>
//! ```

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use std::fmt;
use thiserror::Error;

use crate::types::{JobState, JobType, ProtocolVersion};

/// Platform assumed when a request does not name one.
pub const DEFAULT_PLATFORM: &str = "PC";

/// Required attributes whose absence maps to a dedicated error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredAttribute {
    Profile,
    Program,
    Entry,
    CompileFlags,
    ShaderRequest,
}

impl RequiredAttribute {
    pub fn name(self) -> &'static str {
        match self {
            Self::Profile => "Profile",
            Self::Program => "Program",
            Self::Entry => "Entry",
            Self::CompileFlags => "CompileFlags",
            Self::ShaderRequest => "ShaderRequest",
        }
    }

    fn error_state(self) -> JobState {
        match self {
            Self::Profile => JobState::ErrorInvalidProfile,
            Self::Program => JobState::ErrorInvalidProgram,
            Self::Entry => JobState::ErrorInvalidEntry,
            Self::CompileFlags => JobState::ErrorInvalidCompileFlags,
            Self::ShaderRequest => JobState::ErrorInvalidShaderRequestLine,
        }
    }
}

impl fmt::Display for RequiredAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors raised while turning a payload into a [`Request`].
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("malformed request XML: {0}")]
    Xml(String),

    #[error("request document has no root element")]
    MissingRoot,

    #[error("unsupported protocol version '{0}'")]
    UnsupportedVersion(String),

    #[error("unknown job type '{0}'")]
    UnknownJobType(String),

    #[error("missing required attribute '{0}'")]
    MissingAttribute(RequiredAttribute),
}

impl RequestError {
    /// State reported to the client for this failure.
    pub fn state(&self) -> JobState {
        match self {
            Self::MissingAttribute(attr) => attr.error_state(),
            Self::UnknownJobType(_) => JobState::JobNotFound,
            Self::InvalidUtf8 | Self::Xml(_) | Self::MissingRoot | Self::UnsupportedVersion(_) => {
                JobState::Error
            }
        }
    }
}

/// A parsed job request. Immutable once parsed.
#[derive(Debug, Clone)]
pub struct Request {
    /// The payload exactly as received (forwarded verbatim to peers).
    pub raw: Vec<u8>,
    pub version: ProtocolVersion,
    pub job_type: JobType,
    pub profile: String,
    pub program: String,
    pub entry: String,
    pub compile_flags: String,
    pub platform: String,
    pub request_line: String,
    pub tags: String,
    pub project: String,
    pub email_ccs: Vec<String>,
    /// `false` only when the client sent `Caching="0"`.
    pub caching: bool,
}

#[derive(Default)]
struct RawAttributes {
    version: Option<String>,
    job_type: Option<String>,
    profile: Option<String>,
    program: Option<String>,
    entry: Option<String>,
    compile_flags: Option<String>,
    platform: Option<String>,
    request_line: Option<String>,
    tags: Option<String>,
    project: Option<String>,
    email_ccs: Option<String>,
    caching: Option<String>,
}

fn read_root_attributes(text: &str) -> Result<RawAttributes, RequestError> {
    let mut reader = Reader::from_str(text);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let mut attrs = RawAttributes::default();
                for attr in e.attributes() {
                    let attr = attr.map_err(|err| RequestError::Xml(err.to_string()))?;
                    let value = attr
                        .unescape_value()
                        .map_err(|err| RequestError::Xml(err.to_string()))?
                        .into_owned();
                    let slot = match attr.key.as_ref() {
                        b"Version" => &mut attrs.version,
                        b"JobType" => &mut attrs.job_type,
                        b"Profile" => &mut attrs.profile,
                        b"Program" => &mut attrs.program,
                        b"Entry" => &mut attrs.entry,
                        b"CompileFlags" => &mut attrs.compile_flags,
                        b"Platform" => &mut attrs.platform,
                        b"ShaderRequest" => &mut attrs.request_line,
                        b"Tags" => &mut attrs.tags,
                        b"Project" => &mut attrs.project,
                        b"EmailCCs" => &mut attrs.email_ccs,
                        b"Caching" => &mut attrs.caching,
                        _ => continue,
                    };
                    *slot = Some(value);
                }
                return Ok(attrs);
            }
            Ok(Event::Eof) => return Err(RequestError::MissingRoot),
            Ok(_) => {}
            Err(err) => return Err(RequestError::Xml(err.to_string())),
        }
    }
}

fn required(value: Option<String>, attr: RequiredAttribute) -> Result<String, RequestError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(RequestError::MissingAttribute(attr)),
    }
}

fn split_recipients(value: &str) -> Vec<String> {
    value
        .split([';', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Request {
    /// Parse and validate a raw payload.
    pub fn parse(raw: Vec<u8>) -> Result<Self, RequestError> {
        let text = std::str::from_utf8(&raw).map_err(|_| RequestError::InvalidUtf8)?;
        let attrs = read_root_attributes(text)?;

        let version = ProtocolVersion::parse(attrs.version.as_deref()).ok_or_else(|| {
            RequestError::UnsupportedVersion(attrs.version.clone().unwrap_or_default())
        })?;

        let job_type = match (version, attrs.job_type.as_deref()) {
            (ProtocolVersion::V1, _) => JobType::Compile,
            (_, None) => JobType::Compile,
            (_, Some(value)) => JobType::parse(value)
                .ok_or_else(|| RequestError::UnknownJobType(value.to_string()))?,
        };

        let (profile, program, entry, compile_flags, request_line) = match job_type {
            JobType::Compile => (
                required(attrs.profile, RequiredAttribute::Profile)?,
                required(attrs.program, RequiredAttribute::Program)?,
                required(attrs.entry, RequiredAttribute::Entry)?,
                required(attrs.compile_flags, RequiredAttribute::CompileFlags)?,
                attrs.request_line.unwrap_or_default(),
            ),
            JobType::RequestLine => (
                attrs.profile.unwrap_or_default(),
                attrs.program.unwrap_or_default(),
                attrs.entry.unwrap_or_default(),
                attrs.compile_flags.unwrap_or_default(),
                required(attrs.request_line, RequiredAttribute::ShaderRequest)?,
            ),
        };

        let platform = attrs
            .platform
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PLATFORM.to_string());

        Ok(Self {
            raw,
            version,
            job_type,
            profile,
            program,
            entry,
            compile_flags,
            platform,
            request_line,
            tags: attrs.tags.unwrap_or_default(),
            project: attrs.project.unwrap_or_default(),
            email_ccs: attrs
                .email_ccs
                .as_deref()
                .map(split_recipients)
                .unwrap_or_default(),
            caching: attrs.caching.as_deref().map(str::trim) != Some("0"),
        })
    }

    /// Best-effort protocol version of a payload, so a request that fails to
    /// parse can still be answered in the envelope the client expects.
    ///
    /// Only the root's `Version` attribute is decoded. Returns `None` when the
    /// payload has no readable root element.
    pub fn sniff_version(raw: &[u8]) -> Option<ProtocolVersion> {
        let text = std::str::from_utf8(raw).ok()?;
        let mut reader = Reader::from_str(text);
        loop {
            match reader.read_event().ok()? {
                Event::Start(e) | Event::Empty(e) => {
                    let version = e
                        .attributes()
                        .flatten()
                        .find(|attr| attr.key.as_ref() == b"Version")
                        .and_then(|attr| attr.unescape_value().ok().map(|v| v.into_owned()));
                    return ProtocolVersion::parse(version.as_deref());
                }
                Event::Eof => return None,
                _ => {}
            }
        }
    }
}

fn escape_attr(value: &str) -> String {
    escape(value)
        .replace('\n', "&#10;")
        .replace('\r', "&#13;")
        .replace('\t', "&#9;")
}

/// Builds request documents, used by the forwarding client and tests.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    version: ProtocolVersion,
    job_type: JobType,
    attrs: Vec<(&'static str, String)>,
    trailer: Vec<(&'static str, String)>,
}

impl RequestBuilder {
    pub fn compile(version: ProtocolVersion) -> Self {
        Self {
            version,
            job_type: JobType::Compile,
            attrs: Vec::new(),
            trailer: Vec::new(),
        }
    }

    pub fn request_line(version: ProtocolVersion, line: impl Into<String>) -> Self {
        Self {
            version,
            job_type: JobType::RequestLine,
            attrs: Vec::new(),
            trailer: vec![("ShaderRequest", line.into())],
        }
    }

    fn attr(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.attrs.push((name, value.into()));
        self
    }

    fn trailer(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.trailer.push((name, value.into()));
        self
    }

    pub fn profile(self, value: impl Into<String>) -> Self {
        self.attr("Profile", value)
    }

    pub fn program(self, value: impl Into<String>) -> Self {
        self.attr("Program", value)
    }

    pub fn entry(self, value: impl Into<String>) -> Self {
        self.attr("Entry", value)
    }

    pub fn compile_flags(self, value: impl Into<String>) -> Self {
        self.attr("CompileFlags", value)
    }

    pub fn platform(self, value: impl Into<String>) -> Self {
        self.attr("Platform", value)
    }

    pub fn shader_request(self, value: impl Into<String>) -> Self {
        self.trailer("ShaderRequest", value)
    }

    pub fn project(self, value: impl Into<String>) -> Self {
        self.trailer("Project", value)
    }

    pub fn tags(self, value: impl Into<String>) -> Self {
        self.trailer("Tags", value)
    }

    pub fn email_ccs(self, value: impl Into<String>) -> Self {
        self.trailer("EmailCCs", value)
    }

    pub fn caching(self, enabled: bool) -> Self {
        self.trailer("Caching", if enabled { "1" } else { "0" })
    }

    /// Render the document. Diagnostic attributes follow the `HashStop`
    /// marker for v2+ so they do not influence the cache key.
    pub fn build(&self) -> Vec<u8> {
        let mut out = String::from("<?xml version=\"1.0\"?>\n<Compile");
        let mut push = |name: &str, value: &str| {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(&escape_attr(value));
            out.push('"');
        };
        if self.version != ProtocolVersion::V1 {
            push("Version", self.version.as_str());
            push("JobType", self.job_type.as_str());
        }
        for (name, value) in &self.attrs {
            push(name, value);
        }
        if self.version.uses_hash_stop() {
            push("HashStop", "1");
        }
        for (name, value) in &self.trailer {
            push(name, value);
        }
        out.push_str("/>");
        out.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::request_hash;

    fn compile_doc(version: ProtocolVersion) -> RequestBuilder {
        RequestBuilder::compile(version)
            .profile("ps_5_0")
            .program("float4 main() : SV_Target\n{\n\treturn 1;\n}\n")
            .entry("main")
            .compile_flags("0x800")
            .platform("PC")
    }

    #[test]
    fn parses_v2_compile_request() {
        let _guard = crate::test_guard!();
        let raw = compile_doc(ProtocolVersion::V2)
            .shader_request("<3>Illum@Common_ZPass(%DIFFUSE)")
            .project("Game")
            .tags("tagA")
            .email_ccs("a@example.com; b@example.com")
            .build();
        let req = Request::parse(raw).unwrap();
        assert_eq!(req.version, ProtocolVersion::V2);
        assert_eq!(req.job_type, JobType::Compile);
        assert_eq!(req.profile, "ps_5_0");
        assert_eq!(req.program, "float4 main() : SV_Target\n{\n\treturn 1;\n}\n");
        assert_eq!(req.platform, "PC");
        assert_eq!(req.request_line, "<3>Illum@Common_ZPass(%DIFFUSE)");
        assert_eq!(req.email_ccs, vec!["a@example.com", "b@example.com"]);
        assert!(req.caching);
    }

    #[test]
    fn v1_is_always_a_compile_job() {
        let _guard = crate::test_guard!();
        let raw = br#"<Compile JobType="RequestLine" Profile="vs_5_0" Program="x" Entry="main" CompileFlags="0"/>"#;
        let req = Request::parse(raw.to_vec()).unwrap();
        assert_eq!(req.version, ProtocolVersion::V1);
        assert_eq!(req.job_type, JobType::Compile);
        assert_eq!(req.platform, DEFAULT_PLATFORM);
    }

    #[test]
    fn missing_attributes_map_to_their_states() {
        let _guard = crate::test_guard!();
        let cases = [
            (
                br#"<C Version="2.0" JobType="Compile" Program="x" Entry="m" CompileFlags="0"/>"#.to_vec(),
                JobState::ErrorInvalidProfile,
            ),
            (
                br#"<C Version="2.0" JobType="Compile" Profile="p" Entry="m" CompileFlags="0"/>"#.to_vec(),
                JobState::ErrorInvalidProgram,
            ),
            (
                br#"<C Version="2.0" JobType="Compile" Profile="p" Program="x" CompileFlags="0"/>"#.to_vec(),
                JobState::ErrorInvalidEntry,
            ),
            (
                br#"<C Version="2.0" JobType="Compile" Profile="p" Program="x" Entry="m"/>"#.to_vec(),
                JobState::ErrorInvalidCompileFlags,
            ),
            (
                br#"<C Version="2.0" JobType="RequestLine"/>"#.to_vec(),
                JobState::ErrorInvalidShaderRequestLine,
            ),
        ];
        for (raw, expected) in cases {
            let err = Request::parse(raw).unwrap_err();
            assert_eq!(err.state(), expected, "{err}");
        }
    }

    #[test]
    fn unknown_job_type_is_job_not_found() {
        let _guard = crate::test_guard!();
        let err = Request::parse(br#"<C Version="2.0" JobType="Link"/>"#.to_vec()).unwrap_err();
        assert_eq!(err.state(), JobState::JobNotFound);
    }

    #[test]
    fn garbage_is_a_generic_error() {
        let _guard = crate::test_guard!();
        let err = Request::parse(b"<<<not xml".to_vec()).unwrap_err();
        assert_eq!(err.state(), JobState::Error);
        let err = Request::parse(vec![0xff, 0xfe, 0x00]).unwrap_err();
        assert!(matches!(err, RequestError::InvalidUtf8));
        let err = Request::parse(b"   ".to_vec()).unwrap_err();
        assert!(matches!(err, RequestError::MissingRoot));
    }

    #[test]
    fn caching_zero_disables_caching() {
        let _guard = crate::test_guard!();
        let raw = compile_doc(ProtocolVersion::V2).caching(false).build();
        assert!(!Request::parse(raw).unwrap().caching);
    }

    #[test]
    fn trailer_attributes_do_not_change_cache_key() {
        let _guard = crate::test_guard!();
        let a = compile_doc(ProtocolVersion::V2_1).project("A").tags("x").build();
        let b = compile_doc(ProtocolVersion::V2_1).project("B").email_ccs("c@d").build();
        assert_eq!(
            request_hash(&a, ProtocolVersion::V2_1),
            request_hash(&b, ProtocolVersion::V2_1)
        );
        let c = compile_doc(ProtocolVersion::V2_1).entry("other").build();
        assert_ne!(
            request_hash(&a, ProtocolVersion::V2_1),
            request_hash(&c, ProtocolVersion::V2_1)
        );
    }

    #[test]
    fn request_line_document_round_trips() {
        let _guard = crate::test_guard!();
        let raw = RequestBuilder::request_line(ProtocolVersion::V2, "<1>Terrain@Main(%A)")
            .platform("ORBIS")
            .project("Game")
            .build();
        let req = Request::parse(raw).unwrap();
        assert_eq!(req.job_type, JobType::RequestLine);
        assert_eq!(req.request_line, "<1>Terrain@Main(%A)");
        assert_eq!(req.platform, "ORBIS");
    }

    #[test]
    fn sniffs_version_of_incomplete_request() {
        let _guard = crate::test_guard!();
        let raw = br#"<C Version="2.1" JobType="Compile"/>"#;
        assert_eq!(Request::sniff_version(raw), Some(ProtocolVersion::V2_1));
        assert_eq!(Request::sniff_version(b"junk"), None);
    }
}
