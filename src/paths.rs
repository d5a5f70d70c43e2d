//! URL path compression.
//!
//! A table of `{code -> URL template}` entries folds long static Matrix
//! endpoint prefixes into single-character codes. `/_matrix/client/r0/sync`
//! travels as `/7`; dynamic path parameters ride along as additional CoAP
//! path segments, so
//! `/_matrix/client/r0/user/@frank:localhost/account_data/im.vector.setting.breadcrumbs`
//! becomes `/r/@frank:localhost/im.vector.setting.breadcrumbs`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use regex::Regex;

use crate::{GatewayError, Result};

/// Bytes that are not valid raw in a URL path segment. Everything allowed by
/// RFC 3986 `pchar` (including `:` and `@`) stays unescaped.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'%')
    .add(b'\\')
    .add(b'^')
    .add(b'[')
    .add(b']')
    .add(b'|');

/// One compiled template.
#[derive(Debug)]
pub struct PathTemplate {
    code: char,
    template: String,
    /// Placeholder names in template order, kept for debugging output.
    placeholders: Vec<String>,
    matcher: Regex,
}

impl PathTemplate {
    pub fn code(&self) -> char {
        self.code
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn placeholders(&self) -> &[String] {
        &self.placeholders
    }
}

/// Forward and reverse matchers over the whole code table.
#[derive(Debug)]
pub struct PathMap {
    templates: Vec<PathTemplate>,
    by_code: HashMap<char, usize>,
}

impl PathMap {
    /// Compile a `{code -> template}` table, rejecting duplicate codes,
    /// duplicate templates and unbalanced braces.
    pub fn new(entries: &[(char, &str)]) -> Result<Self> {
        let mut templates = Vec::with_capacity(entries.len());
        let mut by_code = HashMap::with_capacity(entries.len());
        let mut seen = HashSet::new();
        for &(code, template) in entries {
            if !seen.insert(template) {
                return Err(GatewayError::Config(format!(
                    "duplicate path template {template:?}"
                )));
            }
            let (matcher, placeholders) = compile_matcher(template)?;
            if by_code.insert(code, templates.len()).is_some() {
                return Err(GatewayError::Config(format!("duplicate path code {code:?}")));
            }
            templates.push(PathTemplate {
                code,
                template: template.to_string(),
                placeholders,
                matcher,
            });
        }
        Ok(Self { templates, by_code })
    }

    /// The v1 Matrix path table.
    pub fn v1() -> Arc<PathMap> {
        static MAP: OnceLock<Arc<PathMap>> = OnceLock::new();
        MAP.get_or_init(|| {
            Arc::new(PathMap::new(PATH_DICT_V1).expect("builtin path table is valid"))
        })
        .clone()
    }

    /// Expand a compressed CoAP path into the HTTP path it stands for.
    ///
    /// Unknown or absent codes leave the input untouched. Extracted dynamic
    /// segments are percent-escaped because they are assembled into an HTTP
    /// URL. Excess CoAP segments are dropped; missing ones truncate the
    /// output at the first unfilled placeholder.
    pub fn coap_path_to_http_path(&self, path: &str) -> String {
        let normalized = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let mut segments = normalized.split('/');
        segments.next(); // leading empty segment
        let code_segment = match segments.next() {
            Some(seg) => seg,
            None => return normalized,
        };
        let mut chars = code_segment.chars();
        let code = match (chars.next(), chars.next()) {
            (Some(c), None) => c,
            _ => return normalized,
        };
        let template = match self.by_code.get(&code) {
            Some(&idx) => &self.templates[idx],
            None => return normalized,
        };

        let mut out = String::with_capacity(template.template.len());
        for segment in template.template.split('/').skip(1) {
            if is_placeholder(segment) {
                match segments.next() {
                    Some(value) => {
                        out.push('/');
                        out.push_str(&utf8_percent_encode(value, PATH_SEGMENT).to_string());
                    }
                    None => break,
                }
            } else {
                out.push('/');
                out.push_str(segment);
            }
        }
        out
    }

    /// Compress an HTTP path into its `/{code}/{params...}` form.
    ///
    /// First matching template wins; unmatched paths pass through
    /// unchanged. No percent-encoding or -decoding happens here: CoAP
    /// Uri-Path options carry raw bytes and the caller supplies the decoded
    /// HTTP path.
    pub fn http_path_to_coap_path(&self, path: &str) -> String {
        for template in &self.templates {
            if let Some(captures) = template.matcher.captures(path) {
                let mut out = String::with_capacity(2 + path.len());
                out.push('/');
                out.push(template.code);
                for i in 1..captures.len() {
                    if let Some(m) = captures.get(i) {
                        out.push('/');
                        out.push_str(m.as_str());
                    }
                }
                return out;
            }
        }
        path.to_string()
    }

    /// Look up a template by its code.
    pub fn template_for(&self, code: char) -> Option<&PathTemplate> {
        self.by_code.get(&code).map(|&idx| &self.templates[idx])
    }
}

fn is_placeholder(segment: &str) -> bool {
    segment.starts_with('{') && segment.ends_with('}') && segment.len() >= 2
}

/// Compile one template into an anchored matcher and its placeholder list.
fn compile_matcher(template: &str) -> Result<(Regex, Vec<String>)> {
    if !template.starts_with('/') {
        return Err(GatewayError::Config(format!(
            "path template must be absolute: {template:?}"
        )));
    }
    let trimmed = template.strip_suffix('/').unwrap_or(template);
    let mut pattern = String::from("^");
    let mut placeholders = Vec::new();
    for segment in trimmed.split('/').skip(1) {
        pattern.push('/');
        if is_placeholder(segment) {
            let name = &segment[1..segment.len() - 1];
            if name.contains('{') || name.contains('}') {
                return Err(GatewayError::Config(format!(
                    "unbalanced braces in template {template:?}"
                )));
            }
            placeholders.push(name.to_string());
            pattern.push_str("([^/]+)");
        } else if segment.contains('{') || segment.contains('}') {
            return Err(GatewayError::Config(format!(
                "unbalanced braces in template {template:?}"
            )));
        } else {
            pattern.push_str(&regex::escape(segment));
        }
    }
    pattern.push_str("/?$");
    let matcher = Regex::new(&pattern)
        .map_err(|e| GatewayError::Config(format!("bad template {template:?}: {e}")))?;
    Ok((matcher, placeholders))
}

/// The v1 path table: 54 codes drawn from `[0-9A-Za-z]`. Codes are stable
/// wire protocol; do not reassign.
pub const PATH_DICT_V1: &[(char, &str)] = &[
    ('0', "/_matrix/client/versions"),
    ('1', "/_matrix/client/r0/login"),
    ('2', "/_matrix/client/r0/capabilities"),
    ('3', "/_matrix/client/r0/logout"),
    ('4', "/_matrix/client/r0/logout/all"),
    ('5', "/_matrix/client/r0/register"),
    ('6', "/_matrix/client/r0/user/{userId}/filter"),
    ('7', "/_matrix/client/r0/sync"),
    ('8', "/_matrix/client/r0/user/{userId}/filter/{filterId}"),
    ('9', "/_matrix/client/r0/rooms/{roomId}/event/{eventId}"),
    ('A', "/_matrix/client/r0/rooms/{roomId}/state"),
    ('B', "/_matrix/client/r0/rooms/{roomId}/state/{eventType}/{stateKey}"),
    ('C', "/_matrix/client/r0/rooms/{roomId}/send/{eventType}/{txnId}"),
    ('D', "/_matrix/client/r0/rooms/{roomId}/redact/{eventId}/{txnId}"),
    ('E', "/_matrix/client/r0/createRoom"),
    ('F', "/_matrix/client/r0/directory/room/{roomAlias}"),
    ('G', "/_matrix/client/r0/join/{roomIdOrAlias}"),
    ('H', "/_matrix/client/r0/rooms/{roomId}/join"),
    ('I', "/_matrix/client/r0/rooms/{roomId}/leave"),
    ('J', "/_matrix/client/r0/rooms/{roomId}/forget"),
    ('K', "/_matrix/client/r0/rooms/{roomId}/kick"),
    ('L', "/_matrix/client/r0/rooms/{roomId}/ban"),
    ('M', "/_matrix/client/r0/rooms/{roomId}/unban"),
    ('N', "/_matrix/client/r0/publicRooms"),
    ('O', "/_matrix/client/r0/user_directory/search"),
    ('P', "/_matrix/client/r0/profile/{userId}"),
    ('Q', "/_matrix/client/r0/profile/{userId}/displayname"),
    ('R', "/_matrix/client/r0/profile/{userId}/avatar_url"),
    ('S', "/_matrix/client/r0/voip/turnServer"),
    ('T', "/_matrix/client/r0/rooms/{roomId}/typing/{userId}"),
    ('U', "/_matrix/client/r0/rooms/{roomId}/receipt/{receiptType}/{eventId}"),
    ('V', "/_matrix/client/r0/rooms/{roomId}/read_markers"),
    ('W', "/_matrix/client/r0/presence/{userId}/status"),
    ('X', "/_matrix/client/r0/sendToDevice/{eventType}/{txnId}"),
    ('Y', "/_matrix/client/r0/rooms/{roomId}/context/{eventId}"),
    ('Z', "/_matrix/client/r0/rooms/{roomId}/report/{eventId}"),
    ('a', "/_matrix/client/r0/devices"),
    ('b', "/_matrix/client/r0/rooms/{roomId}/members"),
    ('c', "/_matrix/client/r0/rooms/{roomId}/messages"),
    ('d', "/_matrix/client/r0/delete_devices"),
    ('e', "/_matrix/client/r0/devices/{deviceId}"),
    ('f', "/_matrix/client/r0/keys/upload"),
    ('g', "/_matrix/client/r0/keys/query"),
    ('h', "/_matrix/client/r0/keys/claim"),
    ('i', "/_matrix/client/r0/keys/changes"),
    ('j', "/_matrix/client/r0/pushers"),
    ('k', "/_matrix/client/r0/pushers/set"),
    ('l', "/_matrix/client/r0/notifications"),
    ('m', "/_matrix/client/r0/pushrules/"),
    ('n', "/_matrix/client/r0/search"),
    ('o', "/_matrix/client/r0/user/{userId}/rooms/{roomId}/tags"),
    ('p', "/_matrix/client/r0/user/{userId}/rooms/{roomId}/tags/{tag}"),
    ('q', "/_matrix/client/r0/user/{userId}/rooms/{roomId}/account_data/{type}"),
    ('r', "/_matrix/client/r0/user/{userId}/account_data/{type}"),
];
