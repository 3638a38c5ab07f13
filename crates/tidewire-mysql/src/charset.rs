//! Character set and collation negotiation.
//!
//! The handshake carries a single collation byte, so collations with ids
//! above 255 and charset changes requested after the fact are applied with
//! one `SET NAMES` directive once authentication completes. Everything the
//! negotiator needs is validated up front: an unknown encoding or
//! collation name fails before a socket is opened.

use std::collections::HashMap;
use std::fmt;

use tidewire_core::{Error, Result};

/// A local text encoding used to turn column bytes into strings and
/// outbound SQL into bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Utf8,
    Latin1,
    Ascii,
    Utf16Be,
    /// Bytes are passed through; text is treated as UTF-8.
    Binary,
}

impl Encoding {
    /// Look up an encoding by any of its common names (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        let folded = name.trim().to_ascii_lowercase().replace('_', "-");
        Some(match folded.as_str() {
            "utf-8" | "utf8" | "utf8mb4" | "utf8mb3" => Encoding::Utf8,
            "iso-8859-1" | "iso8859-1" | "latin1" | "cp1252" | "windows-1252" | "l1" => {
                Encoding::Latin1
            }
            "us-ascii" | "ascii" => Encoding::Ascii,
            "utf-16" | "utf-16be" | "utf16" | "ucs-2" => Encoding::Utf16Be,
            "binary" => Encoding::Binary,
            _ => return None,
        })
    }

    /// Canonical name.
    pub const fn name(self) -> &'static str {
        match self {
            Encoding::Utf8 => "UTF-8",
            Encoding::Latin1 => "ISO-8859-1",
            Encoding::Ascii => "US-ASCII",
            Encoding::Utf16Be => "UTF-16BE",
            Encoding::Binary => "binary",
        }
    }

    /// The MySQL charset a client would ask for to get this encoding.
    pub const fn preferred_charset(self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf8mb4",
            Encoding::Latin1 => "latin1",
            Encoding::Ascii => "ascii",
            Encoding::Utf16Be => "utf16",
            Encoding::Binary => "binary",
        }
    }

    /// Decode bytes, substituting U+FFFD for invalid sequences.
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Encoding::Utf8 | Encoding::Binary => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
            Encoding::Ascii => bytes
                .iter()
                .map(|&b| {
                    if b.is_ascii() {
                        char::from(b)
                    } else {
                        char::REPLACEMENT_CHARACTER
                    }
                })
                .collect(),
            Encoding::Utf16Be => {
                let units = bytes
                    .chunks(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair.get(1).copied().unwrap_or(0)]));
                char::decode_utf16(units)
                    .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
                    .collect()
            }
        }
    }

    /// Encode text, replacing characters the encoding cannot represent with `?`.
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            Encoding::Utf8 | Encoding::Binary => text.as_bytes().to_vec(),
            Encoding::Latin1 | Encoding::Ascii => {
                let limit = if self == Encoding::Latin1 { 0xFF } else { 0x7F };
                let mut replaced = 0usize;
                let out = text
                    .chars()
                    .map(|c| {
                        let code = u32::from(c);
                        if code <= limit {
                            code as u8
                        } else {
                            replaced += 1;
                            b'?'
                        }
                    })
                    .collect();
                if replaced > 0 {
                    tracing::warn!(
                        encoding = self.name(),
                        replaced,
                        "characters not representable in session encoding were replaced with '?'"
                    );
                }
                out
            }
            Encoding::Utf16Be => text.encode_utf16().flat_map(u16::to_be_bytes).collect(),
        }
    }

    /// Number of characters in `bytes` under this encoding.
    pub fn char_len(self, bytes: &[u8]) -> usize {
        match self {
            Encoding::Latin1 | Encoding::Ascii | Encoding::Binary => bytes.len(),
            _ => self.decode(bytes).chars().count(),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One row of the server's collation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collation {
    pub id: u16,
    pub name: &'static str,
    pub charset: &'static str,
    /// Is this the charset's default collation?
    pub is_default: bool,
}

macro_rules! collations {
    ($(($id:expr, $name:expr, $charset:expr, $default:expr)),* $(,)?) => {
        &[$(Collation { id: $id, name: $name, charset: $charset, is_default: $default }),*]
    };
}

static COLLATIONS: &[Collation] = collations![
    (8, "latin1_swedish_ci", "latin1", true),
    (47, "latin1_bin", "latin1", false),
    (48, "latin1_general_ci", "latin1", false),
    (49, "latin1_general_cs", "latin1", false),
    (11, "ascii_general_ci", "ascii", true),
    (65, "ascii_bin", "ascii", false),
    (33, "utf8mb3_general_ci", "utf8mb3", true),
    (83, "utf8mb3_bin", "utf8mb3", false),
    (192, "utf8mb3_unicode_ci", "utf8mb3", false),
    (45, "utf8mb4_general_ci", "utf8mb4", false),
    (46, "utf8mb4_bin", "utf8mb4", false),
    (224, "utf8mb4_unicode_ci", "utf8mb4", false),
    (255, "utf8mb4_0900_ai_ci", "utf8mb4", true),
    (278, "utf8mb4_0900_as_cs", "utf8mb4", false),
    (305, "utf8mb4_0900_as_ci", "utf8mb4", false),
    (309, "utf8mb4_0900_bin", "utf8mb4", false),
    (63, "binary", "binary", true),
    (35, "ucs2_general_ci", "ucs2", true),
    (54, "utf16_general_ci", "utf16", true),
    (55, "utf16_bin", "utf16", false),
    (60, "utf32_general_ci", "utf32", true),
];

/// Collation id of `utf8mb4_general_ci`, the fallback when the server
/// default cannot serve as a client charset.
pub const FALLBACK_COLLATION_ID: u16 = 45;

/// Charsets the server refuses as `character_set_client`.
const NON_CLIENT_CHARSETS: &[&str] = &["ucs2", "utf16", "utf16le", "utf32"];

fn normalize_charset(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    if lower == "utf8" {
        "utf8mb3".to_string()
    } else {
        lower
    }
}

fn normalize_collation(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    match lower.strip_prefix("utf8_") {
        Some(rest) => format!("utf8mb3_{rest}"),
        None => lower,
    }
}

/// Look up a collation by id.
pub fn collation_by_id(id: u16) -> Option<&'static Collation> {
    COLLATIONS.iter().find(|c| c.id == id)
}

/// Look up a collation by name (`utf8_*` is accepted for `utf8mb3_*`).
pub fn collation_by_name(name: &str) -> Option<&'static Collation> {
    let name = normalize_collation(name);
    COLLATIONS.iter().find(|c| c.name == name)
}

/// The default collation of a charset.
pub fn default_collation(charset: &str) -> Option<&'static Collation> {
    let charset = normalize_charset(charset);
    COLLATIONS
        .iter()
        .find(|c| c.charset == charset && c.is_default)
}

/// Built-in MySQL charset to local encoding table.
pub fn builtin_charset_encoding(charset: &str) -> Option<Encoding> {
    match normalize_charset(charset).as_str() {
        "utf8mb3" | "utf8mb4" => Some(Encoding::Utf8),
        "latin1" => Some(Encoding::Latin1),
        "ascii" => Some(Encoding::Ascii),
        "binary" => Some(Encoding::Binary),
        "utf16" | "ucs2" => Some(Encoding::Utf16Be),
        _ => None,
    }
}

/// User-supplied overrides of the charset to encoding table.
///
/// Parsed from `"charset:encoding,charset:encoding"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CharsetMapping {
    entries: HashMap<String, Encoding>,
}

impl CharsetMapping {
    /// Parse a mapping string. Unknown encoding names are rejected.
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = HashMap::new();
        for pair in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (charset, encoding) = pair.split_once(':').ok_or_else(|| {
                Error::config(format!(
                    "custom charset mapping entry '{pair}' is not charset:encoding"
                ))
            })?;
            let encoding = Encoding::from_name(encoding)
                .ok_or_else(|| Error::UnsupportedEncoding(encoding.trim().to_string()))?;
            entries.insert(normalize_charset(charset), encoding);
        }
        Ok(Self { entries })
    }

    /// Is the mapping empty?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add or replace one entry.
    pub fn insert(&mut self, charset: &str, encoding: Encoding) {
        self.entries.insert(normalize_charset(charset), encoding);
    }

    /// Resolve a MySQL charset to a local encoding, custom entries first.
    pub fn encoding_for_charset(&self, charset: &str) -> Option<Encoding> {
        self.entries
            .get(&normalize_charset(charset))
            .copied()
            .or_else(|| builtin_charset_encoding(charset))
    }

    /// Resolve a column's collation id to an encoding.
    pub fn encoding_for_collation(&self, id: u16) -> Option<Encoding> {
        collation_by_id(id).and_then(|c| self.encoding_for_charset(c.charset))
    }

    /// The MySQL charset to request for an encoding: a custom entry wins,
    /// then the encoding's preferred charset.
    fn charset_for_encoding(&self, encoding: Encoding) -> String {
        let mut custom: Vec<&String> = self
            .entries
            .iter()
            .filter(|(_, e)| **e == encoding)
            .map(|(cs, _)| cs)
            .collect();
        custom.sort();
        custom
            .first()
            .map_or_else(|| encoding.preferred_charset().to_string(), |cs| (*cs).clone())
    }
}

/// What the connection must do to establish the requested charset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharsetPlan {
    /// Collation id to place in the handshake response.
    pub handshake_collation: u8,
    /// Post-handshake directive, if one is required.
    pub directive: Option<String>,
    /// Encoding for outbound SQL and for columns without a known charset.
    pub session_encoding: Encoding,
    /// Charset the session ends up using.
    pub charset: String,
    /// Collation the session ends up using, when known.
    pub collation: Option<&'static Collation>,
}

/// Validated charset request, ready to be planned against a server.
#[derive(Debug, Clone)]
pub struct CharsetNegotiator {
    encoding: Option<Encoding>,
    collation: Option<&'static Collation>,
    mapping: CharsetMapping,
}

impl CharsetNegotiator {
    /// Validate the configured names. Runs before any network I/O.
    pub fn new(
        encoding: Option<&str>,
        collation: Option<&str>,
        mapping: CharsetMapping,
    ) -> Result<Self> {
        let encoding = encoding
            .map(|name| {
                Encoding::from_name(name).ok_or_else(|| Error::UnsupportedEncoding(name.to_string()))
            })
            .transpose()?;
        let collation = collation
            .map(|name| {
                collation_by_name(name).ok_or_else(|| Error::UnsupportedEncoding(name.to_string()))
            })
            .transpose()?;
        if let Some(c) = collation {
            if mapping.encoding_for_charset(c.charset).is_none() {
                return Err(Error::UnsupportedEncoding(c.charset.to_string()));
            }
        }
        Ok(Self {
            encoding,
            collation,
            mapping,
        })
    }

    /// The charset mapping in effect.
    pub fn mapping(&self) -> &CharsetMapping {
        &self.mapping
    }

    /// Decide the handshake collation and directive for a server whose
    /// default collation is `server_default`.
    pub fn plan(&self, server_default: u8) -> CharsetPlan {
        let server = collation_by_id(u16::from(server_default));
        let server_encoding = server
            .filter(|c| !NON_CLIENT_CHARSETS.contains(&c.charset))
            .and_then(|c| self.mapping.encoding_for_charset(c.charset).map(|e| (c, e)));

        // Explicit collation beats anything inferred from the encoding.
        if let Some(coll) = self.collation {
            let encoding = self
                .mapping
                .encoding_for_charset(coll.charset)
                .unwrap_or(Encoding::Utf8);
            let handshake = u8::try_from(coll.id)
                .ok()
                .or_else(|| server_encoding.map(|_| server_default))
                .unwrap_or(FALLBACK_COLLATION_ID as u8);
            let directive = (coll.id != u16::from(server_default))
                .then(|| format!("SET NAMES {} COLLATE {}", coll.charset, coll.name));
            return CharsetPlan {
                handshake_collation: handshake,
                directive,
                session_encoding: encoding,
                charset: coll.charset.to_string(),
                collation: Some(coll),
            };
        }

        match (self.encoding, server_encoding) {
            // Same family as the server default: nothing to do.
            (Some(wanted), Some((coll, have))) if wanted == have => {
                self.keep_server(server_default, coll, have)
            }
            (None, Some((coll, have))) => self.keep_server(server_default, coll, have),
            (wanted, _) => {
                let encoding = wanted.unwrap_or(Encoding::Utf8);
                let charset = self.mapping.charset_for_encoding(encoding);
                let target = default_collation(&charset);
                let handshake = target
                    .and_then(|c| u8::try_from(c.id).ok())
                    .or_else(|| server_encoding.map(|_| server_default))
                    .unwrap_or(FALLBACK_COLLATION_ID as u8);
                CharsetPlan {
                    handshake_collation: handshake,
                    directive: Some(format!("SET NAMES {charset}")),
                    session_encoding: encoding,
                    charset,
                    collation: target,
                }
            }
        }
    }

    fn keep_server(&self, id: u8, coll: &'static Collation, encoding: Encoding) -> CharsetPlan {
        CharsetPlan {
            handshake_collation: id,
            directive: None,
            session_encoding: encoding,
            charset: coll.charset.to_string(),
            collation: Some(coll),
        }
    }

    /// Plan a mid-session switch to `charset`, optionally with a collation.
    pub fn plan_switch(&self, charset: &str, collation: Option<&str>) -> Result<CharsetPlan> {
        let encoding = self
            .mapping
            .encoding_for_charset(charset)
            .ok_or_else(|| Error::UnsupportedEncoding(charset.to_string()))?;
        let charset = normalize_charset(charset);
        let coll = match collation {
            Some(name) => {
                let c = collation_by_name(name)
                    .ok_or_else(|| Error::UnsupportedEncoding(name.to_string()))?;
                if c.charset != charset {
                    return Err(Error::InvalidArgument(format!(
                        "collation {} does not belong to charset {}",
                        c.name, charset
                    )));
                }
                Some(c)
            }
            None => default_collation(&charset),
        };
        let directive = match (collation, coll) {
            (Some(_), Some(c)) => format!("SET NAMES {} COLLATE {}", charset, c.name),
            _ => format!("SET NAMES {charset}"),
        };
        Ok(CharsetPlan {
            handshake_collation: coll
                .and_then(|c| u8::try_from(c.id).ok())
                .unwrap_or(FALLBACK_COLLATION_ID as u8),
            directive: Some(directive),
            session_encoding: encoding,
            charset,
            collation: coll,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiator(encoding: Option<&str>, collation: Option<&str>) -> CharsetNegotiator {
        CharsetNegotiator::new(encoding, collation, CharsetMapping::default()).unwrap()
    }

    #[test]
    fn matching_family_needs_no_directive() {
        // server default utf8mb4_0900_ai_ci, client asks for UTF-8
        let plan = negotiator(Some("UTF-8"), None).plan(255);
        assert_eq!(plan.directive, None);
        assert_eq!(plan.handshake_collation, 255);
        assert_eq!(plan.session_encoding, Encoding::Utf8);

        // utf8mb3 server is the same family
        let plan = negotiator(Some("utf8"), None).plan(33);
        assert_eq!(plan.directive, None);
    }

    #[test]
    fn nothing_requested_keeps_server_default() {
        let plan = negotiator(None, None).plan(8);
        assert_eq!(plan.directive, None);
        assert_eq!(plan.session_encoding, Encoding::Latin1);
        assert_eq!(plan.charset, "latin1");
    }

    #[test]
    fn explicit_collation_issues_exactly_one_directive() {
        let plan = negotiator(None, Some("utf8mb4_bin")).plan(255);
        assert_eq!(
            plan.directive.as_deref(),
            Some("SET NAMES utf8mb4 COLLATE utf8mb4_bin")
        );
        assert_eq!(plan.handshake_collation, 46);
    }

    #[test]
    fn explicit_collation_equal_to_server_default_is_silent() {
        let plan = negotiator(Some("UTF-8"), Some("utf8mb4_0900_ai_ci")).plan(255);
        assert_eq!(plan.directive, None);
    }

    #[test]
    fn collation_above_255_uses_server_default_in_handshake() {
        let plan = negotiator(None, Some("utf8mb4_0900_as_cs")).plan(8);
        assert_eq!(plan.handshake_collation, 8);
        assert_eq!(
            plan.directive.as_deref(),
            Some("SET NAMES utf8mb4 COLLATE utf8mb4_0900_as_cs")
        );
        assert_eq!(plan.session_encoding, Encoding::Utf8);
    }

    #[test]
    fn explicit_collation_beats_encoding() {
        let plan = negotiator(Some("UTF-8"), Some("latin1_general_ci")).plan(255);
        assert_eq!(plan.session_encoding, Encoding::Latin1);
        assert_eq!(
            plan.directive.as_deref(),
            Some("SET NAMES latin1 COLLATE latin1_general_ci")
        );
    }

    #[test]
    fn different_family_switches_charset() {
        let plan = negotiator(Some("ISO-8859-1"), None).plan(255);
        assert_eq!(plan.directive.as_deref(), Some("SET NAMES latin1"));
        assert_eq!(plan.handshake_collation, 8);
    }

    #[test]
    fn non_client_server_charset_falls_back_to_utf8mb4() {
        let plan = negotiator(None, None).plan(54);
        assert_eq!(plan.directive.as_deref(), Some("SET NAMES utf8mb4"));
        assert_eq!(plan.handshake_collation, 255);
        assert_eq!(plan.session_encoding, Encoding::Utf8);
    }

    #[test]
    fn unknown_names_fail_before_io() {
        let err = CharsetNegotiator::new(Some("klingon"), None, CharsetMapping::default())
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedEncoding(ref n) if n == "klingon"));

        let err = CharsetNegotiator::new(None, Some("utf8mb4_klingon_ci"), CharsetMapping::default())
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedEncoding(_)));
    }

    #[test]
    fn custom_mapping_overrides_builtin() {
        let mapping = CharsetMapping::parse("latin1:US-ASCII, utf8mb4 : UTF-8").unwrap();
        assert_eq!(mapping.encoding_for_charset("latin1"), Some(Encoding::Ascii));
        assert_eq!(mapping.encoding_for_collation(8), Some(Encoding::Ascii));
        assert_eq!(mapping.encoding_for_collation(46), Some(Encoding::Utf8));

        // latin1 server now maps to ASCII, so asking for ASCII needs no directive
        let negotiator = CharsetNegotiator::new(Some("ascii"), None, mapping).unwrap();
        assert_eq!(negotiator.plan(8).directive, None);
    }

    #[test]
    fn custom_mapping_rejects_unknown_encoding() {
        assert!(matches!(
            CharsetMapping::parse("latin1:EBCDIC-ZZ"),
            Err(Error::UnsupportedEncoding(_))
        ));
        assert!(matches!(CharsetMapping::parse("latin1"), Err(Error::Config(_))));
    }

    #[test]
    fn plan_switch_mid_session() {
        let n = negotiator(None, None);
        let plan = n.plan_switch("latin1", None).unwrap();
        assert_eq!(plan.directive.as_deref(), Some("SET NAMES latin1"));
        assert_eq!(plan.session_encoding, Encoding::Latin1);

        let plan = n.plan_switch("utf8mb4", Some("utf8mb4_unicode_ci")).unwrap();
        assert_eq!(
            plan.directive.as_deref(),
            Some("SET NAMES utf8mb4 COLLATE utf8mb4_unicode_ci")
        );
        assert!(n.plan_switch("utf8mb4", Some("latin1_bin")).is_err());
        assert!(n.plan_switch("klingon", None).is_err());
    }

    #[test]
    fn encode_replaces_unrepresentable() {
        assert_eq!(Encoding::Latin1.encode("café €"), b"caf\xe9 ?".to_vec());
        assert_eq!(Encoding::Ascii.encode("é"), b"?".to_vec());
        assert_eq!(Encoding::Utf8.encode("€"), "€".as_bytes().to_vec());
    }

    #[test]
    fn decode_each_encoding() {
        assert_eq!(Encoding::Latin1.decode(b"caf\xe9"), "café");
        assert_eq!(Encoding::Utf8.decode("naïve".as_bytes()), "naïve");
        assert_eq!(Encoding::Utf16Be.decode(&[0x00, 0x41, 0x20, 0xAC]), "A€");
        assert_eq!(Encoding::Ascii.decode(b"a\xffb"), "a\u{FFFD}b");
        assert_eq!(Encoding::Utf16Be.char_len(&[0x00, 0x41, 0x00, 0x42]), 2);
    }
}
