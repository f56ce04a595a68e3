//! Call whitelist for restricted code
//!
//! A whitelist is built from a line-oriented definition:
//!
//! ```text
//! # comment
//! rt.Math.*
//! rt.Console.println
//! rt.Math.abs(i32)
//! rt.Files.<init>
//! ```
//!
//! The type is everything before the last `.` of the name part. A wildcard
//! entry permits every member of the type including its constructor; a named
//! entry permits exactly that member (or, with a parameter list, exactly that
//! overload). Anything not matched is forbidden.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Reserved member name for object construction
pub const CONSTRUCTOR: &str = "<init>";

const CURATED: &str = include_str!("default_whitelist.txt");

/// Distinguishes method calls from object construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallKind {
    Invoke,
    Construct,
}

impl CallKind {
    pub fn of_member(member: &str) -> Self {
        if member == CONSTRUCTOR {
            CallKind::Construct
        } else {
            CallKind::Invoke
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WhitelistError {
    #[error("line {line}: {reason}: '{text}'")]
    Malformed {
        line: usize,
        text: String,
        reason: &'static str,
    },

    #[error("cannot read whitelist {path}: {reason}")]
    Unreadable { path: String, reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum MemberPattern {
    Any,
    Named {
        name: String,
        params: Option<Vec<String>>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WhitelistEntry {
    type_name: String,
    member: MemberPattern,
}

impl WhitelistEntry {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn is_wildcard(&self) -> bool {
        self.member == MemberPattern::Any
    }

    fn matches(
        &self,
        kind: CallKind,
        type_name: &str,
        member: &str,
        params: Option<&[String]>,
    ) -> bool {
        if self.type_name != type_name {
            return false;
        }
        match &self.member {
            MemberPattern::Any => true,
            MemberPattern::Named {
                name,
                params: wanted,
            } => {
                if CallKind::of_member(name) != kind || name != member {
                    return false;
                }
                match (wanted, params) {
                    (Some(wanted), Some(actual)) => wanted.as_slice() == actual,
                    // name-only fallback when the caller cannot supply a signature
                    _ => true,
                }
            }
        }
    }
}

impl fmt::Display for WhitelistEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.member {
            MemberPattern::Any => write!(f, "{}.*", self.type_name),
            MemberPattern::Named { name, params: None } => {
                write!(f, "{}.{}", self.type_name, name)
            }
            MemberPattern::Named {
                name,
                params: Some(params),
            } => write!(f, "{}.{}({})", self.type_name, name, params.join(",")),
        }
    }
}

/// Ordered set of permitted (type, member) pairs.
///
/// Serialises as its definition text so it can be handed to a forked host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Whitelist {
    entries: Vec<WhitelistEntry>,
}

impl Whitelist {
    /// Parse a whitelist definition.
    pub fn parse(definition: &str) -> Result<Self, WhitelistError> {
        let mut entries: Vec<WhitelistEntry> = Vec::new();
        for (idx, raw) in definition.lines().enumerate() {
            let text = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            }
            .trim();
            if text.is_empty() {
                continue;
            }
            let entry = parse_line(idx + 1, text)?;
            if !entries.contains(&entry) {
                entries.push(entry);
            }
        }
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self, WhitelistError> {
        let text = std::fs::read_to_string(path).map_err(|e| WhitelistError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(&text)
    }

    /// The default list shipped with the crate: arithmetic, console,
    /// assertions and timing. File access and process exit are not included.
    pub fn curated() -> Self {
        match Self::parse(CURATED) {
            Ok(list) => list,
            Err(e) => {
                log::error!("Built-in whitelist rejected: {}", e);
                Self::empty()
            }
        }
    }

    /// Whitelist that forbids every call leaving the restricted code.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn permits(
        &self,
        kind: CallKind,
        type_name: &str,
        member: &str,
        params: Option<&[String]>,
    ) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.matches(kind, type_name, member, params))
    }

    pub fn entries(&self) -> &[WhitelistEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn definition(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.to_string());
            out.push('\n');
        }
        out
    }
}

impl From<Whitelist> for String {
    fn from(list: Whitelist) -> Self {
        list.definition()
    }
}

impl TryFrom<String> for Whitelist {
    type Error = WhitelistError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        Whitelist::parse(&text)
    }
}

fn malformed(line: usize, text: &str, reason: &'static str) -> WhitelistError {
    WhitelistError::Malformed {
        line,
        text: text.to_string(),
        reason,
    }
}

fn parse_line(line: usize, text: &str) -> Result<WhitelistEntry, WhitelistError> {
    let (name_part, params) = match text.find('(') {
        Some(open) => {
            if !text.ends_with(')') || text[open + 1..text.len() - 1].contains(['(', ')']) {
                return Err(malformed(line, text, "unbalanced parenthesis"));
            }
            let inner = text[open + 1..text.len() - 1].trim();
            let params: Vec<String> = if inner.is_empty() {
                Vec::new()
            } else {
                inner.split(',').map(|p| p.trim().to_string()).collect()
            };
            if params.iter().any(|p| p.is_empty()) {
                return Err(malformed(line, text, "empty parameter type"));
            }
            (text[..open].trim_end(), Some(params))
        }
        None => {
            if text.contains(')') {
                return Err(malformed(line, text, "unbalanced parenthesis"));
            }
            (text, None)
        }
    };

    if name_part.chars().any(char::is_whitespace) {
        return Err(malformed(line, text, "whitespace inside name"));
    }

    let (type_name, member) = name_part
        .rsplit_once('.')
        .ok_or_else(|| malformed(line, text, "expected Type.member"))?;
    if type_name.is_empty() {
        return Err(malformed(line, text, "empty type"));
    }
    if member.is_empty() {
        return Err(malformed(line, text, "empty member"));
    }

    let member = if member == "*" {
        if params.is_some() {
            return Err(malformed(line, text, "wildcard cannot take parameters"));
        }
        MemberPattern::Any
    } else {
        MemberPattern::Named {
            name: member.to_string(),
            params,
        }
    };

    Ok(WhitelistEntry {
        type_name: type_name.to_string(),
        member,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(params: &[&str]) -> Vec<String> {
        params.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn wildcard_permits_members_and_constructor() {
        let list = Whitelist::parse("rt.Math.*").unwrap();
        assert!(list.permits(CallKind::Invoke, "rt.Math", "abs", None));
        assert!(list.permits(CallKind::Construct, "rt.Math", CONSTRUCTOR, None));
        assert!(!list.permits(CallKind::Invoke, "rt.Mathx", "abs", None));
        assert!(!list.permits(CallKind::Invoke, "rt", "Math", None));
    }

    #[test]
    fn named_entry_permits_only_its_kind() {
        let list = Whitelist::parse("rt.Files.<init>\nrt.Console.println").unwrap();
        assert!(list.permits(CallKind::Construct, "rt.Files", CONSTRUCTOR, None));
        assert!(!list.permits(CallKind::Invoke, "rt.Files", "read_byte", None));
        assert!(list.permits(CallKind::Invoke, "rt.Console", "println", None));
        assert!(!list.permits(CallKind::Construct, "rt.Console", CONSTRUCTOR, None));
    }

    #[test]
    fn overload_disambiguation_with_name_only_fallback() {
        let list = Whitelist::parse("rt.Math.abs(i32)").unwrap();
        assert!(list.permits(CallKind::Invoke, "rt.Math", "abs", Some(&sig(&["i32"]))));
        assert!(!list.permits(CallKind::Invoke, "rt.Math", "abs", Some(&sig(&["f64"]))));
        assert!(list.permits(CallKind::Invoke, "rt.Math", "abs", None));
    }

    #[test]
    fn comments_blank_lines_and_last_dot() {
        let list = Whitelist::parse(
            "# header\n\n  student.pkg.Helper.run   # trailing\n\t\nrt.Thread.sleep(i64)\n",
        )
        .unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.entries()[0].type_name(), "student.pkg.Helper");
        assert!(list.permits(CallKind::Invoke, "student.pkg.Helper", "run", None));
    }

    #[test]
    fn malformed_lines_report_line_number() {
        let cases = [
            ("ok.Type.m\n.member", 2, "empty type"),
            ("Type.", 1, "empty member"),
            ("rt.Ma th.abs", 1, "whitespace inside name"),
            ("rt.Math.abs(i32", 1, "unbalanced parenthesis"),
            ("rt.Math.abs)", 1, "unbalanced parenthesis"),
            ("nodot", 1, "expected Type.member"),
            ("rt.Math.*(i32)", 1, "wildcard cannot take parameters"),
        ];
        for (text, line, reason) in cases {
            match Whitelist::parse(text) {
                Err(WhitelistError::Malformed {
                    line: l, reason: r, ..
                }) => {
                    assert_eq!(l, line, "{}", text);
                    assert_eq!(r, reason, "{}", text);
                }
                other => panic!("expected malformed for {:?}, got {:?}", text, other),
            }
        }
    }

    #[test]
    fn curated_list_excludes_files_and_exit() {
        let list = Whitelist::curated();
        assert!(!list.is_empty());
        assert!(list.permits(CallKind::Invoke, "rt.Math", "sqrt", None));
        assert!(list.permits(CallKind::Invoke, "rt.Console", "println", None));
        assert!(!list.permits(CallKind::Construct, "rt.Files", CONSTRUCTOR, None));
        assert!(!list.permits(CallKind::Invoke, "rt.System", "exit", None));
    }

    #[test]
    fn serialises_as_definition_text() {
        let list = Whitelist::parse("rt.Math.*\nrt.Math.abs(i32,i64)").unwrap();
        let json = serde_json::to_string(&list).unwrap();
        assert_eq!(json, r#""rt.Math.*\nrt.Math.abs(i32,i64)\n""#);
        let back: Whitelist = serde_json::from_str(&json).unwrap();
        assert_eq!(back, list);
    }
}
