//! In-memory representation of a format description.
//!
//! The model mirrors the document grammar field-for-field (kebab-case wire
//! names), so a host loader can deserialize a YAML or JSON document straight
//! into it. The engine itself never touches files; it consumes this model.

use crate::error::{bail, ensure, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};


/// Byte order of multi-byte reads; also used for bit order within bytes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Endian {
    #[serde(rename = "le")]
    Le,
    #[serde(rename = "be")]
    Be,
}

/// `meta` block: defaults that flow down lexically to everything below the
/// type that declares them.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Meta {
    pub id: Option<String>,
    pub endian: Option<Endian>,
    pub bit_endian: Option<Endian>,
    pub encoding: Option<String>,
    /// Accepted for document compatibility; cross-file imports are resolved
    /// by the host loader, never by the engine.
    pub imports: Vec<String>,
}

/// Expression source embedded in the schema. Document scalars of number or
/// boolean shape are normalized to their source spelling.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize)]
pub struct ExprStr(pub String);

impl ExprStr {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ExprStr {
    fn from(s: &str) -> Self {
        ExprStr(s.to_owned())
    }
}

impl<'de> Deserialize<'de> for ExprStr {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct Visitor;

        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = ExprStr;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("an expression source (string, number, or boolean)")
            }

            fn visit_str<E: serde::de::Error>(
                self,
                v: &str,
            ) -> std::result::Result<ExprStr, E> {
                Ok(ExprStr(v.to_owned()))
            }

            fn visit_i64<E: serde::de::Error>(
                self,
                v: i64,
            ) -> std::result::Result<ExprStr, E> {
                Ok(ExprStr(v.to_string()))
            }

            fn visit_u64<E: serde::de::Error>(
                self,
                v: u64,
            ) -> std::result::Result<ExprStr, E> {
                Ok(ExprStr(v.to_string()))
            }

            fn visit_f64<E: serde::de::Error>(
                self,
                v: f64,
            ) -> std::result::Result<ExprStr, E> {
                Ok(ExprStr(v.to_string()))
            }

            fn visit_bool<E: serde::de::Error>(
                self,
                v: bool,
            ) -> std::result::Result<ExprStr, E> {
                Ok(ExprStr(v.to_string()))
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

/// An attribute's `type`: either a plain reference or a switch.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeRefSpec {
    Name(String),
    Switch(SwitchSpec),
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SwitchSpec {
    pub switch_on: ExprStr,
    /// Case key -> type name, in declaration order. Keys are literals,
    /// enum-qualified names (`entry_type::text`), or `_` for the default.
    pub cases: IndexMap<String, String>,
}

/// Fixed literal bytes: a string, or a list mixing integers and strings.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Contents {
    Str(String),
    List(Vec<ContentsElem>),
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentsElem {
    Int(u8),
    Str(String),
}

impl Contents {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Contents::Str(s) => s.as_bytes().to_vec(),
            Contents::List(elems) => {
                let mut out = Vec::new();
                for elem in elems {
                    match elem {
                        ContentsElem::Int(b) => out.push(*b),
                        ContentsElem::Str(s) => out.extend_from_slice(s.as_bytes()),
                    }
                }
                out
            }
        }
    }
}

/// `valid`: a bare scalar means `eq`; otherwise a rules map.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValidSpec {
    Rules(ValidRules),
    Eq(ExprStr),
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ValidRules {
    pub eq: Option<ExprStr>,
    pub min: Option<ExprStr>,
    pub max: Option<ExprStr>,
    pub any_of: Option<Vec<ExprStr>>,
    pub expr: Option<ExprStr>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatKind {
    Expr,
    Eos,
    Until,
}

/// One entry of a type's `seq` (also the read-shape of an instance).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Attribute {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub ty: Option<TypeRefSpec>,
    pub size: Option<ExprStr>,
    pub size_eos: bool,
    pub repeat: Option<RepeatKind>,
    pub repeat_expr: Option<ExprStr>,
    pub repeat_until: Option<ExprStr>,
    #[serde(rename = "if")]
    pub if_expr: Option<ExprStr>,
    pub contents: Option<Contents>,
    pub process: Option<String>,
    pub encoding: Option<String>,
    pub terminator: Option<u8>,
    pub include: bool,
    pub consume: bool,
    pub eos_error: bool,
    #[serde(rename = "enum")]
    pub enum_ref: Option<String>,
    pub valid: Option<ValidSpec>,
    pub doc: Option<String>,
    pub doc_ref: Option<String>,
}

impl Default for Attribute {
    fn default() -> Self {
        Attribute {
            id: None,
            ty: None,
            size: None,
            size_eos: false,
            repeat: None,
            repeat_expr: None,
            repeat_until: None,
            if_expr: None,
            contents: None,
            process: None,
            encoding: None,
            terminator: None,
            include: false,
            consume: true,
            eos_error: true,
            enum_ref: None,
            valid: None,
            doc: None,
            doc_ref: None,
        }
    }
}

/// A named, lazily computed field: either a derived value or a positioned
/// read from some stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct InstanceSpec {
    #[serde(flatten)]
    pub attr: Attribute,
    pub pos: Option<ExprStr>,
    pub io: Option<ExprStr>,
    pub value: Option<ExprStr>,
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Param {
    pub id: String,
    #[serde(rename = "type")]
    pub ty: Option<String>,
    pub doc: Option<String>,
}

/// Ordered map from integer value to symbolic name.
pub type EnumSpec = IndexMap<i64, String>;

/// A user type: its `seq`, nested types, enums, instances, and parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TypeSpec {
    pub meta: Option<Meta>,
    pub params: Vec<Param>,
    pub seq: Vec<Attribute>,
    pub types: IndexMap<String, TypeSpec>,
    pub instances: IndexMap<String, InstanceSpec>,
    pub enums: IndexMap<String, EnumSpec>,
}

/// A complete format description. The document's top level *is* the root
/// type; `meta` rides along inside it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    pub root: TypeSpec,
}

impl Schema {
    pub fn id(&self) -> Option<&str> {
        self.root.meta.as_ref().and_then(|m| m.id.as_deref())
    }

    /// Fingerprint of the canonical serialized form, the key a host-side
    /// schema cache stores compiled schemas under.
    pub fn sha256(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        // writing json to a hasher cannot fail
        serde_json::to_writer(&mut hasher, self).unwrap();
        hasher.finalize().into()
    }

    /// Pick the type a parse or serialize starts from: the root itself, its
    /// `meta.id`, or a named type anywhere beneath the root.
    pub fn resolve_root(&self, name: Option<&str>) -> Result<&TypeSpec> {
        let name = match name {
            None => return Ok(&self.root),
            Some(name) => name,
        };
        if self.id() == Some(name) {
            return Ok(&self.root);
        }
        match find_type_in(&self.root, name) {
            Some(ts) => Ok(ts),
            None => bail!(UnknownType, "no type {:?} in schema", name),
        }
    }
}

fn find_type_in<'a>(ts: &'a TypeSpec, name: &str) -> Option<&'a TypeSpec> {
    if let Some(found) = ts.types.get(name) {
        return Some(found);
    }
    ts.types.values().find_map(|inner| find_type_in(inner, name))
}

/// Walk a path of nested type names down from the root.
pub(crate) fn walk_path<'a>(
    root: &'a TypeSpec,
    path: &[String],
) -> Option<&'a TypeSpec> {
    let mut cur = root;
    for seg in path {
        cur = cur.types.get(seg)?;
    }
    Some(cur)
}

/// The scope stack a definition path denotes: root first, innermost last.
/// Stops early if the path has gone stale against the schema.
pub(crate) fn scope_chain<'a>(
    root: &'a TypeSpec,
    path: &[String],
) -> Vec<&'a TypeSpec> {
    let mut chain = vec![root];
    let mut cur = root;
    for seg in path {
        match cur.types.get(seg) {
            Some(next) => {
                chain.push(next);
                cur = next;
            }
            None => break,
        }
    }
    chain
}

/// Definition path of a user type referenced from the scope identified by
/// `scope_path`, trying the innermost scope first.
pub(crate) fn resolve_type_path(
    root: &TypeSpec,
    scope_path: &[String],
    name: &str,
) -> Option<Vec<String>> {
    let segments: Vec<&str> = name.split("::").collect();
    for depth in (0..=scope_path.len()).rev() {
        let prefix = &scope_path[..depth];
        let ts = match walk_path(root, prefix) {
            Some(ts) => ts,
            None => continue,
        };
        if !ts.types.contains_key(segments[0]) {
            continue;
        }
        let mut path = prefix.to_vec();
        path.extend(segments.iter().map(|s| (*s).to_owned()));
        if walk_path(root, &path).is_some() {
            return Some(path);
        }
    }
    None
}

/// Definition path of the type a parse or serialize starts from.
pub(crate) fn root_type_path(
    schema: &Schema,
    name: Option<&str>,
) -> Result<Vec<String>> {
    let name = match name {
        None => return Ok(Vec::new()),
        Some(name) => name,
    };
    if schema.id() == Some(name) {
        return Ok(Vec::new());
    }
    match find_type_path_in(&schema.root, name) {
        Some(path) => Ok(path),
        None => bail!(UnknownType, "no type {:?} in schema", name),
    }
}

fn find_type_path_in(ts: &TypeSpec, name: &str) -> Option<Vec<String>> {
    if ts.types.contains_key(name) {
        return Some(vec![name.to_owned()]);
    }
    for (outer, inner) in &ts.types {
        if let Some(mut rest) = find_type_path_in(inner, name) {
            let mut path = vec![outer.clone()];
            path.append(&mut rest);
            return Some(path);
        }
    }
    None
}

/// Resolve a (possibly `::`-qualified) user type against a lexical scope
/// stack, innermost last.
pub(crate) fn find_type<'a>(
    scope: &[&'a TypeSpec],
    name: &str,
) -> Option<&'a TypeSpec> {
    let mut segments = name.split("::");
    let first = segments.next()?;
    let mut found = None;
    for ts in scope.iter().rev() {
        if let Some(hit) = ts.types.get(first) {
            found = Some(hit);
            break;
        }
    }
    let mut cur = found?;
    for segment in segments {
        cur = cur.types.get(segment)?;
    }
    Some(cur)
}

/// Resolve a (possibly `::`-qualified) enum against a lexical scope stack.
pub(crate) fn find_enum<'a>(
    scope: &[&'a TypeSpec],
    name: &str,
) -> Option<&'a EnumSpec> {
    match name.rsplit_once("::") {
        None => scope.iter().rev().find_map(|ts| ts.enums.get(name)),
        Some((type_path, enum_name)) => {
            find_type(scope, type_path)?.enums.get(enum_name)
        }
    }
}

/// Nearest enclosing `meta.endian`; `None` when no scope declares one.
pub(crate) fn effective_endian(scope: &[&TypeSpec]) -> Option<Endian> {
    scope
        .iter()
        .rev()
        .find_map(|ts| ts.meta.as_ref().and_then(|m| m.endian))
}

/// Nearest enclosing `meta.bit-endian`, defaulting to big.
pub(crate) fn effective_bit_endian(scope: &[&TypeSpec]) -> Endian {
    scope
        .iter()
        .rev()
        .find_map(|ts| ts.meta.as_ref().and_then(|m| m.bit_endian))
        .unwrap_or(Endian::Be)
}

/// Nearest enclosing `meta.encoding`, defaulting to UTF-8.
pub(crate) fn effective_encoding(scope: &[&TypeSpec]) -> String {
    scope
        .iter()
        .rev()
        .find_map(|ts| {
            ts.meta
                .as_ref()
                .and_then(|m| m.encoding.clone())
        })
        .unwrap_or_else(|| "UTF-8".to_owned())
}


/// A type reference resolved from its surface spelling.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeRef {
    UInt { width: u8, endian: Option<Endian> },
    SInt { width: u8, endian: Option<Endian> },
    Float { width: u8, endian: Option<Endian> },
    Bits { width: u8 },
    Bcd { width: u8 },
    Str { z: bool },
    Bytes,
    User { name: String, args: Vec<String> },
}

impl TypeRef {
    pub fn parse(spelling: &str) -> Result<TypeRef> {
        let spelling = spelling.trim();
        ensure!(!spelling.is_empty(), CompileError, "empty type reference");

        // user-type invocation with positional arguments
        if let Some(open) = spelling.find('(') {
            ensure!(
                spelling.ends_with(')'),
                CompileError,
                "malformed type reference {:?}",
                spelling,
            );
            let name = spelling[..open].trim();
            ensure!(
                is_type_name(name),
                CompileError,
                "malformed type reference {:?}",
                spelling,
            );
            let args = crate::process::split_args(&spelling[open + 1..spelling.len() - 1]);
            return Ok(TypeRef::User { name: name.to_owned(), args });
        }

        if let Some(prim) = parse_primitive(spelling)? {
            return Ok(prim);
        }
        ensure!(
            is_type_name(spelling),
            CompileError,
            "malformed type reference {:?}",
            spelling,
        );
        Ok(TypeRef::User { name: spelling.to_owned(), args: Vec::new() })
    }
}

fn is_type_name(s: &str) -> bool {
    !s.is_empty()
        && s.split("::").all(|seg| {
            let mut chars = seg.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

fn parse_primitive(s: &str) -> Result<Option<TypeRef>> {
    match s {
        "str" => return Ok(Some(TypeRef::Str { z: false })),
        "strz" => return Ok(Some(TypeRef::Str { z: true })),
        "bytes" => return Ok(Some(TypeRef::Bytes)),
        _ => {}
    }
    let (head, tail) =
        if let Some(head) = s.strip_suffix("le") {
            (head, Some(Endian::Le))
        } else if let Some(head) = s.strip_suffix("be") {
            (head, Some(Endian::Be))
        } else {
            (s, None)
        };
    let (kind, digits) = if let Some(d) = head.strip_prefix("bcd") {
        if tail.is_some() {
            return Ok(None);
        }
        ('c', d)
    } else {
        match head.split_at(head.len().min(1)) {
            ("u", d) => ('u', d),
            ("s", d) => ('s', d),
            ("f", d) => ('f', d),
            ("b", d) if tail.is_none() => ('b', d),
            _ => return Ok(None),
        }
    };
    let width: u8 = match digits.parse() {
        Ok(w) => w,
        Err(_) => return Ok(None),
    };
    Ok(Some(match kind {
        'u' | 's' => {
            ensure!(
                matches!(width, 1 | 2 | 4 | 8),
                CompileError,
                "integer type {:?} has unsupported width",
                s,
            );
            if kind == 'u' {
                TypeRef::UInt { width, endian: tail }
            } else {
                TypeRef::SInt { width, endian: tail }
            }
        }
        'f' => {
            ensure!(
                matches!(width, 4 | 8),
                CompileError,
                "float type {:?} has unsupported width",
                s,
            );
            TypeRef::Float { width, endian: tail }
        }
        'b' => {
            ensure!(
                (1..=64).contains(&width),
                CompileError,
                "bit type {:?} has unsupported width",
                s,
            );
            TypeRef::Bits { width }
        }
        _ => {
            ensure!(
                (1..=8).contains(&width),
                CompileError,
                "BCD type {:?} has unsupported width",
                s,
            );
            TypeRef::Bcd { width }
        }
    }))
}


#[test]
fn test_type_ref_parsing() {
    assert_eq!(
        TypeRef::parse("u4le").unwrap(),
        TypeRef::UInt { width: 4, endian: Some(Endian::Le) },
    );
    assert_eq!(
        TypeRef::parse("s2").unwrap(),
        TypeRef::SInt { width: 2, endian: None },
    );
    assert_eq!(
        TypeRef::parse("f8be").unwrap(),
        TypeRef::Float { width: 8, endian: Some(Endian::Be) },
    );
    assert_eq!(TypeRef::parse("b12").unwrap(), TypeRef::Bits { width: 12 });
    assert_eq!(TypeRef::parse("bcd4").unwrap(), TypeRef::Bcd { width: 4 });
    assert_eq!(TypeRef::parse("strz").unwrap(), TypeRef::Str { z: true });
    assert_eq!(
        TypeRef::parse("png_chunk").unwrap(),
        TypeRef::User { name: "png_chunk".to_owned(), args: Vec::new() },
    );
    assert_eq!(
        TypeRef::parse("entry(len, 2 + 2)").unwrap(),
        TypeRef::User {
            name: "entry".to_owned(),
            args: vec!["len".to_owned(), "2 + 2".to_owned()],
        },
    );
    assert!(TypeRef::parse("u3").is_err());
    assert!(TypeRef::parse("b65").is_err());
    assert!(TypeRef::parse("").is_err());
}

#[test]
fn test_attribute_defaults() {
    let attr: Attribute = serde_json::from_value(serde_json::json!({
        "id": "x",
        "type": "u1",
    }))
    .unwrap();
    assert!(attr.consume);
    assert!(attr.eos_error);
    assert!(!attr.include);
    assert!(!attr.size_eos);
}

#[test]
fn test_schema_wire_names() {
    let schema: Schema = serde_json::from_value(serde_json::json!({
        "meta": {"id": "demo", "endian": "le", "bit-endian": "be"},
        "seq": [
            {"id": "magic", "contents": [0x4B, 0x42]},
            {"id": "count", "type": "u2le"},
            {"id": "body", "type": "str", "size": "count", "encoding": "ASCII"},
            {
                "id": "tail",
                "type": {
                    "switch-on": "count",
                    "cases": {"1": "u1", "_": "u2le"},
                },
            },
        ],
        "enums": {"entry_type": {"1": "text", "2": "binary"}},
        "instances": {"double_count": {"value": "count * 2"}},
    }))
    .unwrap();
    assert_eq!(schema.id(), Some("demo"));
    assert_eq!(schema.root.seq.len(), 4);
    assert_eq!(
        schema.root.seq[0].contents.as_ref().unwrap().to_bytes(),
        vec![0x4B, 0x42],
    );
    assert_eq!(schema.root.seq[2].size, Some(ExprStr("count".to_owned())));
    match schema.root.seq[3].ty.as_ref().unwrap() {
        TypeRefSpec::Switch(sw) => {
            assert_eq!(sw.switch_on.as_str(), "count");
            assert_eq!(sw.cases.len(), 2);
        }
        other => panic!("expected switch, got {:?}", other),
    }
    let enum_spec = schema.root.enums.get("entry_type").unwrap();
    assert_eq!(enum_spec.get(&1).map(String::as_str), Some("text"));
    assert_eq!(
        schema.root.instances.get("double_count").unwrap().value,
        Some(ExprStr("count * 2".to_owned())),
    );
}

#[test]
fn test_fingerprint_is_stable() {
    let a: Schema = serde_json::from_value(serde_json::json!({
        "seq": [{"id": "n", "type": "u1"}],
    }))
    .unwrap();
    let b = a.clone();
    assert_eq!(a.sha256(), b.sha256());

    let c: Schema = serde_json::from_value(serde_json::json!({
        "seq": [{"id": "n", "type": "u2le"}],
    }))
    .unwrap();
    assert_ne!(a.sha256(), c.sha256());
}

#[test]
fn test_scope_resolution() {
    let schema: Schema = serde_json::from_value(serde_json::json!({
        "types": {
            "outer": {
                "types": {
                    "inner": {"seq": [{"id": "n", "type": "u1"}]},
                },
                "enums": {"color": {"0": "red"}},
            },
        },
        "enums": {"color": {"0": "blue"}},
    }))
    .unwrap();
    let outer = schema.root.types.get("outer").unwrap();
    let scope: Vec<&TypeSpec> = vec![&schema.root, outer];

    assert!(find_type(&scope, "inner").is_some());
    assert!(find_type(&scope, "outer::inner").is_some());
    assert!(find_type(&scope, "nowhere").is_none());
    // inner scope shadows the root's enum of the same name
    assert_eq!(
        find_enum(&scope, "color").unwrap().get(&0).map(String::as_str),
        Some("red"),
    );
    assert_eq!(
        find_enum(&[&schema.root], "color").unwrap().get(&0).map(String::as_str),
        Some("blue"),
    );
}

#[test]
fn test_resolve_root() {
    let schema: Schema = serde_json::from_value(serde_json::json!({
        "meta": {"id": "top"},
        "types": {
            "outer": {"types": {"deep": {"seq": [{"id": "n", "type": "u1"}]}}},
        },
        "seq": [{"id": "n", "type": "u1"}],
    }))
    .unwrap();
    assert!(std::ptr::eq(schema.resolve_root(None).unwrap(), &schema.root));
    assert!(std::ptr::eq(
        schema.resolve_root(Some("top")).unwrap(),
        &schema.root,
    ));
    // nested types are found by bare name
    assert!(schema.resolve_root(Some("deep")).is_ok());
    assert_eq!(
        schema.resolve_root(Some("gone")).unwrap_err().kind(),
        crate::error::ErrorKind::UnknownType,
    );
}
