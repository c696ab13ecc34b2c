//! Typed runtime values and the arena parse tree.
//!
//! Every parsed field becomes a `Node` in a `Tree`. Nodes refer to their
//! parent and to the stream they were read from by index, never by owning
//! pointer, so the tree stays a plain `Vec` arena with the root at index 0.
//! Scalars remember enough of their Kaitai typing to re-serialize
//! themselves and to drive expression semantics.

use crate::{
    encoding,
    error::{bail, ensure, Result},
    stream::BitStream,
};
use std::{
    cmp::Ordering,
    collections::HashMap,
    fmt::Write as _,
};


/// Index of a node in its tree. The root record is always `NodeId(0)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct NodeId(pub u32);

/// Index of a stream in its tree.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct StreamId(pub u32);

/// Scalar leaf value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    /// Sized integer. `width` is in bytes; values are held in 128 bits so
    /// the full `u8`(-byte) unsigned range survives arithmetic.
    Int { v: i128, unsigned: bool, width: u8 },
    /// IEEE-754 float, `width` 4 or 8 bytes.
    Float { v: f64, width: u8 },
    /// Bit-field, `width` in bits. Serializes only as part of a bit group.
    Bits { v: u64, width: u8 },
    /// Packed BCD, `width` in bytes (two digits per byte).
    Bcd { v: u64, width: u8 },
    /// Decoded text plus the encoding it came from.
    Str { text: String, encoding: String },
    Bytes(Vec<u8>),
    /// Enum-tagged integer. `label` is `None` when the value is outside the
    /// enum, which is not an error by itself.
    Enum { enum_name: String, label: Option<String>, v: i64 },
    Bool(bool),
}

impl Scalar {
    pub fn int(v: i128) -> Self {
        Scalar::Int { v, unsigned: false, width: 8 }
    }

    /// Kaitai-style type name, for diagnostics and method dispatch.
    pub fn type_name(&self) -> String {
        match self {
            &Scalar::Int { unsigned: true, width, .. } => format!("u{}", width),
            &Scalar::Int { unsigned: false, width, .. } => format!("s{}", width),
            &Scalar::Float { width, .. } => format!("f{}", width),
            &Scalar::Bits { width, .. } => format!("b{}", width),
            &Scalar::Bcd { width, .. } => format!("bcd{}", width),
            &Scalar::Str { .. } => "str".to_owned(),
            &Scalar::Bytes(_) => "bytes".to_owned(),
            &Scalar::Enum { ref enum_name, .. } => enum_name.clone(),
            &Scalar::Bool(_) => "bool".to_owned(),
        }
    }

    pub fn as_int(&self) -> Result<i128> {
        Ok(match self {
            &Scalar::Int { v, .. } => v,
            &Scalar::Bits { v, .. } => v as i128,
            &Scalar::Bcd { v, .. } => v as i128,
            &Scalar::Enum { v, .. } => v as i128,
            other => bail!(
                TypeMismatch,
                "{} is not usable as an integer",
                other.type_name(),
            ),
        })
    }

    pub fn as_f64(&self) -> Result<f64> {
        Ok(match self {
            &Scalar::Float { v, .. } => v,
            other => other.as_int()? as f64,
        })
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            &Scalar::Bool(b) => Ok(b),
            other => bail!(
                TypeMismatch,
                "{} is not usable as a condition",
                other.type_name(),
            ),
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, &Scalar::Float { .. })
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            &Scalar::Int { .. }
                | &Scalar::Float { .. }
                | &Scalar::Bits { .. }
                | &Scalar::Bcd { .. }
                | &Scalar::Enum { .. }
        )
    }

    /// Equality as the expression language sees it: numerics by numeric
    /// value, enums against integers by underlying value and against
    /// strings by symbolic name, otherwise like-for-like.
    pub fn try_eq(&self, other: &Scalar) -> Result<bool> {
        Ok(match (self, other) {
            (&Scalar::Str { text: ref a, .. }, &Scalar::Str { text: ref b, .. }) => a == b,
            (&Scalar::Enum { ref label, .. }, &Scalar::Str { ref text, .. })
            | (&Scalar::Str { ref text, .. }, &Scalar::Enum { ref label, .. }) => {
                label.as_deref() == Some(text.as_str())
            }
            (&Scalar::Bytes(ref a), &Scalar::Bytes(ref b)) => a == b,
            (&Scalar::Bool(a), &Scalar::Bool(b)) => a == b,
            (a, b) if a.is_numeric() && b.is_numeric() => {
                if a.is_float() || b.is_float() {
                    a.as_f64()? == b.as_f64()?
                } else {
                    a.as_int()? == b.as_int()?
                }
            }
            (a, b) => bail!(
                TypeMismatch,
                "cannot compare {} with {}",
                a.type_name(),
                b.type_name(),
            ),
        })
    }

    /// Ordering for the relational operators. Defined for numeric pairs,
    /// string pairs (Unicode scalar order), and byte pairs (lexicographic).
    pub fn try_cmp(&self, other: &Scalar) -> Result<Ordering> {
        match (self, other) {
            (&Scalar::Str { text: ref a, .. }, &Scalar::Str { text: ref b, .. }) => {
                Ok(a.cmp(b))
            }
            (&Scalar::Bytes(ref a), &Scalar::Bytes(ref b)) => Ok(a.cmp(b)),
            (a, b) if a.is_numeric() && b.is_numeric() => {
                if a.is_float() || b.is_float() {
                    let (x, y) = (a.as_f64()?, b.as_f64()?);
                    match x.partial_cmp(&y) {
                        Some(ord) => Ok(ord),
                        None => bail!(TypeMismatch, "NaN is unordered"),
                    }
                } else {
                    Ok(a.as_int()?.cmp(&b.as_int()?))
                }
            }
            (a, b) => bail!(
                TypeMismatch,
                "cannot order {} against {}",
                a.type_name(),
                b.type_name(),
            ),
        }
    }

    /// Serialization bytes for a standalone scalar of this type. Bit-fields
    /// and enums have no standalone encoding; the serializer handles them
    /// through their group or base type.
    pub fn to_bytes(&self, big_endian: bool) -> Result<Vec<u8>> {
        match self {
            &Scalar::Int { v, unsigned, width } => {
                encode_int(v, unsigned, width, big_endian)
            }
            &Scalar::Float { v, width: 4 } => {
                let buf = (v as f32).to_bits();
                Ok(if big_endian {
                    buf.to_be_bytes().to_vec()
                } else {
                    buf.to_le_bytes().to_vec()
                })
            }
            &Scalar::Float { v, .. } => Ok(if big_endian {
                v.to_bits().to_be_bytes().to_vec()
            } else {
                v.to_bits().to_le_bytes().to_vec()
            }),
            &Scalar::Bcd { v, width } => encode_bcd(v, width),
            &Scalar::Str { ref text, ref encoding } => {
                encoding::encode(text, encoding)
            }
            &Scalar::Bytes(ref b) => Ok(b.clone()),
            &Scalar::Bits { .. } => bail!(
                TypeMismatch,
                "bit-fields serialize only as part of a bit group",
            ),
            &Scalar::Enum { .. } => bail!(
                TypeMismatch,
                "enum values serialize through their base type",
            ),
            &Scalar::Bool(_) => bail!(
                TypeMismatch,
                "booleans have no serialized form",
            ),
        }
    }

    /// Short rendering for tree listings and error messages.
    pub fn render(&self) -> String {
        match self {
            &Scalar::Int { v, .. } => v.to_string(),
            &Scalar::Float { v, .. } => v.to_string(),
            &Scalar::Bits { v, .. } => v.to_string(),
            &Scalar::Bcd { v, .. } => v.to_string(),
            &Scalar::Str { ref text, .. } => format!("{:?}", text),
            &Scalar::Bytes(ref b) => {
                let mut s = String::new();
                for (i, byte) in b.iter().take(16).enumerate() {
                    if i > 0 {
                        s.push(' ');
                    }
                    write!(&mut s, "{:02x}", byte).unwrap();
                }
                if b.len() > 16 {
                    write!(&mut s, " .. ({} bytes)", b.len()).unwrap();
                }
                s
            }
            &Scalar::Enum { ref enum_name, ref label, v } => match label {
                Some(label) => format!("{}::{}", enum_name, label),
                None => format!("<{}::{}>", enum_name, v),
            },
            &Scalar::Bool(b) => b.to_string(),
        }
    }
}

/// Encode `v` into `width` bytes, failing with `RangeError` when it does
/// not fit the declared width and signedness.
pub(crate) fn encode_int(
    v: i128,
    unsigned: bool,
    width: u8,
    big_endian: bool,
) -> Result<Vec<u8>> {
    let bits = width as u32 * 8;
    if unsigned {
        ensure!(
            v >= 0 && (bits == 128 || v < (1i128 << bits)),
            RangeError,
            "{} does not fit u{}",
            v,
            width,
        );
    } else {
        let lo = -(1i128 << (bits - 1));
        let hi = (1i128 << (bits - 1)) - 1;
        ensure!(
            v >= lo && v <= hi,
            RangeError,
            "{} does not fit s{}",
            v,
            width,
        );
    }
    let all = (v as u128).to_le_bytes();
    let mut out = all[..width as usize].to_vec();
    if big_endian {
        out.reverse();
    }
    Ok(out)
}

pub(crate) fn encode_bcd(v: u64, width: u8) -> Result<Vec<u8>> {
    let digits = width as u32 * 2;
    ensure!(
        digits >= 20 || v < 10u64.pow(digits),
        RangeError,
        "{} does not fit {} BCD digits",
        v,
        digits,
    );
    let mut out = vec![0u8; width as usize];
    let mut rest = v;
    for byte in out.iter_mut().rev() {
        let lo = (rest % 10) as u8;
        rest /= 10;
        let hi = (rest % 10) as u8;
        rest /= 10;
        *byte = (hi << 4) | lo;
    }
    Ok(out)
}

/// Any value an expression can produce: a scalar, a reference into the
/// parse tree, a stream handle, or null.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(Scalar),
    Node(NodeId),
    Stream(StreamId),
    Null,
}

impl From<Scalar> for Value {
    fn from(s: Scalar) -> Self {
        Value::Scalar(s)
    }
}

impl From<i128> for Value {
    fn from(v: i128) -> Self {
        Value::Scalar(Scalar::int(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Scalar(Scalar::int(v as i128))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Scalar(Scalar::Int { v: v as i128, unsigned: true, width: 8 })
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Scalar(Scalar::Float { v, width: 8 })
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Scalar(Scalar::Bool(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Scalar(Scalar::Str {
            text: v.to_owned(),
            encoding: "UTF-8".to_owned(),
        })
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Scalar(Scalar::Bytes(v))
    }
}


/// One parsed field.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) parent: Option<NodeId>,
    /// Kaitai type name, eg `u4le`, `str`, `png_chunk`.
    pub(crate) ty: String,
    /// The bytes this node was read from, where that is meaningful.
    pub(crate) raw: Option<Vec<u8>>,
    pub(crate) body: NodeBody,
}

#[derive(Debug, Clone)]
pub enum NodeBody {
    Scalar(Scalar),
    Array(Vec<NodeId>),
    Record(Record),
}

/// A parsed user-type invocation: ordered fields, bound parameters, and the
/// lazy instance cache.
#[derive(Debug, Clone, Default)]
pub struct Record {
    /// Stream the record was parsed from. Host-built records have none.
    pub(crate) io: Option<StreamId>,
    /// Definition path of the record's type below the schema root; used to
    /// rebuild lexical scope when instances and enum constants evaluate
    /// after the parse.
    pub(crate) type_path: Vec<String>,
    pub(crate) fields: Vec<(String, NodeId)>,
    pub(crate) params: Vec<(String, Value)>,
    pub(crate) instances: HashMap<String, InstanceSlot>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum InstanceSlot {
    /// Currently being computed; re-entry is a cycle.
    Computing,
    Ready(Value),
}

impl Node {
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn type_name(&self) -> &str {
        &self.ty
    }

    pub fn raw(&self) -> Option<&[u8]> {
        self.raw.as_deref()
    }

    pub fn body(&self) -> &NodeBody {
        &self.body
    }

    pub fn as_scalar(&self) -> Result<&Scalar> {
        match &self.body {
            NodeBody::Scalar(s) => Ok(s),
            _ => bail!(TypeMismatch, "{} is not a scalar", self.ty),
        }
    }

    pub fn as_array(&self) -> Result<&[NodeId]> {
        match &self.body {
            NodeBody::Array(elems) => Ok(elems),
            _ => bail!(TypeMismatch, "{} is not an array", self.ty),
        }
    }

    pub fn as_record(&self) -> Result<&Record> {
        match &self.body {
            NodeBody::Record(r) => Ok(r),
            _ => bail!(TypeMismatch, "{} is not a record", self.ty),
        }
    }
}

impl Record {
    pub fn fields(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.fields.iter().map(|(name, id)| (name.as_str(), *id))
    }

    pub fn field(&self, name: &str) -> Option<NodeId> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, id)| *id)
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn io(&self) -> Option<StreamId> {
        self.io
    }

    /// Memoised instance value, if it has been forced already.
    pub fn instance(&self, name: &str) -> Option<&Value> {
        match self.instances.get(name) {
            Some(InstanceSlot::Ready(v)) => Some(v),
            _ => None,
        }
    }
}


/// Arena parse tree. Nodes are created exclusively by the parser (or the
/// host's builder calls when preparing serializer input); streams live here
/// so lazy instances can still read them after the parse returns.
#[derive(Debug, Clone, Default)]
pub struct Tree {
    nodes: Vec<Node>,
    streams: Vec<BitStream>,
}

impl Tree {
    pub fn new() -> Self {
        Tree::default()
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn push_scalar(
        &mut self,
        parent: Option<NodeId>,
        ty: impl Into<String>,
        scalar: Scalar,
    ) -> NodeId {
        self.push(Node {
            parent,
            ty: ty.into(),
            raw: None,
            body: NodeBody::Scalar(scalar),
        })
    }

    pub fn push_record(
        &mut self,
        parent: Option<NodeId>,
        ty: impl Into<String>,
    ) -> NodeId {
        self.push(Node {
            parent,
            ty: ty.into(),
            raw: None,
            body: NodeBody::Record(Record::default()),
        })
    }

    pub fn push_array(
        &mut self,
        parent: Option<NodeId>,
        ty: impl Into<String>,
    ) -> NodeId {
        self.push(Node {
            parent,
            ty: ty.into(),
            raw: None,
            body: NodeBody::Array(Vec::new()),
        })
    }

    pub fn add_field(&mut self, record: NodeId, name: impl Into<String>, child: NodeId) {
        match &mut self.get_mut(record).body {
            NodeBody::Record(r) => r.fields.push((name.into(), child)),
            _ => panic!("add_field on non-record node"),
        }
    }

    pub fn add_elem(&mut self, array: NodeId, child: NodeId) {
        match &mut self.get_mut(array).body {
            NodeBody::Array(elems) => elems.push(child),
            _ => panic!("add_elem on non-array node"),
        }
    }

    pub(crate) fn set_raw(&mut self, id: NodeId, raw: Vec<u8>) {
        self.get_mut(id).raw = Some(raw);
    }

    pub(crate) fn record_mut(&mut self, id: NodeId) -> &mut Record {
        match &mut self.get_mut(id).body {
            NodeBody::Record(r) => r,
            _ => panic!("record_mut on non-record node"),
        }
    }

    pub(crate) fn add_stream(&mut self, stream: BitStream) -> StreamId {
        let id = StreamId(self.streams.len() as u32);
        self.streams.push(stream);
        id
    }

    pub fn stream(&self, id: StreamId) -> &BitStream {
        &self.streams[id.0 as usize]
    }

    pub(crate) fn stream_mut(&mut self, id: StreamId) -> &mut BitStream {
        &mut self.streams[id.0 as usize]
    }

    /// Indented listing of the whole tree, for diagnostics.
    pub fn pretty_fmt(&self) -> String {
        let mut lines = Vec::new();
        if !self.is_empty() {
            self.fmt_node(self.root(), None, 0, &mut lines);
        }
        lines.join("\n")
    }

    fn fmt_node(
        &self,
        id: NodeId,
        name: Option<&str>,
        indent: usize,
        lines: &mut Vec<String>,
    ) {
        let node = self.get(id);
        let mut line = "    ".repeat(indent);
        if let Some(name) = name {
            write!(&mut line, "{}: ", name).unwrap();
        }
        match &node.body {
            NodeBody::Scalar(s) => {
                write!(&mut line, "{} ({})", s.render(), node.ty).unwrap();
                lines.push(line);
            }
            NodeBody::Array(elems) => {
                write!(&mut line, "array of {} ({})", elems.len(), node.ty).unwrap();
                lines.push(line);
                for (i, elem) in elems.iter().enumerate() {
                    let idx = i.to_string();
                    self.fmt_node(*elem, Some(&idx), indent + 1, lines);
                }
            }
            NodeBody::Record(r) => {
                write!(&mut line, "record ({})", node.ty).unwrap();
                lines.push(line);
                for (field_name, field_id) in &r.fields {
                    self.fmt_node(*field_id, Some(field_name), indent + 1, lines);
                }
            }
        }
    }
}


#[test]
fn test_int_encoding_respects_width() {
    assert_eq!(encode_int(1, true, 2, false).unwrap(), vec![1, 0]);
    assert_eq!(encode_int(1, true, 2, true).unwrap(), vec![0, 1]);
    assert_eq!(encode_int(-1, false, 1, false).unwrap(), vec![0xFF]);
    assert_eq!(
        encode_int(256, true, 1, false).unwrap_err().kind(),
        crate::error::ErrorKind::RangeError,
    );
    assert_eq!(
        encode_int(-129, false, 1, false).unwrap_err().kind(),
        crate::error::ErrorKind::RangeError,
    );
    assert_eq!(
        encode_int(u64::MAX as i128, true, 8, true).unwrap(),
        vec![0xFF; 8],
    );
}

#[test]
fn test_bcd_packing() {
    assert_eq!(encode_bcd(1234, 2).unwrap(), vec![0x12, 0x34]);
    assert_eq!(encode_bcd(7, 2).unwrap(), vec![0x00, 0x07]);
    assert_eq!(
        encode_bcd(10000, 2).unwrap_err().kind(),
        crate::error::ErrorKind::RangeError,
    );
}

#[test]
fn test_scalar_comparisons() {
    let a = Scalar::Int { v: 5, unsigned: true, width: 4 };
    let b = Scalar::Float { v: 5.0, width: 8 };
    assert!(a.try_eq(&b).unwrap());
    assert_eq!(a.try_cmp(&Scalar::int(9)).unwrap(), Ordering::Less);

    let e = Scalar::Enum {
        enum_name: "entry_type".to_owned(),
        label: Some("text".to_owned()),
        v: 1,
    };
    assert!(e.try_eq(&Scalar::int(1)).unwrap());
    assert!(e
        .try_eq(&Scalar::Str { text: "text".to_owned(), encoding: "UTF-8".to_owned() })
        .unwrap());
    assert!(!e
        .try_eq(&Scalar::Str { text: "binary".to_owned(), encoding: "UTF-8".to_owned() })
        .unwrap());

    let err = a
        .try_eq(&Scalar::Bytes(vec![5]))
        .unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::TypeMismatch);
}

#[test]
fn test_tree_building_and_lookup() {
    let mut tree = Tree::new();
    let root = tree.push_record(None, "top");
    let child = tree.push_scalar(
        Some(root),
        "u1",
        Scalar::Int { v: 7, unsigned: true, width: 1 },
    );
    tree.add_field(root, "n", child);

    assert_eq!(tree.root(), root);
    let rec = tree.get(root).as_record().unwrap();
    assert_eq!(rec.field("n"), Some(child));
    assert_eq!(rec.field("missing"), None);
    assert_eq!(tree.get(child).parent(), Some(root));
    assert!(tree.pretty_fmt().contains("n: 7 (u1)"));
}
