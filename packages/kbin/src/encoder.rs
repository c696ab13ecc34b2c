//! The serializer: walks a schema plus a parse tree and emits the bytes
//! the parser would read back into that tree.
//!
//! Fields carrying their original raw bytes are written verbatim whenever
//! the decoder would still read them back to the value at hand; this is
//! what keeps round-trips byte-identical through lossy decoders and
//! recompression.

use crate::{
    encoding,
    error::{bail, ensure, Result},
    expr::eval::{self, Frame},
    limits::{CancelToken, Limits},
    process::Processor,
    schema::{self, Attribute, Endian, Schema, SwitchSpec, TypeRef, TypeRefSpec},
    stream::BitWriter,
    value::{encode_bcd, encode_int, NodeId, Scalar, Tree},
    decoder::Vm,
};
use tracing::debug;


/// Serialize `tree` against `schema`, starting at `root` (`None` for the
/// schema's own top level).
pub(crate) fn serialize(
    schema: &Schema,
    root: Option<&str>,
    tree: &Tree,
    limits: Limits,
    cancel: CancelToken,
) -> Result<Vec<u8>> {
    let root_path = schema::root_type_path(schema, root)?;
    ensure!(!tree.is_empty(), TypeMismatch, "cannot serialize an empty tree");
    let mut vm = Vm::from_tree(schema, tree.clone(), limits, cancel);
    let mut out = BitWriter::new();
    debug!(nodes = tree.len(), "serialize start");
    let root_id = vm.tree.root();
    encode_record(&mut vm, &root_path, root_id, &mut out)?;
    let bytes = out.into_bytes();
    debug!(len = bytes.len(), "serialize done");
    Ok(bytes)
}

fn encode_record(
    vm: &mut Vm,
    type_path: &[String],
    record: NodeId,
    out: &mut BitWriter,
) -> Result<()> {
    let schema = vm.schema;
    let ts = match schema::walk_path(&schema.root, type_path) {
        Some(ts) => ts,
        None => bail!(Internal, "dangling type path {:?}", type_path),
    };
    for attr in &ts.seq {
        vm.cancel.check()?;
        let name = match attr.id {
            Some(ref id) => id.as_str(),
            None => bail!(CompileError, "seq attribute has no id"),
        };
        encode_attribute(vm, attr, name, type_path, record, out)
            .map_err(|e| e.at_path(name))?;
    }
    // record boundary flushes any pending bit group
    out.flush_bits();
    Ok(())
}

fn encode_attribute(
    vm: &mut Vm,
    attr: &Attribute,
    name: &str,
    type_path: &[String],
    record: NodeId,
    out: &mut BitWriter,
) -> Result<()> {
    let frame = Frame { cur: Some(record), ..Frame::default() };

    if let Some(ref cond) = attr.if_expr {
        let v = eval::eval_source(vm, &frame, cond.as_str())?;
        if !eval::truthy(vm, &v)? {
            return Ok(());
        }
    }

    let field = match vm.tree.get(record).as_record()?.field(name) {
        Some(field) => field,
        None => bail!(
            TypeMismatch,
            "input record has no field {:?}",
            name,
        ),
    };

    if attr.repeat.is_some() {
        let elems = vm.tree.get(field).as_array()?.to_vec();
        vm.limits.check_elements(elems.len() as u64)?;
        for elem in elems {
            vm.cancel.check()?;
            encode_value(vm, attr, type_path, record, elem, out)?;
        }
        return Ok(());
    }
    encode_value(vm, attr, type_path, record, field, out)
}

fn encode_value(
    vm: &mut Vm,
    attr: &Attribute,
    type_path: &[String],
    record: NodeId,
    node: NodeId,
    out: &mut BitWriter,
) -> Result<()> {
    let frame = Frame { cur: Some(record), ..Frame::default() };
    let schema = vm.schema;
    let scope = schema::scope_chain(&schema.root, type_path);

    // the literal wins regardless of input
    if let Some(ref contents) = attr.contents {
        out.write_bytes(&contents.to_bytes());
        return Ok(());
    }

    let ty = match attr.ty {
        None => TypeRef::Bytes,
        Some(TypeRefSpec::Name(ref name)) => TypeRef::parse(name)?,
        Some(TypeRefSpec::Switch(ref sw)) => {
            let chosen = derive_case(vm, sw, &frame)?;
            TypeRef::parse(&chosen)?
        }
    };

    match ty {
        TypeRef::UInt { width, endian } | TypeRef::SInt { width, endian } => {
            let big = vm.pick_endian(endian, &scope, width)?;
            let unsigned = matches!(ty, TypeRef::UInt { .. });
            let v = coerce_int(vm.tree.get(node).as_scalar()?)?;
            out.write_bytes(&encode_int(v, unsigned, width, big)?);
        }
        TypeRef::Float { width, endian } => {
            let big = vm.pick_endian(endian, &scope, width)?;
            let v = vm.tree.get(node).as_scalar()?.as_f64()?;
            out.write_bytes(&Scalar::Float { v, width }.to_bytes(big)?);
        }
        TypeRef::Bits { width } => {
            let big = schema::effective_bit_endian(&scope) == Endian::Be;
            let v = coerce_int(vm.tree.get(node).as_scalar()?)?;
            let max = if width == 64 { u64::MAX as i128 } else { (1i128 << width) - 1 };
            ensure!(
                v >= 0 && v <= max,
                RangeError,
                "{} does not fit b{}",
                v,
                width,
            );
            out.write_bits_int(v as u64, width as u32, big);
        }
        TypeRef::Bcd { width } => {
            let v = coerce_int(vm.tree.get(node).as_scalar()?)?;
            ensure!(v >= 0, RangeError, "{} is not valid BCD", v);
            out.write_bytes(&encode_bcd(v as u64, width)?);
        }
        TypeRef::Str { z } => {
            let (text, enc) = match vm.tree.get(node).as_scalar()? {
                &Scalar::Str { ref text, ref encoding } => {
                    (text.clone(), encoding.clone())
                }
                other => bail!(
                    TypeMismatch,
                    "{} where a string was expected",
                    other.type_name(),
                ),
            };
            let enc = attr.encoding.clone().unwrap_or(enc);
            let value_bytes = encoding::encode(&text, &enc)?;
            encode_delimited(vm, attr, &frame, node, z, value_bytes, out)?;
        }
        TypeRef::Bytes => {
            let value_bytes = match vm.tree.get(node).as_scalar()? {
                &Scalar::Bytes(ref b) => b.clone(),
                other => bail!(
                    TypeMismatch,
                    "{} where bytes were expected",
                    other.type_name(),
                ),
            };
            encode_delimited(vm, attr, &frame, node, false, value_bytes, out)?;
        }
        TypeRef::User { ref name, .. } => {
            encode_user(vm, attr, &frame, name, type_path, node, out)?;
        }
    }

    if let Some(ref valid) = attr.valid {
        vm.check_valid(valid, record, node)?;
    }
    Ok(())
}

/// Emit a `str`/`bytes` field: reuse the node's raw window when the
/// decoder would read it back to the value being written, otherwise build
/// a fresh window (terminator, padding) and run the inverse processor.
fn encode_delimited(
    vm: &mut Vm,
    attr: &Attribute,
    frame: &Frame,
    node: NodeId,
    z: bool,
    value_bytes: Vec<u8>,
    out: &mut BitWriter,
) -> Result<()> {
    let term = attr.terminator.or(if z { Some(0) } else { None });
    let sized = attr.size.is_some() || attr.size_eos;
    let processor = vm.build_processor(attr, frame)?;
    let declared_size = match attr.size {
        Some(ref size) => {
            let n = eval::eval_source(vm, frame, size.as_str())?;
            let n = eval::scalarize(vm, &n)?.as_int()?;
            ensure!(n >= 0, RangeError, "negative size {}", n);
            Some(n as usize)
        }
        None => None,
    };

    if let Some(raw) = vm.tree.get(node).raw().map(<[u8]>::to_vec) {
        if reads_back_to(&processor, &raw, term, sized, attr.include, &value_bytes)
            && declared_size.map_or(true, |n| raw.len() == n)
        {
            out.write_bytes(&raw);
            if !sized && attr.consume && !attr.include {
                if let Some(term) = term {
                    out.write_bytes(&[term]);
                }
            }
            return Ok(());
        }
    }

    // fresh window in the decoded domain
    let mut window = value_bytes;
    if sized {
        if let Some(n) = declared_size {
            if window.len() < n {
                if let Some(term) = term {
                    if !attr.include {
                        window.push(term);
                    }
                }
            }
            ensure!(
                window.len() <= n,
                RangeError,
                "{} bytes do not fit declared size {}",
                window.len(),
                n,
            );
            window.resize(n, 0);
        }
        let emitted = unapply(&processor, &window)?;
        out.write_bytes(&emitted);
        return Ok(());
    }

    let emitted = unapply(&processor, &window)?;
    out.write_bytes(&emitted);
    if attr.consume && !attr.include {
        if let Some(term) = term {
            out.write_bytes(&[term]);
        }
    }
    Ok(())
}

/// Would the decoder turn this raw window back into exactly `value_bytes`?
fn reads_back_to(
    processor: &Option<Processor>,
    raw: &[u8],
    term: Option<u8>,
    sized: bool,
    include: bool,
    value_bytes: &[u8],
) -> bool {
    let mut processed = match processor {
        Some(p) => match p.apply(raw) {
            Ok(processed) => processed,
            Err(_) => return false,
        },
        None => raw.to_vec(),
    };
    if sized {
        if let Some(term) = term {
            if let Some(at) = processed.iter().position(|&b| b == term) {
                processed.truncate(at + include as usize);
            }
        }
    }
    processed == value_bytes
}

fn unapply(processor: &Option<Processor>, window: &[u8]) -> Result<Vec<u8>> {
    match processor {
        Some(p) => p.unapply(window),
        None => Ok(window.to_vec()),
    }
}

fn encode_user(
    vm: &mut Vm,
    attr: &Attribute,
    frame: &Frame,
    name: &str,
    type_path: &[String],
    node: NodeId,
    out: &mut BitWriter,
) -> Result<()> {
    let schema = vm.schema;
    let target_path = match schema::resolve_type_path(&schema.root, type_path, name)
    {
        Some(path) => path,
        None => bail!(UnknownType, "no type {:?} in scope", name),
    };

    if !(attr.size.is_some() || attr.size_eos) {
        ensure!(
            attr.process.is_none(),
            CompileError,
            "process requires a size or size-eos to delimit its output",
        );
        return encode_record(vm, &target_path, node, out);
    }

    // sized sub-stream: encode inner bytes, pad, invert the processor
    let mut sub = BitWriter::new();
    encode_record(vm, &target_path, node, &mut sub)?;
    let inner = sub.into_bytes();

    let processor = vm.build_processor(attr, frame)?;
    let declared_size = match attr.size {
        Some(ref size) => {
            let n = eval::eval_source(vm, frame, size.as_str())?;
            let n = eval::scalarize(vm, &n)?.as_int()?;
            ensure!(n >= 0, RangeError, "negative size {}", n);
            Some(n as usize)
        }
        None => None,
    };

    if let Some(raw) = vm.tree.get(node).raw().map(<[u8]>::to_vec) {
        let processed = match processor {
            Some(ref p) => p.apply(&raw),
            None => Ok(raw.clone()),
        };
        if let Ok(processed) = processed {
            // the original window may carry unparsed padding beyond the
            // inner bytes; reuse it while it still embeds them
            if processed.len() >= inner.len()
                && processed[..inner.len()] == inner[..]
                && declared_size.map_or(true, |n| raw.len() == n)
            {
                out.write_bytes(&raw);
                return Ok(());
            }
        }
    }

    let mut window = inner;
    if let Some(n) = declared_size {
        ensure!(
            window.len() <= n,
            RangeError,
            "{} bytes do not fit declared size {}",
            window.len(),
            n,
        );
        window.resize(n, 0);
    }
    let emitted = unapply(&processor, &window)?;
    if let Some(n) = declared_size {
        ensure!(
            emitted.len() == n,
            RangeError,
            "processed output is {} bytes, declared size is {}",
            emitted.len(),
            n,
        );
    }
    out.write_bytes(&emitted);
    Ok(())
}

/// The writer must know which case was chosen; a selector that cannot be
/// evaluated from the input alone is ambiguous.
fn derive_case(vm: &mut Vm, sw: &SwitchSpec, frame: &Frame) -> Result<String> {
    let sel = match eval::eval_source(vm, frame, sw.switch_on.as_str()) {
        Ok(sel) => sel,
        Err(e) => bail!(
            AmbiguousCase,
            "switch selector not derivable from input: {}",
            e.message(),
        ),
    };
    let sel = eval::scalarize(vm, &sel)?;
    let mut fallback = None;
    for (key, ty) in &sw.cases {
        if key == "_" {
            fallback = Some(ty.clone());
            continue;
        }
        let key_val = match eval::eval_source(vm, frame, key) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let key_scalar = eval::scalarize(vm, &key_val)?;
        if sel.try_eq(&key_scalar).unwrap_or(false) {
            return Ok(ty.clone());
        }
    }
    match fallback {
        Some(ty) => Ok(ty),
        None => bail!(SwitchNoMatch, "selector {} matched no case", sel.render()),
    }
}

fn coerce_int(s: &Scalar) -> Result<i128> {
    match s {
        &Scalar::Float { v, .. } => {
            ensure!(
                v.fract() == 0.0,
                RangeError,
                "{} has a fractional part",
                v,
            );
            Ok(v as i128)
        }
        other => other.as_int(),
    }
}


#[cfg(test)]
fn schema_of(v: serde_json::Value) -> Schema {
    serde_json::from_value(v).unwrap()
}

#[cfg(test)]
fn round_trip(schema: &Schema, bytes: &[u8]) -> Vec<u8> {
    let tree = crate::decoder::parse(
        schema, None, bytes, Limits::default(), CancelToken::new(),
    )
    .unwrap();
    serialize(schema, None, &tree, Limits::default(), CancelToken::new()).unwrap()
}

#[test]
fn test_round_trip_fixed_header() {
    let schema = schema_of(serde_json::json!({
        "seq": [
            {"id": "magic", "contents": [0x4B, 0x42, 0x49, 0x4E]},
            {"id": "ver", "type": "u2le"},
            {"id": "len", "type": "u1"},
            {"id": "msg", "type": "str", "size": "len", "encoding": "UTF-8"},
        ],
    }));
    let input = [
        0x4B, 0x42, 0x49, 0x4E, 0x01, 0x00, 0x05, 0x48, 0x65, 0x6C, 0x6C, 0x6F,
    ];
    assert_eq!(round_trip(&schema, &input), input);
}

#[test]
fn test_round_trip_bit_fields() {
    let schema = schema_of(serde_json::json!({
        "seq": [
            {"id": "a", "type": "b3"},
            {"id": "b", "type": "b4"},
            {"id": "c", "type": "b2"},
            {"id": "d", "type": "b7"},
        ],
    }));
    let input = [0xB4, 0x5A];
    assert_eq!(round_trip(&schema, &input), input);

    let le = schema_of(serde_json::json!({
        "meta": {"bit-endian": "le"},
        "seq": [
            {"id": "a", "type": "b3"},
            {"id": "b", "type": "b13"},
        ],
    }));
    let input = [0xC7, 0x59];
    assert_eq!(round_trip(&le, &input), input);
}

#[test]
fn test_round_trip_repeats_and_strz() {
    let schema = schema_of(serde_json::json!({
        "seq": [
            {"id": "vals", "type": "u1", "repeat": "until", "repeat-until": "_ == 0"},
            {"id": "name", "type": "strz"},
            {"id": "rest", "type": "u2be", "repeat": "eos"},
        ],
    }));
    let input = [0x01, 0x02, 0x00, b'h', b'i', 0x00, 0x12, 0x34, 0x56, 0x78];
    assert_eq!(round_trip(&schema, &input), input);
}

#[test]
fn test_round_trip_switch_and_enum() {
    let schema = schema_of(serde_json::json!({
        "enums": {"entry_type": {"1": "text", "2": "binary"}},
        "seq": [
            {"id": "t", "type": "u1", "enum": "entry_type"},
            {"id": "sz", "type": "u2be"},
            {
                "id": "p",
                "size": "sz",
                "encoding": "ASCII",
                "type": {
                    "switch-on": "t",
                    "cases": {
                        "entry_type::text": "str",
                        "_": "bytes",
                    },
                },
            },
        ],
    }));
    let input = [0x01, 0x00, 0x06, 0x6B, 0x61, 0x69, 0x74, 0x61, 0x69];
    assert_eq!(round_trip(&schema, &input), input);
    let input = [0x09, 0x00, 0x02, 0xAB, 0xCD];
    assert_eq!(round_trip(&schema, &input), input);
}

#[test]
fn test_round_trip_sized_user_type_with_padding() {
    let schema = schema_of(serde_json::json!({
        "types": {
            "one": {"seq": [{"id": "n", "type": "u1"}]},
        },
        "seq": [
            {"id": "head", "type": "one", "size": 3},
            {"id": "tail", "type": "u1"},
        ],
    }));
    // the sub-stream carries two padding bytes the inner type never reads
    let input = [0x07, 0xDE, 0xAD, 0x42];
    assert_eq!(round_trip(&schema, &input), input);
}

#[test]
fn test_round_trip_process_xor_and_rol() {
    let schema = schema_of(serde_json::json!({
        "seq": [
            {"id": "a", "type": "bytes", "size": 3, "process": "xor(0x5f)"},
            {"id": "b", "type": "bytes", "size": 2, "process": "rol(3)"},
        ],
    }));
    let input = [0x01, 0x02, 0x03, 0x81, 0x42];
    assert_eq!(round_trip(&schema, &input), input);
}

#[test]
fn test_round_trip_zlib_reuses_raw() {
    let compressed = Processor::Zlib.unapply(b"hello hello hello").unwrap();
    let schema = schema_of(serde_json::json!({
        "seq": [
            {"id": "z", "type": "bytes", "size-eos": true, "process": "zlib"},
        ],
    }));
    assert_eq!(round_trip(&schema, &compressed), compressed);
}

#[test]
fn test_round_trip_sized_str_keeps_padding() {
    let schema = schema_of(serde_json::json!({
        "seq": [
            {"id": "name", "type": "strz", "size": 6},
            {"id": "tail", "type": "u1"},
        ],
    }));
    let input = [b'h', b'i', 0x00, 0xAA, 0xBB, 0xCC, 0x42];
    assert_eq!(round_trip(&schema, &input), input);
}

#[test]
fn test_instances_are_not_written() {
    let schema = schema_of(serde_json::json!({
        "seq": [{"id": "a", "type": "u1"}],
        "instances": {"double": {"value": "a * 2"}},
    }));
    let input = [0x15];
    let mut tree = crate::decoder::parse(
        &schema, None, &input, Limits::default(), CancelToken::new(),
    )
    .unwrap();
    let root = tree.root();
    crate::decoder::force_instance_in(
        &schema, &mut tree, root, "double",
        Limits::default(), CancelToken::new(),
    )
    .unwrap();
    let out = serialize(&schema, None, &tree, Limits::default(), CancelToken::new())
        .unwrap();
    assert_eq!(out, input);
}

#[test]
fn test_host_tree_range_errors() {
    let schema = schema_of(serde_json::json!({
        "seq": [{"id": "n", "type": "u1"}],
    }));
    let mut tree = Tree::new();
    let root = tree.push_record(None, "root");
    let n = tree.push_scalar(Some(root), "u1", Scalar::int(300));
    tree.add_field(root, "n", n);
    let err = serialize(&schema, None, &tree, Limits::default(), CancelToken::new())
        .unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::RangeError);
    assert_eq!(err.path(), Some("n"));

    let mut tree = Tree::new();
    let root = tree.push_record(None, "root");
    let n = tree.push_scalar(Some(root), "f8", Scalar::Float { v: 1.5, width: 8 });
    tree.add_field(root, "n", n);
    let err = serialize(&schema, None, &tree, Limits::default(), CancelToken::new())
        .unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::RangeError);
}

#[test]
fn test_serializer_rechecks_valid() {
    let schema = schema_of(serde_json::json!({
        "seq": [{"id": "n", "type": "u1", "valid": {"max": 10}}],
    }));
    let mut tree = Tree::new();
    let root = tree.push_record(None, "root");
    let n = tree.push_scalar(Some(root), "u1", Scalar::int(99));
    tree.add_field(root, "n", n);
    let err = serialize(&schema, None, &tree, Limits::default(), CancelToken::new())
        .unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::ValidationFailed);
}

#[test]
fn test_underivable_selector_is_ambiguous() {
    let schema = schema_of(serde_json::json!({
        "seq": [
            {
                "id": "v",
                "type": {"switch-on": "k", "cases": {"1": "u1"}},
            },
        ],
    }));
    let mut tree = Tree::new();
    let root = tree.push_record(None, "root");
    let v = tree.push_scalar(Some(root), "u1", Scalar::int(7));
    tree.add_field(root, "v", v);
    let err = serialize(&schema, None, &tree, Limits::default(), CancelToken::new())
        .unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::AmbiguousCase);
}

#[test]
fn test_contents_written_from_literal() {
    let schema = schema_of(serde_json::json!({
        "seq": [{"id": "magic", "contents": "OK"}],
    }));
    let mut tree = Tree::new();
    let root = tree.push_record(None, "root");
    let magic = tree.push_scalar(Some(root), "bytes", Scalar::Bytes(b"NO".to_vec()));
    tree.add_field(root, "magic", magic);
    let out = serialize(&schema, None, &tree, Limits::default(), CancelToken::new())
        .unwrap();
    assert_eq!(out, b"OK");
}

#[test]
fn test_reencoded_string_after_edit() {
    let schema = schema_of(serde_json::json!({
        "seq": [
            {"id": "len", "type": "u1"},
            {"id": "msg", "type": "str", "size": "len", "encoding": "ASCII"},
        ],
    }));
    let mut tree = Tree::new();
    let root = tree.push_record(None, "root");
    let len = tree.push_scalar(
        Some(root),
        "u1",
        Scalar::Int { v: 5, unsigned: true, width: 1 },
    );
    tree.add_field(root, "len", len);
    let msg = tree.push_scalar(
        Some(root),
        "str",
        Scalar::Str { text: "world".to_owned(), encoding: "ASCII".to_owned() },
    );
    tree.add_field(root, "msg", msg);
    let out = serialize(&schema, None, &tree, Limits::default(), CancelToken::new())
        .unwrap();
    assert_eq!(out, b"\x05world");
}
