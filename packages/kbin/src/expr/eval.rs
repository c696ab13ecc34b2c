//! Evaluation of compiled expressions.
//!
//! Expressions run against the interpreter's `Vm`: plain identifiers
//! resolve through the current record (fields, then parameters, then
//! instances, forcing them on demand), then through the host activation.
//! All dispatch is total over the value sum; impossible combinations come
//! back as `TypeMismatch`, never panics.

use crate::{
    decoder::Vm,
    encoding,
    error::{bail, ensure, Result},
    schema::{self, TypeRef},
    value::{NodeBody, NodeId, Scalar, StreamId, Value},
};
use super::{
    ast::{BinOp, Expr, UnaryOp},
    cache,
};
use std::collections::HashMap;


/// Host-facing binding environment for the public `evaluate` API.
#[derive(Debug, Clone, Default)]
pub struct Activation {
    vars: HashMap<String, Value>,
}

impl Activation {
    pub fn new() -> Self {
        Activation::default()
    }

    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(name.into(), value.into());
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }
}

/// Per-evaluation implicit bindings.
#[derive(Debug, Clone, Default)]
pub(crate) struct Frame {
    /// Record whose fields plain identifiers resolve against.
    pub cur: Option<NodeId>,
    /// What `_` means right now; defaults to `cur`. Repeat-until binds the
    /// last element here, `valid` binds the value under validation.
    pub self_val: Option<Value>,
    /// `_index` inside a repeat.
    pub index: Option<i128>,
    /// `_io` override; defaults to the current record's stream.
    pub io: Option<StreamId>,
}

pub(crate) fn eval_source(vm: &mut Vm, frame: &Frame, src: &str) -> Result<Value> {
    let expr = cache::compile(src)?;
    eval(vm, frame, &expr)
}

pub(crate) fn eval(vm: &mut Vm, frame: &Frame, expr: &Expr) -> Result<Value> {
    Ok(match expr {
        &Expr::Int(v) => Scalar::int(v).into(),
        &Expr::Float(v) => Scalar::Float { v, width: 8 }.into(),
        &Expr::Str(ref s) => Scalar::Str {
            text: s.clone(),
            encoding: "UTF-8".to_owned(),
        }
        .into(),
        &Expr::Bool(b) => Scalar::Bool(b).into(),
        &Expr::Null => Value::Null,
        &Expr::SelfVal => match (&frame.self_val, frame.cur) {
            (&Some(ref v), _) => v.clone(),
            (&None, Some(cur)) => Value::Node(cur),
            (&None, None) => bail!(UnknownIdentifier, "_ is not bound here"),
        },
        &Expr::Io => Value::Stream(io_of(vm, frame)?),
        &Expr::Parent => match frame.cur {
            Some(cur) => match vm.tree.get(cur).parent() {
                Some(parent) => Value::Node(parent),
                None => Value::Null,
            },
            None => bail!(UnknownIdentifier, "_parent is not bound here"),
        },
        &Expr::Root => {
            ensure!(
                !vm.tree.is_empty(),
                UnknownIdentifier,
                "_root is not bound here",
            );
            Value::Node(vm.tree.root())
        }
        &Expr::IndexVar => match frame.index {
            Some(i) => Scalar::int(i).into(),
            None => bail!(UnknownIdentifier, "_index outside a repeat"),
        },
        &Expr::BytesRemaining => {
            let stream = vm.tree.stream(io_of(vm, frame)?);
            Scalar::Int {
                v: stream.remaining() as i128,
                unsigned: true,
                width: 8,
            }
            .into()
        }
        &Expr::Ident(ref name) => resolve_ident(vm, frame, name)?,
        &Expr::EnumConst { ref enum_path, ref label } => {
            resolve_enum_const(vm, frame, enum_path, label)?
        }
        &Expr::Array(ref elems) => {
            let mut bytes = Vec::with_capacity(elems.len());
            for elem in elems {
                let v = eval(vm, frame, elem)?;
                let n = scalarize(vm, &v)?.as_int()?;
                ensure!(
                    (0..=255).contains(&n),
                    TypeMismatch,
                    "array literal element {} is not a byte",
                    n,
                );
                bytes.push(n as u8);
            }
            Scalar::Bytes(bytes).into()
        }
        &Expr::Unary(op, ref inner) => {
            let v = eval(vm, frame, inner)?;
            unary(vm, op, &v)?
        }
        &Expr::Binary(op, ref lhs, ref rhs) => binary(vm, frame, op, lhs, rhs)?,
        &Expr::Ternary { ref cond, ref then, ref otherwise } => {
            let c = eval(vm, frame, cond)?;
            if scalarize(vm, &c)?.as_bool()? {
                eval(vm, frame, then)?
            } else {
                eval(vm, frame, otherwise)?
            }
        }
        &Expr::Field(ref recv, ref name) => {
            let recv = eval(vm, frame, recv)?;
            member(vm, recv, name, None)?
        }
        &Expr::Call { ref recv, ref method, ref args } => {
            let recv = eval(vm, frame, recv)?;
            let mut arg_vals = Vec::with_capacity(args.len());
            for arg in args {
                arg_vals.push(eval(vm, frame, arg)?);
            }
            member(vm, recv, method, Some(arg_vals))?
        }
        &Expr::Index(ref recv, ref index) => {
            let recv = eval(vm, frame, recv)?;
            let idx = eval(vm, frame, index)?;
            let idx = scalarize(vm, &idx)?.as_int()?;
            index_value(vm, &recv, idx)?
        }
        &Expr::Cast { ref recv, ref target } => {
            let recv = eval(vm, frame, recv)?;
            cast(vm, recv, target)?
        }
        &Expr::SizeOf(ref inner) => {
            let v = eval(vm, frame, inner)?;
            Scalar::int(byte_size_of(vm, &v)?).into()
        }
        &Expr::AlignOf(ref inner) => {
            eval(vm, frame, inner)?;
            Scalar::int(1).into()
        }
    })
}

/// Resolve a value down to a scalar, reading through the arena.
pub(crate) fn scalarize(vm: &Vm, value: &Value) -> Result<Scalar> {
    Ok(match value {
        Value::Scalar(s) => s.clone(),
        &Value::Node(id) => match vm.tree.get(id).body() {
            NodeBody::Scalar(s) => s.clone(),
            NodeBody::Array(_) => bail!(TypeMismatch, "array used as a scalar"),
            NodeBody::Record(_) => bail!(
                TypeMismatch,
                "record {} used as a scalar",
                vm.tree.get(id).type_name(),
            ),
        },
        Value::Stream(_) => bail!(TypeMismatch, "stream used as a scalar"),
        Value::Null => bail!(TypeMismatch, "null used as a scalar"),
    })
}

pub(crate) fn truthy(vm: &Vm, value: &Value) -> Result<bool> {
    scalarize(vm, value)?.as_bool()
}

fn io_of(vm: &Vm, frame: &Frame) -> Result<StreamId> {
    if let Some(io) = frame.io {
        return Ok(io);
    }
    if let Some(cur) = frame.cur {
        if let NodeBody::Record(rec) = vm.tree.get(cur).body() {
            if let Some(io) = rec.io() {
                return Ok(io);
            }
        }
    }
    bail!(UnknownIdentifier, "_io is not bound here")
}

fn resolve_ident(vm: &mut Vm, frame: &Frame, name: &str) -> Result<Value> {
    if let Some(cur) = frame.cur {
        let (field, param) = match vm.tree.get(cur).body() {
            NodeBody::Record(rec) => (rec.field(name), rec.param(name).cloned()),
            _ => (None, None),
        };
        if let Some(field) = field {
            return Ok(Value::Node(field));
        }
        if let Some(param) = param {
            return Ok(param);
        }
        if let Some(value) = vm.force_instance(cur, name)? {
            return Ok(value);
        }
    }
    if let Some(activation) = vm.activation {
        if let Some(value) = activation.get(name) {
            return Ok(value.clone());
        }
    }
    bail!(UnknownIdentifier, "no binding for {:?}", name)
}

fn resolve_enum_const(
    vm: &Vm,
    frame: &Frame,
    enum_path: &str,
    label: &str,
) -> Result<Value> {
    let scope = vm.scope_for(frame.cur);
    let spec = match schema::find_enum(&scope, enum_path) {
        Some(spec) => spec,
        None => bail!(UnknownEnum, "no enum {:?} in scope", enum_path),
    };
    let short = enum_path.rsplit("::").next().unwrap_or(enum_path);
    match spec.iter().find(|(_, l)| l.as_str() == label) {
        Some((&v, _)) => Ok(Scalar::Enum {
            enum_name: short.to_owned(),
            label: Some(label.to_owned()),
            v,
        }
        .into()),
        None => bail!(UnknownEnum, "enum {} has no label {:?}", enum_path, label),
    }
}

/// `recv.name` and `recv.name(args)`.
fn member(
    vm: &mut Vm,
    recv: Value,
    name: &str,
    args: Option<Vec<Value>>,
) -> Result<Value> {
    enum Shape {
        Record,
        Array,
        Scalar(Scalar),
    }
    match recv {
        Value::Node(id) => {
            let shape = match vm.tree.get(id).body() {
                NodeBody::Record(_) => Shape::Record,
                NodeBody::Array(_) => Shape::Array,
                NodeBody::Scalar(s) => Shape::Scalar(s.clone()),
            };
            match shape {
                Shape::Record => record_member(vm, id, name, args),
                Shape::Array => array_member(vm, id, name),
                Shape::Scalar(s) => scalar_member(vm, &s, name, args),
            }
        }
        Value::Stream(id) => {
            let stream = vm.tree.stream(id);
            Ok(match name {
                "size" => Scalar::Int {
                    v: stream.size() as i128,
                    unsigned: true,
                    width: 8,
                }
                .into(),
                "pos" => Scalar::Int {
                    v: stream.pos() as i128,
                    unsigned: true,
                    width: 8,
                }
                .into(),
                "eof" => Scalar::Bool(stream.eof()).into(),
                other => bail!(TypeMismatch, "streams have no member {:?}", other),
            })
        }
        Value::Scalar(s) => scalar_member(vm, &s, name, args),
        Value::Null => bail!(TypeMismatch, "member access on null"),
    }
}

fn record_member(
    vm: &mut Vm,
    id: NodeId,
    name: &str,
    args: Option<Vec<Value>>,
) -> Result<Value> {
    ensure!(
        args.is_none(),
        TypeMismatch,
        "records have no method {:?}",
        name,
    );
    let node = vm.tree.get(id);
    match name {
        "_io" => {
            let rec = node.as_record()?;
            return match rec.io() {
                Some(io) => Ok(Value::Stream(io)),
                None => bail!(UnknownIdentifier, "record has no backing stream"),
            };
        }
        "_parent" => {
            return Ok(match node.parent() {
                Some(parent) => Value::Node(parent),
                None => Value::Null,
            })
        }
        "_root" => return Ok(Value::Node(vm.tree.root())),
        _ => {}
    }
    let (field, param) = {
        let rec = node.as_record()?;
        (rec.field(name), rec.param(name).cloned())
    };
    if let Some(field) = field {
        return Ok(Value::Node(field));
    }
    if let Some(param) = param {
        return Ok(param);
    }
    if let Some(value) = vm.force_instance(id, name)? {
        return Ok(value);
    }
    bail!(
        UnknownIdentifier,
        "type {} has no field {:?}",
        vm.tree.get(id).type_name(),
        name,
    )
}

fn array_member(vm: &Vm, id: NodeId, name: &str) -> Result<Value> {
    let elems = vm.tree.get(id).as_array()?;
    Ok(match name {
        "size" | "length" => Scalar::int(elems.len() as i128).into(),
        "first" | "last" => {
            ensure!(
                !elems.is_empty(),
                RangeError,
                "{} of an empty array",
                name,
            );
            let elem = if name == "first" {
                elems[0]
            } else {
                elems[elems.len() - 1]
            };
            Value::Node(elem)
        }
        "min" | "max" => {
            ensure!(!elems.is_empty(), RangeError, "{} of an empty array", name);
            let want_max = name == "max";
            let mut best = scalarize(vm, &Value::Node(elems[0]))?;
            for &elem in &elems[1..] {
                let cand = scalarize(vm, &Value::Node(elem))?;
                let swap = match cand.try_cmp(&best)? {
                    std::cmp::Ordering::Greater => want_max,
                    std::cmp::Ordering::Less => !want_max,
                    std::cmp::Ordering::Equal => false,
                };
                if swap {
                    best = cand;
                }
            }
            best.into()
        }
        other => bail!(TypeMismatch, "arrays have no member {:?}", other),
    })
}

fn scalar_member(
    vm: &Vm,
    scalar: &Scalar,
    name: &str,
    args: Option<Vec<Value>>,
) -> Result<Value> {
    let args = args.unwrap_or_default();
    let arg_int = |i: usize| -> Result<i128> {
        scalarize(vm, &args[i])?.as_int()
    };
    Ok(match (scalar, name) {
        (&Scalar::Str { ref text, .. }, "length") => {
            Scalar::int(text.chars().count() as i128).into()
        }
        (&Scalar::Str { ref text, ref encoding }, "reverse") => Scalar::Str {
            text: text.chars().rev().collect(),
            encoding: encoding.clone(),
        }
        .into(),
        (&Scalar::Str { ref text, ref encoding }, "substring") => {
            ensure!(
                args.len() == 2,
                TypeMismatch,
                "substring takes (from, to)",
            );
            let (from, to) = (arg_int(0)?, arg_int(1)?);
            let len = text.chars().count() as i128;
            ensure!(
                0 <= from && from <= to && to <= len,
                RangeError,
                "substring({}, {}) out of range for length {}",
                from,
                to,
                len,
            );
            Scalar::Str {
                text: text
                    .chars()
                    .skip(from as usize)
                    .take((to - from) as usize)
                    .collect(),
                encoding: encoding.clone(),
            }
            .into()
        }
        (&Scalar::Str { ref text, .. }, "to_i") => {
            let radix = if args.is_empty() { 10 } else { arg_int(0)? };
            ensure!(
                (2..=36).contains(&radix),
                RangeError,
                "radix {} out of range",
                radix,
            );
            let trimmed = text.trim();
            match i128::from_str_radix(trimmed, radix as u32) {
                Ok(v) => Scalar::int(v).into(),
                Err(_) => bail!(
                    TypeMismatch,
                    "{:?} is not an integer in base {}",
                    text,
                    radix,
                ),
            }
        }
        (&Scalar::Str { .. }, "to_s") => scalar.clone().into(),
        (&Scalar::Bytes(ref b), "length") | (&Scalar::Bytes(ref b), "size") => {
            Scalar::int(b.len() as i128).into()
        }
        (&Scalar::Bytes(ref b), "first") | (&Scalar::Bytes(ref b), "last") => {
            ensure!(!b.is_empty(), RangeError, "{} of empty bytes", name);
            let byte = if name == "first" { b[0] } else { b[b.len() - 1] };
            Scalar::Int { v: byte as i128, unsigned: true, width: 1 }.into()
        }
        (&Scalar::Bytes(ref b), "to_s") => {
            ensure!(
                args.len() == 1,
                TypeMismatch,
                "bytes.to_s takes an encoding",
            );
            let enc = match scalarize(vm, &args[0])? {
                Scalar::Str { text, .. } => text,
                other => bail!(
                    TypeMismatch,
                    "encoding must be a string, got {}",
                    other.type_name(),
                ),
            };
            Scalar::Str {
                text: encoding::decode(b, &enc)?,
                encoding: enc,
            }
            .into()
        }
        (&Scalar::Int { v, .. }, "to_s") => Scalar::Str {
            text: v.to_string(),
            encoding: "UTF-8".to_owned(),
        }
        .into(),
        (&Scalar::Int { .. }, "to_i") => scalar.clone().into(),
        (&Scalar::Float { v, .. }, "to_i") => Scalar::int(v.trunc() as i128).into(),
        (&Scalar::Float { v, .. }, "to_s") => Scalar::Str {
            text: v.to_string(),
            encoding: "UTF-8".to_owned(),
        }
        .into(),
        (&Scalar::Enum { v, .. }, "to_i") => Scalar::int(v as i128).into(),
        (&Scalar::Bool(b), "to_i") => Scalar::int(b as i128).into(),
        (&Scalar::Bits { v, .. }, "to_i") | (&Scalar::Bcd { v, .. }, "to_i") => {
            Scalar::int(v as i128).into()
        }
        (s, other) => bail!(
            TypeMismatch,
            "{} has no method {:?}",
            s.type_name(),
            other,
        ),
    })
}

fn index_value(vm: &Vm, recv: &Value, idx: i128) -> Result<Value> {
    let scalar;
    let target = match recv {
        &Value::Node(id) => match vm.tree.get(id).body() {
            NodeBody::Array(elems) => {
                ensure!(
                    idx >= 0 && (idx as usize) < elems.len(),
                    RangeError,
                    "index {} out of range 0..{}",
                    idx,
                    elems.len(),
                );
                return Ok(Value::Node(elems[idx as usize]));
            }
            NodeBody::Scalar(s) => s,
            NodeBody::Record(_) => {
                bail!(TypeMismatch, "records are not indexable")
            }
        },
        Value::Scalar(s) => {
            scalar = s.clone();
            &scalar
        }
        _ => bail!(TypeMismatch, "value is not indexable"),
    };
    match target {
        &Scalar::Bytes(ref b) => {
            ensure!(
                idx >= 0 && (idx as usize) < b.len(),
                RangeError,
                "index {} out of range 0..{}",
                idx,
                b.len(),
            );
            Ok(Scalar::Int {
                v: b[idx as usize] as i128,
                unsigned: true,
                width: 1,
            }
            .into())
        }
        other => bail!(TypeMismatch, "{} is not indexable", other.type_name()),
    }
}

fn cast(vm: &Vm, recv: Value, target: &str) -> Result<Value> {
    let target_ref = TypeRef::parse(target)?;
    Ok(match target_ref {
        TypeRef::UInt { width, .. } => Scalar::Int {
            v: scalarize(vm, &recv)?.as_int()?,
            unsigned: true,
            width,
        }
        .into(),
        TypeRef::SInt { width, .. } => Scalar::Int {
            v: scalarize(vm, &recv)?.as_int()?,
            unsigned: false,
            width,
        }
        .into(),
        TypeRef::Float { width, .. } => Scalar::Float {
            v: scalarize(vm, &recv)?.as_f64()?,
            width,
        }
        .into(),
        TypeRef::Bits { width } => Scalar::Bits {
            v: scalarize(vm, &recv)?.as_int()? as u64,
            width,
        }
        .into(),
        TypeRef::Bcd { width } => Scalar::Bcd {
            v: scalarize(vm, &recv)?.as_int()? as u64,
            width,
        }
        .into(),
        TypeRef::Str { .. } => match scalarize(vm, &recv)? {
            s @ Scalar::Str { .. } => s.into(),
            other => bail!(
                TypeMismatch,
                "cannot cast {} to str",
                other.type_name(),
            ),
        },
        TypeRef::Bytes => match scalarize(vm, &recv)? {
            s @ Scalar::Bytes(_) => s.into(),
            other => bail!(
                TypeMismatch,
                "cannot cast {} to bytes",
                other.type_name(),
            ),
        },
        TypeRef::User { ref name, .. } => match recv {
            Value::Node(id) => {
                let actual = vm.tree.get(id).type_name();
                ensure!(
                    actual == name.as_str(),
                    TypeMismatch,
                    "runtime type is {}, not {}",
                    actual,
                    name,
                );
                Value::Node(id)
            }
            _ => bail!(TypeMismatch, "cannot cast a non-record to {}", name),
        },
    })
}

/// Byte length backing a value: its raw bytes where it has them, its
/// serialized width otherwise.
fn byte_size_of(vm: &Vm, value: &Value) -> Result<i128> {
    match value {
        &Value::Node(id) => {
            let node = vm.tree.get(id);
            if let Some(raw) = node.raw() {
                return Ok(raw.len() as i128);
            }
            match node.body() {
                NodeBody::Scalar(s) => scalar_byte_size(s),
                NodeBody::Array(elems) => {
                    let elems = elems.clone();
                    let mut total = 0;
                    for elem in elems {
                        total += byte_size_of(vm, &Value::Node(elem))?;
                    }
                    Ok(total)
                }
                NodeBody::Record(rec) => {
                    let fields: Vec<NodeId> =
                        rec.fields().map(|(_, id)| id).collect();
                    let mut total = 0;
                    for field in fields {
                        total += byte_size_of(vm, &Value::Node(field))?;
                    }
                    Ok(total)
                }
            }
        }
        Value::Scalar(s) => scalar_byte_size(s),
        Value::Stream(id) => Ok(vm.tree.stream(*id).size() as i128),
        Value::Null => bail!(TypeMismatch, "null has no size"),
    }
}

fn scalar_byte_size(s: &Scalar) -> Result<i128> {
    Ok(match s {
        &Scalar::Int { width, .. } => width as i128,
        &Scalar::Float { width, .. } => width as i128,
        &Scalar::Bits { width, .. } => ((width + 7) / 8) as i128,
        &Scalar::Bcd { width, .. } => width as i128,
        &Scalar::Str { ref text, ref encoding } => {
            encoding::encode(text, encoding)?.len() as i128
        }
        &Scalar::Bytes(ref b) => b.len() as i128,
        other => bail!(TypeMismatch, "{} has no byte size", other.type_name()),
    })
}

fn unary(vm: &Vm, op: UnaryOp, value: &Value) -> Result<Value> {
    let s = scalarize(vm, value)?;
    Ok(match op {
        UnaryOp::Not => Scalar::Bool(!s.as_bool()?).into(),
        UnaryOp::Neg => match s {
            Scalar::Float { v, width } => Scalar::Float { v: -v, width }.into(),
            other => Scalar::int(-other.as_int()?).into(),
        },
        UnaryOp::BitNot => Scalar::Int {
            v: !(s.as_int()? as u64) as i128,
            unsigned: true,
            width: 8,
        }
        .into(),
    })
}

fn binary(
    vm: &mut Vm,
    frame: &Frame,
    op: BinOp,
    lhs: &Expr,
    rhs: &Expr,
) -> Result<Value> {
    // short-circuit before the right side evaluates
    if matches!(op, BinOp::And | BinOp::Or) {
        let l = eval(vm, frame, lhs)?;
        let l = scalarize(vm, &l)?.as_bool()?;
        let skip = if op == BinOp::And { !l } else { l };
        if skip {
            return Ok(Scalar::Bool(l).into());
        }
        let r = eval(vm, frame, rhs)?;
        return Ok(Scalar::Bool(scalarize(vm, &r)?.as_bool()?).into());
    }

    let l = eval(vm, frame, lhs)?;
    let r = eval(vm, frame, rhs)?;

    if matches!(op, BinOp::Eq | BinOp::Ne) {
        // null equality is defined; everything else goes through scalars
        let eq = match (&l, &r) {
            (Value::Null, Value::Null) => true,
            (Value::Null, _) | (_, Value::Null) => false,
            _ => scalarize(vm, &l)?.try_eq(&scalarize(vm, &r)?)?,
        };
        return Ok(Scalar::Bool(if op == BinOp::Eq { eq } else { !eq }).into());
    }

    let ls = scalarize(vm, &l)?;
    let rs = scalarize(vm, &r)?;
    match op {
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = ls.try_cmp(&rs)?;
            let res = match op {
                BinOp::Lt => ord.is_lt(),
                BinOp::Le => ord.is_le(),
                BinOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            };
            Ok(Scalar::Bool(res).into())
        }
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
            arith(op, &ls, &rs)
        }
        BinOp::Shl | BinOp::Shr => shift(op, &ls, &rs),
        BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor => {
            let a = ls.as_int()? as u64;
            let b = rs.as_int()? as u64;
            let v = match op {
                BinOp::BitAnd => a & b,
                BinOp::BitOr => a | b,
                _ => a ^ b,
            };
            Ok(Scalar::Int { v: v as i128, unsigned: true, width: 8 }.into())
        }
        BinOp::And | BinOp::Or | BinOp::Eq | BinOp::Ne => unreachable!(),
    }
}

fn arith(op: BinOp, ls: &Scalar, rs: &Scalar) -> Result<Value> {
    if op == BinOp::Add {
        if let (
            &Scalar::Str { text: ref a, ref encoding },
            &Scalar::Str { text: ref b, .. },
        ) = (ls, rs)
        {
            return Ok(Scalar::Str {
                text: format!("{}{}", a, b),
                encoding: encoding.clone(),
            }
            .into());
        }
    }
    if ls.is_float() || rs.is_float() {
        let (a, b) = (ls.as_f64()?, rs.as_f64()?);
        let v = match op {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => a / b,
            BinOp::Rem => a % b,
            _ => unreachable!(),
        };
        return Ok(Scalar::Float { v, width: 8 }.into());
    }
    let (a, a_unsigned) = int_parts(ls)?;
    let (b, b_unsigned) = int_parts(rs)?;
    let v = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            ensure!(b != 0, RangeError, "division by zero");
            a / b
        }
        BinOp::Rem => {
            ensure!(b != 0, RangeError, "division by zero");
            a % b
        }
        _ => unreachable!(),
    };
    Ok(Scalar::Int { v, unsigned: a_unsigned && b_unsigned, width: 8 }.into())
}

/// Shifts operate on 64-bit operands: logical for unsigned left-hand
/// sides, arithmetic for signed ones.
fn shift(op: BinOp, ls: &Scalar, rs: &Scalar) -> Result<Value> {
    let (a, a_unsigned) = int_parts(ls)?;
    let sh = rs.as_int()?;
    ensure!(sh >= 0, RangeError, "negative shift amount {}", sh);
    let wide = sh >= 64;
    let v: i128 = match (op, a_unsigned) {
        (BinOp::Shl, _) => {
            if wide {
                0
            } else {
                ((a as u64) << sh) as i128
            }
        }
        (BinOp::Shr, true) => {
            if wide {
                0
            } else {
                ((a as u64) >> sh) as i128
            }
        }
        (BinOp::Shr, false) => {
            let a = a as i64;
            let sh = if sh > 63 { 63 } else { sh as i64 };
            (a >> sh) as i128
        }
        _ => unreachable!(),
    };
    Ok(Scalar::Int { v, unsigned: a_unsigned, width: 8 }.into())
}

fn int_parts(s: &Scalar) -> Result<(i128, bool)> {
    Ok(match s {
        &Scalar::Int { v, unsigned, .. } => (v, unsigned),
        &Scalar::Bits { v, .. } => (v as i128, true),
        &Scalar::Bcd { v, .. } => (v as i128, true),
        &Scalar::Enum { v, .. } => (v as i128, false),
        other => bail!(
            TypeMismatch,
            "{} is not usable as an integer",
            other.type_name(),
        ),
    })
}


#[cfg(test)]
use crate::schema::Schema;

#[cfg(test)]
fn eval_with(activation: &Activation, src: &str) -> Result<Value> {
    let schema = Schema::default();
    let mut vm = Vm::for_eval(&schema, activation);
    eval_source(&mut vm, &Frame::default(), src)
}

#[cfg(test)]
fn eval_int(activation: &Activation, src: &str) -> i128 {
    match eval_with(activation, src).unwrap() {
        Value::Scalar(s) => s.as_int().unwrap(),
        other => panic!("expected integer, got {:?}", other),
    }
}

#[test]
fn test_mixed_precedence_scenario() {
    let act = Activation::new().bind("a", 5i64).bind("b", 3i64);
    assert_eq!(
        eval_int(&act, "(a & 0xFF) >> 2 + b * (a < 10 ? 1 : 2)"),
        4,
    );
}

#[test]
fn test_evaluation_is_pure() {
    let act = Activation::new().bind("a", 5i64).bind("b", 3i64);
    let first = eval_with(&act, "a * 100 + b").unwrap();
    for _ in 0..3 {
        assert_eq!(eval_with(&act, "a * 100 + b").unwrap(), first);
    }
}

#[test]
fn test_integer_division_truncates_toward_zero() {
    let act = Activation::new();
    assert_eq!(eval_int(&act, "7 / 2"), 3);
    assert_eq!(eval_int(&act, "-7 / 2"), -3);
    assert_eq!(eval_int(&act, "7 % 3"), 1);
    assert_eq!(eval_int(&act, "-7 % 3"), -1);
    assert_eq!(
        eval_with(&act, "1 / 0").unwrap_err().kind(),
        crate::error::ErrorKind::RangeError,
    );
}

#[test]
fn test_shift_semantics() {
    let act = Activation::new().bind("big", u64::MAX);
    // arithmetic on signed, logical on unsigned
    assert_eq!(eval_int(&act, "-8 >> 1"), -4);
    assert_eq!(eval_int(&act, "big >> 60"), 15);
    assert_eq!(eval_int(&act, "1 << 3"), 8);
    assert_eq!(eval_int(&act, "big >> 64"), 0);
}

#[test]
fn test_bitwise_is_unsigned_64() {
    let act = Activation::new();
    assert_eq!(eval_int(&act, "~0 & 0xFF"), 0xFF);
    assert_eq!(eval_int(&act, "0xF0 | 0x0F"), 0xFF);
    assert_eq!(eval_int(&act, "0xFF ^ 0x0F"), 0xF0);
}

#[test]
fn test_short_circuit_skips_unbound_names() {
    let act = Activation::new();
    assert_eq!(
        eval_with(&act, "true || never_bound").unwrap(),
        Value::Scalar(Scalar::Bool(true)),
    );
    assert_eq!(
        eval_with(&act, "false && never_bound").unwrap(),
        Value::Scalar(Scalar::Bool(false)),
    );
    assert_eq!(
        eval_with(&act, "false || never_bound").unwrap_err().kind(),
        crate::error::ErrorKind::UnknownIdentifier,
    );
}

#[test]
fn test_string_methods() {
    let act = Activation::new().bind("s", "kaitai");
    assert_eq!(eval_int(&act, "s.length"), 6);
    assert_eq!(
        eval_with(&act, "s.reverse").unwrap(),
        Value::from("iatiak"),
    );
    assert_eq!(
        eval_with(&act, "s.substring(1, 4)").unwrap(),
        Value::from("ait"),
    );
    assert_eq!(eval_int(&act, "'ff'.to_i(16)"), 255);
    assert_eq!(eval_int(&act, "'12'.to_i"), 12);
    assert_eq!(
        eval_with(&act, "'a' + 'b'").unwrap(),
        Value::from("ab"),
    );
    assert_eq!(
        eval_with(&act, "s.substring(4, 2)").unwrap_err().kind(),
        crate::error::ErrorKind::RangeError,
    );
}

#[test]
fn test_bytes_indexing_and_methods() {
    let act = Activation::new().bind("b", vec![0x68u8, 0x69]);
    assert_eq!(eval_int(&act, "b[1]"), 0x69);
    assert_eq!(eval_int(&act, "b.length"), 2);
    assert_eq!(eval_int(&act, "b.first"), 0x68);
    assert_eq!(
        eval_with(&act, "b.to_s('ASCII')").unwrap(),
        Value::Scalar(Scalar::Str {
            text: "hi".to_owned(),
            encoding: "ASCII".to_owned(),
        }),
    );
    assert_eq!(
        eval_with(&act, "b[2]").unwrap_err().kind(),
        crate::error::ErrorKind::RangeError,
    );
    assert_eq!(
        eval_with(&act, "[0x68, 0x69] == b").unwrap(),
        Value::Scalar(Scalar::Bool(true)),
    );
}

#[test]
fn test_casts_and_sizeof() {
    let act = Activation::new().bind("n", 300i64);
    assert_eq!(
        eval_with(&act, "n.as<u2>()").unwrap(),
        Value::Scalar(Scalar::Int { v: 300, unsigned: true, width: 2 }),
    );
    assert_eq!(eval_int(&act, "sizeof(n.as<u2>())"), 2);
    assert_eq!(eval_int(&act, "alignof(n)"), 1);
    assert_eq!(eval_int(&act, "sizeof('hi')"), 2);
    assert_eq!(
        eval_with(&act, "n.as<nope>()").unwrap_err().kind(),
        crate::error::ErrorKind::TypeMismatch,
    );
}

#[test]
fn test_float_promotion_and_to_i() {
    let act = Activation::new();
    assert_eq!(
        eval_with(&act, "1 + 0.5").unwrap(),
        Value::from(1.5f64),
    );
    assert_eq!(eval_int(&act, "(7.0 / 2).to_i"), 3);
    assert_eq!(
        eval_with(&act, "3 == 3.0").unwrap(),
        Value::Scalar(Scalar::Bool(true)),
    );
}

#[test]
fn test_null_comparisons() {
    let act = Activation::new().bind("n", 1i64);
    assert_eq!(
        eval_with(&act, "null == null").unwrap(),
        Value::Scalar(Scalar::Bool(true)),
    );
    assert_eq!(
        eval_with(&act, "n != null").unwrap(),
        Value::Scalar(Scalar::Bool(true)),
    );
}
