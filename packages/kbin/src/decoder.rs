//! The parser/interpreter: walks a schema, drives the bit stream, and
//! builds the parse tree, evaluating expressions for sizes, conditions,
//! repeat counts, switch selectors, instance offsets, and validation.

use crate::{
    encoding,
    error::{bail, ensure, error, Result},
    expr::eval::{self, Activation, Frame},
    limits::{CancelToken, Limits},
    process::{ProcessKind, ProcessSpec, Processor},
    schema::{
        self, Attribute, Endian, InstanceSpec, RepeatKind, Schema, SwitchSpec,
        TypeRef, TypeRefSpec, ValidSpec,
    },
    stream::{BitStream, Whence},
    value::{InstanceSlot, NodeBody, NodeId, Scalar, StreamId, Tree, Value},
};
use tracing::{debug, trace};


/// Shared machine state for one parse or serialize invocation. Expression
/// evaluation, instance forcing, and the seq walk all run against this.
pub(crate) struct Vm<'a> {
    pub(crate) schema: &'a Schema,
    pub(crate) tree: Tree,
    pub(crate) limits: Limits,
    pub(crate) cancel: CancelToken,
    pub(crate) activation: Option<&'a Activation>,
    depth: u32,
}

impl<'a> Vm<'a> {
    pub(crate) fn new(
        schema: &'a Schema,
        limits: Limits,
        cancel: CancelToken,
    ) -> Self {
        Vm {
            schema,
            tree: Tree::new(),
            limits,
            cancel,
            activation: None,
            depth: 0,
        }
    }

    /// A machine for standalone expression evaluation against a host
    /// activation.
    pub(crate) fn for_eval(schema: &'a Schema, activation: &'a Activation) -> Self {
        let mut vm = Vm::new(schema, Limits::default(), CancelToken::new());
        vm.activation = Some(activation);
        vm
    }

    /// A machine over an existing tree, as the serializer uses.
    pub(crate) fn from_tree(
        schema: &'a Schema,
        tree: Tree,
        limits: Limits,
        cancel: CancelToken,
    ) -> Self {
        let mut vm = Vm::new(schema, limits, cancel);
        vm.tree = tree;
        vm
    }

    /// Lexical scope stack of the record a frame evaluates in.
    pub(crate) fn scope_for(
        &self,
        cur: Option<NodeId>,
    ) -> Vec<&'a schema::TypeSpec> {
        let schema = self.schema;
        match cur {
            Some(id) => match self.tree.get(id).body() {
                NodeBody::Record(rec) => {
                    schema::scope_chain(&schema.root, &rec.type_path)
                }
                _ => vec![&schema.root],
            },
            None => vec![&schema.root],
        }
    }

    /// Force the named instance of a record: memoised, cycle-checked, and
    /// bounded by the depth limit. `Ok(None)` means the record's type has
    /// no such instance.
    pub(crate) fn force_instance(
        &mut self,
        record: NodeId,
        name: &str,
    ) -> Result<Option<Value>> {
        let schema = self.schema;
        let spec: Option<InstanceSpec> = {
            let rec = match self.tree.get(record).body() {
                NodeBody::Record(rec) => rec,
                _ => return Ok(None),
            };
            match schema::walk_path(&schema.root, &rec.type_path) {
                Some(ts) => ts.instances.get(name).cloned(),
                None => None,
            }
        };
        let spec = match spec {
            Some(spec) => spec,
            None => return Ok(None),
        };

        match self.tree.record_mut(record).instances.get(name) {
            Some(InstanceSlot::Ready(v)) => return Ok(Some(v.clone())),
            Some(InstanceSlot::Computing) => bail!(
                InstanceCycle,
                "instance {:?} depends on itself",
                name,
            ),
            None => {}
        }
        self.cancel.check()?;
        self.tree
            .record_mut(record)
            .instances
            .insert(name.to_owned(), InstanceSlot::Computing);

        self.depth += 1;
        let result = self
            .limits
            .check_depth(self.depth)
            .and_then(|()| self.compute_instance(record, &spec));
        self.depth -= 1;

        match result {
            Ok(value) => {
                self.tree
                    .record_mut(record)
                    .instances
                    .insert(name.to_owned(), InstanceSlot::Ready(value.clone()));
                Ok(Some(value))
            }
            Err(e) => {
                self.tree.record_mut(record).instances.remove(name);
                Err(e.at_path(name))
            }
        }
    }

    fn compute_instance(
        &mut self,
        record: NodeId,
        spec: &InstanceSpec,
    ) -> Result<Value> {
        let frame = Frame { cur: Some(record), ..Frame::default() };

        if let Some(ref value) = spec.value {
            return eval::eval_source(self, &frame, value.as_str());
        }

        // positioned read from an explicit stream/offset
        let io = match spec.io {
            Some(ref src) => match eval::eval_source(self, &frame, src.as_str())? {
                Value::Stream(io) => io,
                other => bail!(
                    TypeMismatch,
                    "io expression produced {:?}, not a stream",
                    other,
                ),
            },
            None => match self.tree.get(record).as_record()?.io() {
                Some(io) => io,
                None => bail!(
                    UnknownIdentifier,
                    "record has no backing stream to read an instance from",
                ),
            },
        };

        let saved = self.tree.stream(io).pos();
        let type_path = self.tree.get(record).as_record()?.type_path.clone();
        let result = (|| {
            if let Some(ref pos) = spec.pos {
                let pos = eval::eval_source(self, &frame, pos.as_str())?;
                let pos = eval::scalarize(self, &pos)?.as_int()?;
                self.tree.stream_mut(io).seek(pos as i64, Whence::Start)?;
            }
            match self.parse_attribute(&spec.attr, &type_path, record, io)? {
                Some(node) => Ok(Value::Node(node)),
                None => Ok(Value::Null),
            }
        })();
        // the enclosing parse continues where it left off
        let _ = self.tree.stream_mut(io).seek(saved as i64, Whence::Start);
        result
    }
}


/// Force an instance on a finished tree, as the host does after a parse.
pub(crate) fn force_instance_in(
    schema: &Schema,
    tree: &mut Tree,
    node: NodeId,
    name: &str,
    limits: Limits,
    cancel: CancelToken,
) -> Result<Option<Value>> {
    let mut vm = Vm::from_tree(schema, std::mem::take(tree), limits, cancel);
    let result = vm.force_instance(node, name);
    *tree = vm.tree;
    result
}

/// Parse `bytes` against `schema`, starting at `root` (`None` for the
/// schema's own top level).
pub(crate) fn parse(
    schema: &Schema,
    root: Option<&str>,
    bytes: &[u8],
    limits: Limits,
    cancel: CancelToken,
) -> Result<Tree> {
    let root_path = schema::root_type_path(schema, root)?;
    let root_name = root
        .map(str::to_owned)
        .or_else(|| schema.id().map(str::to_owned))
        .unwrap_or_else(|| "root".to_owned());
    let mut vm = Vm::new(schema, limits, cancel);
    let io = vm.tree.add_stream(BitStream::new(bytes.to_vec()));
    debug!(root = %root_name, len = bytes.len(), "parse start");
    vm.parse_record(&root_path, &root_name, io, None, Vec::new())?;
    debug!(nodes = vm.tree.len(), "parse done");
    Ok(vm.tree)
}

impl<'a> Vm<'a> {
    fn parse_record(
        &mut self,
        type_path: &[String],
        ty_name: &str,
        io: StreamId,
        parent: Option<NodeId>,
        params: Vec<(String, Value)>,
    ) -> Result<NodeId> {
        let schema = self.schema;
        let ts = match schema::walk_path(&schema.root, type_path) {
            Some(ts) => ts,
            None => bail!(Internal, "dangling type path {:?}", type_path),
        };

        self.depth += 1;
        let result = (|| {
            self.limits.check_depth(self.depth)?;
            let record = self.tree.push_record(parent, ty_name);
            {
                let rec = self.tree.record_mut(record);
                rec.io = Some(io);
                rec.type_path = type_path.to_vec();
                rec.params = params;
            }
            for attr in &ts.seq {
                self.cancel.check()?;
                let name = match attr.id {
                    Some(ref id) => id.as_str(),
                    None => bail!(
                        CompileError,
                        "seq attribute of {} has no id",
                        ty_name,
                    ),
                };
                let offset = self.tree.stream(io).pos();
                trace!(field = name, offset, "field");
                let node = self
                    .parse_attribute(attr, type_path, record, io)
                    .map_err(|e| e.at_path(name).at_offset(offset))?;
                if let Some(node) = node {
                    self.tree.add_field(record, name, node);
                }
            }
            // a record leaves no half-consumed byte behind
            self.tree.stream_mut(io).align_to_byte();
            Ok(record)
        })();
        self.depth -= 1;
        result
    }

    /// Parse one attribute. `Ok(None)` means an `if` suppressed it.
    fn parse_attribute(
        &mut self,
        attr: &Attribute,
        type_path: &[String],
        record: NodeId,
        io: StreamId,
    ) -> Result<Option<NodeId>> {
        let frame = Frame { cur: Some(record), ..Frame::default() };

        if let Some(ref cond) = attr.if_expr {
            let v = eval::eval_source(self, &frame, cond.as_str())?;
            if !eval::truthy(self, &v)? {
                return Ok(None);
            }
        }

        let repeat = match attr.repeat {
            None => {
                return Ok(Some(self.parse_value(attr, type_path, record, io, None)?));
            }
            Some(repeat) => repeat,
        };

        let array = self.tree.push_array(Some(record), "array");
        match repeat {
            RepeatKind::Expr => {
                let count = match attr.repeat_expr {
                    Some(ref src) => {
                        let v = eval::eval_source(self, &frame, src.as_str())?;
                        eval::scalarize(self, &v)?.as_int()?
                    }
                    None => bail!(
                        CompileError,
                        "repeat: expr without repeat-expr",
                    ),
                };
                ensure!(count >= 0, RangeError, "repeat count {}", count);
                self.limits.check_elements(count as u64)?;
                for index in 0..count {
                    self.cancel.check()?;
                    let elem =
                        self.parse_value(attr, type_path, record, io, Some(index))?;
                    self.tree.add_elem(array, elem);
                }
            }
            RepeatKind::Eos => {
                let mut index = 0i128;
                while !self.tree.stream(io).eof() {
                    self.cancel.check()?;
                    self.limits.check_elements(index as u64 + 1)?;
                    match self.parse_value(attr, type_path, record, io, Some(index)) {
                        Ok(elem) => self.tree.add_elem(array, elem),
                        Err(e)
                            if !attr.eos_error
                                && e.kind() == crate::error::ErrorKind::Eof =>
                        {
                            break
                        }
                        Err(e) => return Err(e),
                    }
                    index += 1;
                }
            }
            RepeatKind::Until => {
                let until = match attr.repeat_until {
                    Some(ref src) => src.as_str(),
                    None => bail!(
                        CompileError,
                        "repeat: until without repeat-until",
                    ),
                };
                let mut index = 0i128;
                loop {
                    self.cancel.check()?;
                    self.limits.check_elements(index as u64 + 1)?;
                    let elem = match self.parse_value(attr, type_path, record, io, Some(index))
                    {
                        Ok(elem) => elem,
                        Err(e)
                            if !attr.eos_error
                                && e.kind() == crate::error::ErrorKind::Eof =>
                        {
                            break
                        }
                        Err(e) => return Err(e),
                    };
                    self.tree.add_elem(array, elem);
                    let done_frame = Frame {
                        cur: Some(record),
                        self_val: Some(Value::Node(elem)),
                        index: Some(index),
                        io: None,
                    };
                    let done = eval::eval_source(self, &done_frame, until)?;
                    if eval::truthy(self, &done)? {
                        break;
                    }
                    index += 1;
                }
            }
        }
        Ok(Some(array))
    }

    /// Parse a single value of the attribute's type at the cursor.
    fn parse_value(
        &mut self,
        attr: &Attribute,
        type_path: &[String],
        record: NodeId,
        io: StreamId,
        index: Option<i128>,
    ) -> Result<NodeId> {
        let frame = Frame {
            cur: Some(record),
            self_val: None,
            index,
            io: None,
        };
        let schema = self.schema;
        let scope = schema::scope_chain(&schema.root, type_path);

        // fixed literal bytes
        if let Some(ref contents) = attr.contents {
            let want = contents.to_bytes();
            let got = self.tree.stream_mut(io).read_bytes(want.len())?;
            ensure!(
                got == want,
                ContentsMismatch,
                "want {:02x?}, got {:02x?}",
                want,
                got,
            );
            let node = self.tree.push_scalar(
                Some(record),
                "bytes",
                Scalar::Bytes(got.clone()),
            );
            self.tree.set_raw(node, got);
            return Ok(node);
        }

        let ty = match attr.ty {
            None => TypeRef::Bytes,
            Some(TypeRefSpec::Name(ref name)) => TypeRef::parse(name)?,
            Some(TypeRefSpec::Switch(ref sw)) => {
                let chosen = self.resolve_switch(sw, &frame)?;
                TypeRef::parse(&chosen)?
            }
        };

        let node = match ty {
            TypeRef::UInt { width, endian } | TypeRef::SInt { width, endian } => {
                let big = self.pick_endian(endian, &scope, width)?;
                let signed = matches!(ty, TypeRef::SInt { .. });
                let raw = self.tree.stream_mut(io).read_bytes(width as usize)?;
                let v = int_from_bytes(&raw, signed, big);
                let spelling = type_spelling(&ty);
                let node = self.tree.push_scalar(
                    Some(record),
                    spelling,
                    Scalar::Int { v, unsigned: !signed, width },
                );
                self.tree.set_raw(node, raw);
                node
            }
            TypeRef::Float { width, endian } => {
                let big = self.pick_endian(endian, &scope, width)?;
                let raw = self.tree.stream_mut(io).read_bytes(width as usize)?;
                let v = float_from_bytes(&raw, big);
                let node = self.tree.push_scalar(
                    Some(record),
                    type_spelling(&ty),
                    Scalar::Float { v, width },
                );
                self.tree.set_raw(node, raw);
                node
            }
            TypeRef::Bits { width } => {
                let big = schema::effective_bit_endian(&scope) == Endian::Be;
                let v = self
                    .tree
                    .stream_mut(io)
                    .read_bits_int(width as u32, big)?;
                self.tree.push_scalar(
                    Some(record),
                    format!("b{}", width),
                    Scalar::Bits { v, width },
                )
            }
            TypeRef::Bcd { width } => {
                let raw = self.tree.stream_mut(io).read_bytes(width as usize)?;
                let v = bcd_from_bytes(&raw)?;
                let node = self.tree.push_scalar(
                    Some(record),
                    format!("bcd{}", width),
                    Scalar::Bcd { v, width },
                );
                self.tree.set_raw(node, raw);
                node
            }
            TypeRef::Str { z } => {
                let (raw, buf) = self.read_field_bytes(attr, &frame, io, z)?;
                let enc = attr
                    .encoding
                    .clone()
                    .unwrap_or_else(|| schema::effective_encoding(&scope));
                let text = encoding::decode(&buf, &enc)?;
                let node = self.tree.push_scalar(
                    Some(record),
                    "str",
                    Scalar::Str { text, encoding: enc },
                );
                self.tree.set_raw(node, raw);
                node
            }
            TypeRef::Bytes => {
                let (raw, buf) = self.read_field_bytes(attr, &frame, io, false)?;
                let node = self.tree.push_scalar(
                    Some(record),
                    "bytes",
                    Scalar::Bytes(buf),
                );
                self.tree.set_raw(node, raw);
                node
            }
            TypeRef::User { ref name, ref args } => {
                self.parse_user(attr, &frame, name, args, type_path, record, io)?
            }
        };

        let node = self.wrap_enum(attr, node, type_path)?;

        if let Some(ref valid) = attr.valid {
            self.check_valid(valid, record, node)?;
        }
        Ok(node)
    }

    fn parse_user(
        &mut self,
        attr: &Attribute,
        frame: &Frame,
        name: &str,
        args: &[String],
        type_path: &[String],
        record: NodeId,
        io: StreamId,
    ) -> Result<NodeId> {
        let schema = self.schema;
        let target_path =
            match schema::resolve_type_path(&schema.root, type_path, name) {
                Some(path) => path,
                None => bail!(UnknownType, "no type {:?} in scope", name),
            };
        let target = schema::walk_path(&schema.root, &target_path)
            .ok_or_else(|| error!(Internal, "dangling type path"))?;
        ensure!(
            args.len() == target.params.len(),
            CompileError,
            "type {} takes {} parameters, got {}",
            name,
            target.params.len(),
            args.len(),
        );
        let mut params = Vec::with_capacity(args.len());
        for (param, arg) in target.params.iter().zip(args) {
            let v = eval::eval_source(self, frame, arg)?;
            params.push((param.id.clone(), v));
        }

        let ty_short = name.rsplit("::").next().unwrap_or(name).to_owned();

        // a size delimits a sub-stream; otherwise the child shares ours
        if attr.size.is_some() || attr.size_eos {
            let raw = self.read_sized(attr, frame, io)?;
            let inner = self.apply_process(attr, frame, &raw)?;
            let sub = self.tree.add_stream(BitStream::new(inner));
            let node =
                self.parse_record(&target_path, &ty_short, sub, Some(record), params)?;
            self.tree.set_raw(node, raw);
            Ok(node)
        } else {
            ensure!(
                attr.process.is_none(),
                CompileError,
                "process requires a size or size-eos to delimit its input",
            );
            self.parse_record(&target_path, &ty_short, io, Some(record), params)
        }
    }

    /// Bytes for a `size:`/`size-eos:` delimited field.
    fn read_sized(
        &mut self,
        attr: &Attribute,
        frame: &Frame,
        io: StreamId,
    ) -> Result<Vec<u8>> {
        if let Some(ref size) = attr.size {
            let n = eval::eval_source(self, frame, size.as_str())?;
            let n = eval::scalarize(self, &n)?.as_int()?;
            ensure!(n >= 0, RangeError, "negative size {}", n);
            return self.tree.stream_mut(io).read_bytes(n as usize);
        }
        if attr.size_eos {
            return Ok(self.tree.stream_mut(io).read_bytes_full());
        }
        bail!(CompileError, "field needs size or size-eos")
    }

    /// Bytes for a `str`/`strz`/`bytes` field, honoring size, size-eos, and
    /// terminator controls. Returns `(raw, value)`: the raw window exactly as
    /// read, and the value bytes after processing and terminator
    /// truncation inside a sized window.
    fn read_field_bytes(
        &mut self,
        attr: &Attribute,
        frame: &Frame,
        io: StreamId,
        z: bool,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let term = attr.terminator.or(if z { Some(0) } else { None });
        let sized = attr.size.is_some() || attr.size_eos;
        let raw = if sized {
            self.read_sized(attr, frame, io)?
        } else {
            match term {
                Some(term) => self.tree.stream_mut(io).read_bytes_term(
                    term,
                    attr.include,
                    attr.consume,
                    attr.eos_error,
                )?,
                None => bail!(
                    CompileError,
                    "field needs one of size, size-eos, or terminator",
                ),
            }
        };
        let mut value = self.apply_process(attr, frame, &raw)?;
        if sized {
            if let Some(term) = term {
                if let Some(at) = value.iter().position(|&b| b == term) {
                    value.truncate(at + attr.include as usize);
                }
            }
        }
        Ok((raw, value))
    }

    fn apply_process(
        &mut self,
        attr: &Attribute,
        frame: &Frame,
        raw: &[u8],
    ) -> Result<Vec<u8>> {
        match self.build_processor(attr, frame)? {
            Some(processor) => processor.apply(raw),
            None => Ok(raw.to_vec()),
        }
    }

    pub(crate) fn build_processor(
        &mut self,
        attr: &Attribute,
        frame: &Frame,
    ) -> Result<Option<Processor>> {
        let spec = match attr.process {
            Some(ref src) => ProcessSpec::parse(src)?,
            None => return Ok(None),
        };
        Ok(Some(match spec.kind {
            ProcessKind::Zlib => Processor::Zlib,
            ProcessKind::Rol | ProcessKind::Ror => {
                let v = eval::eval_source(self, frame, &spec.args[0])?;
                let amount = eval::scalarize(self, &v)?.as_int()?;
                let group = if spec.args.len() > 1 {
                    let v = eval::eval_source(self, frame, &spec.args[1])?;
                    eval::scalarize(self, &v)?.as_int()?
                } else {
                    1
                };
                ensure!(
                    amount >= 0 && group >= 1,
                    RangeError,
                    "rotate({}, {}) out of range",
                    amount,
                    group,
                );
                if spec.kind == ProcessKind::Rol {
                    Processor::Rol { amount: amount as u32, group: group as u32 }
                } else {
                    Processor::Ror { amount: amount as u32, group: group as u32 }
                }
            }
            ProcessKind::Xor => {
                let v = eval::eval_source(self, frame, &spec.args[0])?;
                let key = match eval::scalarize(self, &v)? {
                    Scalar::Bytes(b) => b,
                    s => {
                        let n = s.as_int()?;
                        ensure!(
                            (0..=255).contains(&n),
                            RangeError,
                            "xor key {} is not a byte",
                            n,
                        );
                        vec![n as u8]
                    }
                };
                Processor::Xor { key }
            }
        }))
    }

    fn resolve_switch(&mut self, sw: &SwitchSpec, frame: &Frame) -> Result<String> {
        let sel = eval::eval_source(self, frame, sw.switch_on.as_str())?;
        let sel = eval::scalarize(self, &sel)?;
        let mut fallback = None;
        for (key, ty) in &sw.cases {
            if key == "_" {
                fallback = Some(ty.clone());
                continue;
            }
            if self.case_matches(key, &sel, frame)? {
                return Ok(ty.clone());
            }
        }
        match fallback {
            Some(ty) => Ok(ty),
            None => bail!(
                SwitchNoMatch,
                "selector {} matched no case",
                sel.render(),
            ),
        }
    }

    /// A case key is itself expression syntax: a literal or an
    /// enum-qualified name. A key whose value cannot compare against the
    /// selector simply does not match.
    fn case_matches(&mut self, key: &str, sel: &Scalar, frame: &Frame) -> Result<bool> {
        let key_val = eval::eval_source(self, frame, key)
            .map_err(|e| error!(
                CompileError,
                "bad switch case key {:?}: {}",
                key,
                e.message(),
            ))?;
        let key_scalar = eval::scalarize(self, &key_val)?;
        match sel.try_eq(&key_scalar) {
            Ok(eq) => Ok(eq),
            Err(_) => Ok(false),
        }
    }

    fn wrap_enum(
        &mut self,
        attr: &Attribute,
        node: NodeId,
        type_path: &[String],
    ) -> Result<NodeId> {
        let enum_name = match attr.enum_ref {
            Some(ref name) => name,
            None => return Ok(node),
        };
        let schema = self.schema;
        let scope = schema::scope_chain(&schema.root, type_path);
        let spec = match schema::find_enum(&scope, enum_name) {
            Some(spec) => spec,
            None => bail!(UnknownEnum, "no enum {:?} in scope", enum_name),
        };
        let v = self.tree.get(node).as_scalar()?.as_int()?;
        let label = spec.get(&(v as i64)).cloned();
        let short = enum_name.rsplit("::").next().unwrap_or(enum_name).to_owned();
        let n = self.tree.get_mut(node);
        n.ty = short.clone();
        n.body = NodeBody::Scalar(Scalar::Enum {
            enum_name: short,
            label,
            v: v as i64,
        });
        Ok(node)
    }

    pub(crate) fn check_valid(
        &mut self,
        valid: &ValidSpec,
        record: NodeId,
        node: NodeId,
    ) -> Result<()> {
        let actual = eval::scalarize(self, &Value::Node(node))?;
        let frame = Frame {
            cur: Some(record),
            self_val: Some(Value::Node(node)),
            ..Frame::default()
        };
        let mut eval_scalar = |vm: &mut Self, src: &str| -> Result<Scalar> {
            let v = eval::eval_source(vm, &frame, src)?;
            eval::scalarize(vm, &v)
        };
        match valid {
            ValidSpec::Eq(expr) => {
                let want = eval_scalar(self, expr.as_str())?;
                ensure!(
                    actual.try_eq(&want)?,
                    ValidationFailed,
                    "eq: want {}, got {}",
                    want.render(),
                    actual.render(),
                );
            }
            ValidSpec::Rules(rules) => {
                if let Some(ref expr) = rules.eq {
                    let want = eval_scalar(self, expr.as_str())?;
                    ensure!(
                        actual.try_eq(&want)?,
                        ValidationFailed,
                        "eq: want {}, got {}",
                        want.render(),
                        actual.render(),
                    );
                }
                if let Some(ref expr) = rules.min {
                    let min = eval_scalar(self, expr.as_str())?;
                    ensure!(
                        actual.try_cmp(&min)?.is_ge(),
                        ValidationFailed,
                        "min: {} < {}",
                        actual.render(),
                        min.render(),
                    );
                }
                if let Some(ref expr) = rules.max {
                    let max = eval_scalar(self, expr.as_str())?;
                    ensure!(
                        actual.try_cmp(&max)?.is_le(),
                        ValidationFailed,
                        "max: {} > {}",
                        actual.render(),
                        max.render(),
                    );
                }
                if let Some(ref choices) = rules.any_of {
                    let mut hit = false;
                    for choice in choices {
                        let want = eval_scalar(self, choice.as_str())?;
                        if actual.try_eq(&want)? {
                            hit = true;
                            break;
                        }
                    }
                    ensure!(
                        hit,
                        ValidationFailed,
                        "any-of: {} matched none of {} choices",
                        actual.render(),
                        choices.len(),
                    );
                }
                if let Some(ref expr) = rules.expr {
                    let v = eval::eval_source(self, &frame, expr.as_str())?;
                    ensure!(
                        eval::truthy(self, &v)?,
                        ValidationFailed,
                        "expr: {:?} is false for {}",
                        expr.as_str(),
                        actual.render(),
                    );
                }
            }
        }
        Ok(())
    }

    pub(crate) fn pick_endian(
        &self,
        declared: Option<Endian>,
        scope: &[&schema::TypeSpec],
        width: u8,
    ) -> Result<bool> {
        if width == 1 {
            return Ok(false);
        }
        match declared.or_else(|| schema::effective_endian(scope)) {
            Some(endian) => Ok(endian == Endian::Be),
            None => bail!(
                CompileError,
                "multi-byte read with no endianness in scope",
            ),
        }
    }
}

fn type_spelling(ty: &TypeRef) -> String {
    let (prefix, width, endian) = match ty {
        &TypeRef::UInt { width, endian } => ("u", width, endian),
        &TypeRef::SInt { width, endian } => ("s", width, endian),
        &TypeRef::Float { width, endian } => ("f", width, endian),
        _ => unreachable!(),
    };
    match endian {
        Some(Endian::Le) => format!("{}{}le", prefix, width),
        Some(Endian::Be) => format!("{}{}be", prefix, width),
        None => format!("{}{}", prefix, width),
    }
}

fn int_from_bytes(raw: &[u8], signed: bool, big_endian: bool) -> i128 {
    let mut le = [0u8; 16];
    if big_endian {
        for (i, &b) in raw.iter().rev().enumerate() {
            le[i] = b;
        }
    } else {
        le[..raw.len()].copy_from_slice(raw);
    }
    let unsigned = u128::from_le_bytes(le);
    if signed {
        let bits = raw.len() as u32 * 8;
        let sign_bit = 1u128 << (bits - 1);
        if unsigned & sign_bit != 0 {
            (unsigned as i128) - (1i128 << bits)
        } else {
            unsigned as i128
        }
    } else {
        unsigned as i128
    }
}

fn float_from_bytes(raw: &[u8], big_endian: bool) -> f64 {
    match raw.len() {
        4 => {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(raw);
            let v = if big_endian {
                f32::from_be_bytes(buf)
            } else {
                f32::from_le_bytes(buf)
            };
            v as f64
        }
        _ => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(raw);
            if big_endian {
                f64::from_be_bytes(buf)
            } else {
                f64::from_le_bytes(buf)
            }
        }
    }
}

fn bcd_from_bytes(raw: &[u8]) -> Result<u64> {
    let mut v: u64 = 0;
    for &byte in raw {
        for nibble in [byte >> 4, byte & 0x0F] {
            ensure!(
                nibble <= 9,
                RangeError,
                "BCD nibble {:#x} exceeds 9",
                nibble,
            );
            v = v * 10 + nibble as u64;
        }
    }
    Ok(v)
}


#[cfg(test)]
fn schema_of(v: serde_json::Value) -> Schema {
    serde_json::from_value(v).unwrap()
}

#[cfg(test)]
fn parse_ok(schema: &Schema, bytes: &[u8]) -> Tree {
    parse(schema, None, bytes, Limits::default(), CancelToken::new()).unwrap()
}

#[cfg(test)]
fn root_field(tree: &Tree, name: &str) -> NodeId {
    tree.get(tree.root())
        .as_record()
        .unwrap()
        .field(name)
        .unwrap_or_else(|| panic!("no field {:?}", name))
}

#[cfg(test)]
fn field_scalar(tree: &Tree, name: &str) -> Scalar {
    tree.get(root_field(tree, name)).as_scalar().unwrap().clone()
}

#[cfg(test)]
fn field_int(tree: &Tree, name: &str) -> i128 {
    field_scalar(tree, name).as_int().unwrap()
}

#[cfg(test)]
fn field_str(tree: &Tree, name: &str) -> String {
    match field_scalar(tree, name) {
        Scalar::Str { text, .. } => text,
        other => panic!("field {:?} is {:?}", name, other),
    }
}

#[cfg(test)]
fn s1_schema() -> Schema {
    schema_of(serde_json::json!({
        "meta": {"id": "s1"},
        "seq": [
            {"id": "magic", "contents": [0x4B, 0x42, 0x49, 0x4E]},
            {"id": "ver", "type": "u2le"},
            {"id": "len", "type": "u1"},
            {"id": "msg", "type": "str", "size": "len", "encoding": "UTF-8"},
        ],
    }))
}

#[cfg(test)]
pub(crate) const S1_INPUT: &[u8] = &[
    0x4B, 0x42, 0x49, 0x4E, 0x01, 0x00, 0x05, 0x48, 0x65, 0x6C, 0x6C, 0x6F,
];

#[test]
fn test_s1_fixed_header() {
    let schema = s1_schema();
    let tree = parse_ok(&schema, S1_INPUT);
    assert_eq!(
        field_scalar(&tree, "magic"),
        Scalar::Bytes(vec![75, 66, 73, 78]),
    );
    assert_eq!(field_int(&tree, "ver"), 1);
    assert_eq!(field_int(&tree, "len"), 5);
    assert_eq!(field_str(&tree, "msg"), "Hello");
}

#[test]
fn test_s1_variant_empty_msg() {
    let schema = s1_schema();
    let input = [0x4B, 0x42, 0x49, 0x4E, 0x01, 0x00, 0x00];
    let tree = parse_ok(&schema, &input);
    assert_eq!(field_int(&tree, "len"), 0);
    assert_eq!(field_str(&tree, "msg"), "");
}

#[test]
fn test_s1_bad_magic_annotates_path() {
    let schema = s1_schema();
    let mut input = S1_INPUT.to_vec();
    input[0] = 0x00;
    let err = parse(&schema, None, &input, Limits::default(), CancelToken::new())
        .unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::ContentsMismatch);
    assert_eq!(err.path(), Some("magic"));
    assert_eq!(err.offset(), Some(0));
}

#[test]
fn test_s2_repeat_until() {
    let schema = schema_of(serde_json::json!({
        "seq": [
            {"id": "vals", "type": "u1", "repeat": "until", "repeat-until": "_ == 0"},
        ],
    }));
    let tree = parse_ok(&schema, &[0x01, 0x02, 0x03, 0x00, 0xFF]);
    let elems = tree.get(root_field(&tree, "vals")).as_array().unwrap().to_vec();
    let vals: Vec<i128> = elems
        .iter()
        .map(|&e| tree.get(e).as_scalar().unwrap().as_int().unwrap())
        .collect();
    assert_eq!(vals, vec![1, 2, 3, 0]);
    let io = tree.get(tree.root()).as_record().unwrap().io().unwrap();
    assert_eq!(tree.stream(io).pos(), 4);
}

#[test]
fn test_s3_bit_fields_big_endian() {
    let schema = schema_of(serde_json::json!({
        "seq": [
            {"id": "a", "type": "b3"},
            {"id": "b", "type": "b4"},
            {"id": "c", "type": "b2"},
        ],
    }));
    let tree = parse_ok(&schema, &[0xB4, 0x5A]);
    assert_eq!(field_int(&tree, "a"), 5);
    assert_eq!(field_int(&tree, "b"), 10);
    assert_eq!(field_int(&tree, "c"), 0);
}

#[test]
fn test_s4_switch_on_enum() {
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
                        "entry_type::binary": "bytes",
                    },
                },
            },
        ],
    }));
    let input = [0x01, 0x00, 0x06, 0x6B, 0x61, 0x69, 0x74, 0x61, 0x69];
    let tree = parse_ok(&schema, &input);
    assert_eq!(
        field_scalar(&tree, "t"),
        Scalar::Enum {
            enum_name: "entry_type".to_owned(),
            label: Some("text".to_owned()),
            v: 1,
        },
    );
    assert_eq!(field_int(&tree, "sz"), 6);
    assert_eq!(field_str(&tree, "p"), "kaitai");

    // the binary case picks bytes instead
    let input = [0x02, 0x00, 0x02, 0xAB, 0xCD];
    let tree = parse_ok(&schema, &input);
    assert_eq!(field_scalar(&tree, "p"), Scalar::Bytes(vec![0xAB, 0xCD]));
}

#[test]
fn test_s5_framed_parse_chains() {
    let outer = schema_of(serde_json::json!({
        "seq": [
            {"id": "len", "type": "u1"},
            {"id": "payload", "type": "bytes", "size": "len"},
        ],
    }));
    let mut input = vec![0x0C];
    input.extend_from_slice(S1_INPUT);
    let outer_tree = parse_ok(&outer, &input);
    let payload = match field_scalar(&outer_tree, "payload") {
        Scalar::Bytes(b) => b,
        other => panic!("payload is {:?}", other),
    };
    assert_eq!(payload, S1_INPUT);
    let inner_tree = parse_ok(&s1_schema(), &payload);
    assert_eq!(field_str(&inner_tree, "msg"), "Hello");
}

#[test]
fn test_switch_default_and_no_match() {
    let schema = schema_of(serde_json::json!({
        "seq": [
            {"id": "k", "type": "u1"},
            {
                "id": "v",
                "type": {"switch-on": "k", "cases": {"1": "u1", "_": "u2le"}},
            },
        ],
    }));
    let tree = parse_ok(&schema, &[0x01, 0x07]);
    assert_eq!(field_int(&tree, "v"), 7);
    let tree = parse_ok(&schema, &[0x09, 0x07, 0x00]);
    assert_eq!(field_int(&tree, "v"), 7);

    let no_default = schema_of(serde_json::json!({
        "seq": [
            {"id": "k", "type": "u1"},
            {"id": "v", "type": {"switch-on": "k", "cases": {"1": "u1"}}},
        ],
    }));
    let err = parse(&no_default, None, &[0x09, 0x07], Limits::default(), CancelToken::new())
        .unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::SwitchNoMatch);
    assert_eq!(err.path(), Some("v"));
}

#[test]
fn test_user_type_params_and_substream() {
    let schema = schema_of(serde_json::json!({
        "types": {
            "blob": {
                "params": [{"id": "n"}],
                "seq": [{"id": "data", "type": "bytes", "size": "n"}],
            },
        },
        "seq": [
            {"id": "k", "type": "u1"},
            {"id": "p", "type": "blob(k)"},
            {"id": "tail", "type": "u1"},
        ],
    }));
    let tree = parse_ok(&schema, &[0x02, 0xAA, 0xBB, 0x42]);
    let p = root_field(&tree, "p");
    let data = tree.get(p).as_record().unwrap().field("data").unwrap();
    assert_eq!(
        tree.get(data).as_scalar().unwrap(),
        &Scalar::Bytes(vec![0xAA, 0xBB]),
    );
    assert_eq!(field_int(&tree, "tail"), 0x42);
    // parent/root backrefs
    assert_eq!(tree.get(p).parent(), Some(tree.root()));
    assert_eq!(tree.get(data).parent(), Some(p));
}

#[test]
fn test_sized_user_type_delimits_substream() {
    let schema = schema_of(serde_json::json!({
        "types": {
            "rest": {"seq": [{"id": "all", "type": "bytes", "size-eos": true}]},
        },
        "seq": [
            {"id": "head", "type": "rest", "size": 2},
            {"id": "tail", "type": "u1"},
        ],
    }));
    let tree = parse_ok(&schema, &[0x01, 0x02, 0x03]);
    let head = root_field(&tree, "head");
    let all = tree.get(head).as_record().unwrap().field("all").unwrap();
    assert_eq!(
        tree.get(all).as_scalar().unwrap(),
        &Scalar::Bytes(vec![0x01, 0x02]),
    );
    assert_eq!(tree.get(head).raw(), Some(&[0x01, 0x02][..]));
    assert_eq!(field_int(&tree, "tail"), 3);
}

#[test]
fn test_endian_scoping() {
    let schema = schema_of(serde_json::json!({
        "meta": {"endian": "le"},
        "types": {
            "flipped": {
                "meta": {"endian": "be"},
                "seq": [{"id": "n", "type": "u2"}],
            },
        },
        "seq": [
            {"id": "a", "type": "u2"},
            {"id": "b", "type": "flipped"},
        ],
    }));
    let tree = parse_ok(&schema, &[0x01, 0x00, 0x00, 0x01]);
    assert_eq!(field_int(&tree, "a"), 1);
    let b = root_field(&tree, "b");
    let n = tree.get(b).as_record().unwrap().field("n").unwrap();
    assert_eq!(tree.get(n).as_scalar().unwrap().as_int().unwrap(), 1);
}

#[test]
fn test_no_endian_in_scope_is_compile_error() {
    let schema = schema_of(serde_json::json!({
        "seq": [{"id": "n", "type": "u2"}],
    }));
    let err = parse(&schema, None, &[0, 0], Limits::default(), CancelToken::new())
        .unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::CompileError);
}

#[test]
fn test_process_xor_keeps_raw() {
    let schema = schema_of(serde_json::json!({
        "seq": [
            {"id": "enc", "type": "bytes", "size": 2, "process": "xor(0xff)"},
        ],
    }));
    let tree = parse_ok(&schema, &[0x00, 0x0F]);
    let enc = root_field(&tree, "enc");
    assert_eq!(
        tree.get(enc).as_scalar().unwrap(),
        &Scalar::Bytes(vec![0xFF, 0xF0]),
    );
    assert_eq!(tree.get(enc).raw(), Some(&[0x00, 0x0F][..]));
}

#[test]
fn test_repeat_eos_and_expr() {
    let schema = schema_of(serde_json::json!({
        "seq": [{"id": "xs", "type": "u2le", "repeat": "eos"}],
    }));
    let tree = parse_ok(&schema, &[0x01, 0x00, 0x02, 0x00]);
    let xs = tree.get(root_field(&tree, "xs")).as_array().unwrap().len();
    assert_eq!(xs, 2);

    let schema = schema_of(serde_json::json!({
        "seq": [
            {"id": "n", "type": "u1"},
            {"id": "xs", "type": "u1", "repeat": "expr", "repeat-expr": "n"},
        ],
    }));
    let tree = parse_ok(&schema, &[0x02, 0xAA, 0xBB]);
    assert_eq!(
        tree.get(root_field(&tree, "xs")).as_array().unwrap().len(),
        2,
    );
}

#[test]
fn test_repeat_limit_exceeded() {
    let schema = schema_of(serde_json::json!({
        "seq": [
            {"id": "xs", "type": "u1", "repeat": "expr", "repeat-expr": 100},
        ],
    }));
    let limits = Limits { max_elements: 10, max_depth: 1024 };
    let err = parse(&schema, None, &[0; 100], limits, CancelToken::new())
        .unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::LimitExceeded);
}

#[test]
fn test_validation_rules() {
    let any_of = schema_of(serde_json::json!({
        "seq": [{"id": "v", "type": "u1", "valid": {"any-of": [1, 2, 3]}}],
    }));
    for ok in [1u8, 2, 3] {
        parse_ok(&any_of, &[ok]);
    }
    let err = parse(&any_of, None, &[4], Limits::default(), CancelToken::new())
        .unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::ValidationFailed);

    let shorthand = schema_of(serde_json::json!({
        "seq": [{"id": "v", "type": "u1", "valid": 5}],
    }));
    parse_ok(&shorthand, &[5]);
    assert!(parse(&shorthand, None, &[6], Limits::default(), CancelToken::new()).is_err());

    let minmax = schema_of(serde_json::json!({
        "seq": [{"id": "v", "type": "u1", "valid": {"min": 10, "max": 20}}],
    }));
    parse_ok(&minmax, &[15]);
    assert!(parse(&minmax, None, &[9], Limits::default(), CancelToken::new()).is_err());
    assert!(parse(&minmax, None, &[21], Limits::default(), CancelToken::new()).is_err());

    let exprd = schema_of(serde_json::json!({
        "seq": [{"id": "v", "type": "u1", "valid": {"expr": "_ % 2 == 0"}}],
    }));
    parse_ok(&exprd, &[4]);
    assert!(parse(&exprd, None, &[5], Limits::default(), CancelToken::new()).is_err());
}

#[test]
fn test_eof_is_not_a_truncated_value() {
    let schema = schema_of(serde_json::json!({
        "seq": [{"id": "n", "type": "u4le"}],
    }));
    let err = parse(&schema, None, &[0x01, 0x02], Limits::default(), CancelToken::new())
        .unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::Eof);
}

#[test]
fn test_bcd_and_nibble_range() {
    let schema = schema_of(serde_json::json!({
        "seq": [{"id": "d", "type": "bcd2"}],
    }));
    let tree = parse_ok(&schema, &[0x12, 0x34]);
    assert_eq!(field_int(&tree, "d"), 1234);

    let err = parse(&schema, None, &[0x1A, 0x00], Limits::default(), CancelToken::new())
        .unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::RangeError);
}

#[test]
fn test_strz_and_terminator_controls() {
    let schema = schema_of(serde_json::json!({
        "seq": [
            {"id": "name", "type": "strz"},
            {"id": "after", "type": "u1"},
        ],
    }));
    let tree = parse_ok(&schema, &[b'h', b'i', 0x00, 0x42]);
    assert_eq!(field_str(&tree, "name"), "hi");
    assert_eq!(field_int(&tree, "after"), 0x42);

    let lenient = schema_of(serde_json::json!({
        "seq": [{"id": "name", "type": "strz", "eos-error": false}],
    }));
    let tree = parse_ok(&lenient, b"hi");
    assert_eq!(field_str(&tree, "name"), "hi");
}

#[test]
fn test_enum_out_of_range_is_tagged_not_fatal() {
    let schema = schema_of(serde_json::json!({
        "enums": {"e": {"1": "one"}},
        "seq": [{"id": "v", "type": "u1", "enum": "e"}],
    }));
    let tree = parse_ok(&schema, &[0x09]);
    match field_scalar(&tree, "v") {
        Scalar::Enum { label, v, .. } => {
            assert_eq!(label, None);
            assert_eq!(v, 9);
        }
        other => panic!("expected enum, got {:?}", other),
    }
    assert_eq!(field_scalar(&tree, "v").render(), "<e::9>");
}

#[test]
fn test_if_suppresses_field() {
    let schema = schema_of(serde_json::json!({
        "seq": [
            {"id": "k", "type": "u1"},
            {"id": "opt", "type": "u1", "if": "k == 1"},
            {"id": "tail", "type": "u1"},
        ],
    }));
    let tree = parse_ok(&schema, &[0x00, 0x42]);
    assert!(tree.get(tree.root()).as_record().unwrap().field("opt").is_none());
    assert_eq!(field_int(&tree, "tail"), 0x42);

    let tree = parse_ok(&schema, &[0x01, 0x07, 0x42]);
    assert_eq!(field_int(&tree, "opt"), 7);
    assert_eq!(field_int(&tree, "tail"), 0x42);
}

#[test]
fn test_value_instance_memoises() {
    let schema = schema_of(serde_json::json!({
        "seq": [{"id": "a", "type": "u1"}],
        "instances": {"double": {"value": "a * 2"}},
    }));
    let mut tree = parse_ok(&schema, &[0x15]);
    let root = tree.root();
    let first = force_instance_in(
        &schema, &mut tree, root, "double",
        Limits::default(), CancelToken::new(),
    )
    .unwrap()
    .unwrap();
    assert_eq!(first, Value::Scalar(Scalar::int(42)));
    let second = force_instance_in(
        &schema, &mut tree, root, "double",
        Limits::default(), CancelToken::new(),
    )
    .unwrap()
    .unwrap();
    assert_eq!(first, second);
    // memoised on the record itself
    assert_eq!(
        tree.get(root).as_record().unwrap().instance("double"),
        Some(&first),
    );
}

#[test]
fn test_instance_cycle_detected() {
    let schema = schema_of(serde_json::json!({
        "seq": [{"id": "a", "type": "u1"}],
        "instances": {
            "x": {"value": "y + 1"},
            "y": {"value": "x + 1"},
        },
    }));
    let mut tree = parse_ok(&schema, &[0x00]);
    let root = tree.root();
    let err = force_instance_in(
        &schema, &mut tree, root, "x",
        Limits::default(), CancelToken::new(),
    )
    .unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::InstanceCycle);
    // a failed computation is not memoised as a value
    assert!(tree.get(root).as_record().unwrap().instance("x").is_none());
}

#[test]
fn test_pos_instance_restores_cursor() {
    let schema = schema_of(serde_json::json!({
        "seq": [
            {"id": "len", "type": "u1"},
            {"id": "body", "type": "bytes", "size-eos": true},
        ],
        "instances": {
            "second": {"type": "u1", "pos": 1},
        },
    }));
    let mut tree = parse_ok(&schema, &[0x03, 0xAA, 0xBB]);
    let root = tree.root();
    let io = tree.get(root).as_record().unwrap().io().unwrap();
    let pos_before = tree.stream(io).pos();
    let v = force_instance_in(
        &schema, &mut tree, root, "second",
        Limits::default(), CancelToken::new(),
    )
    .unwrap()
    .unwrap();
    match v {
        Value::Node(id) => {
            assert_eq!(tree.get(id).as_scalar().unwrap().as_int().unwrap(), 0xAA);
        }
        other => panic!("expected node, got {:?}", other),
    }
    assert_eq!(tree.stream(io).pos(), pos_before);
}

#[test]
fn test_seq_expression_uses_instance() {
    // a size expression that forces an instance mid-parse
    let schema = schema_of(serde_json::json!({
        "seq": [
            {"id": "n", "type": "u1"},
            {"id": "body", "type": "str", "size": "padded", "encoding": "ASCII"},
        ],
        "instances": {"padded": {"value": "n + 1"}},
    }));
    let tree = parse_ok(&schema, &[0x01, b'h', b'i']);
    assert_eq!(field_str(&tree, "body"), "hi");
}

#[test]
fn test_cancellation_between_steps() {
    let schema = s1_schema();
    let cancel = CancelToken::new();
    cancel.cancel();
    let err = parse(&schema, None, S1_INPUT, Limits::default(), cancel).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::Cancelled);
}

#[test]
fn test_zero_size_bytes_is_empty() {
    let schema = schema_of(serde_json::json!({
        "seq": [
            {"id": "n", "type": "u1"},
            {"id": "gap", "type": "bytes", "size": "n - 1"},
            {"id": "tail", "type": "u1"},
        ],
    }));
    let tree = parse_ok(&schema, &[0x01, 0x42]);
    assert_eq!(field_scalar(&tree, "gap"), Scalar::Bytes(Vec::new()));
    assert_eq!(field_int(&tree, "tail"), 0x42);
}

#[test]
fn test_empty_input_empty_seq() {
    let schema = schema_of(serde_json::json!({"seq": []}));
    let tree = parse_ok(&schema, &[]);
    assert_eq!(tree.get(tree.root()).as_record().unwrap().fields().count(), 0);

    let nonempty = s1_schema();
    let err = parse(&nonempty, None, &[], Limits::default(), CancelToken::new())
        .unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::Eof);
}

#[test]
fn test_named_root_override() {
    let schema = schema_of(serde_json::json!({
        "meta": {"id": "outer"},
        "types": {
            "inner": {"seq": [{"id": "n", "type": "u1"}]},
        },
        "seq": [{"id": "ignored", "type": "u4le"}],
    }));
    let tree = parse(
        &schema, Some("inner"), &[0x07],
        Limits::default(), CancelToken::new(),
    )
    .unwrap();
    assert_eq!(field_int(&tree, "n"), 7);
    let err = parse(
        &schema, Some("nowhere"), &[0x07],
        Limits::default(), CancelToken::new(),
    )
    .unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::UnknownType);
}

#[test]
fn test_bytes_remaining_in_size_expr() {
    let schema = schema_of(serde_json::json!({
        "seq": [
            {"id": "head", "type": "u1"},
            {"id": "half", "type": "bytes", "size": "_bytes_remaining / 2"},
            {"id": "rest", "type": "bytes", "size-eos": true},
        ],
    }));
    let tree = parse_ok(&schema, &[0x01, 0xAA, 0xBB, 0xCC, 0xDD]);
    assert_eq!(field_scalar(&tree, "half"), Scalar::Bytes(vec![0xAA, 0xBB]));
    assert_eq!(field_scalar(&tree, "rest"), Scalar::Bytes(vec![0xCC, 0xDD]));
}

#[test]
fn test_instance_with_io_expression() {
    // a nested record reaches back into the root stream by position
    let schema = schema_of(serde_json::json!({
        "types": {
            "inner": {
                "seq": [{"id": "n", "type": "u1"}],
                "instances": {
                    "first_of_file": {"type": "u1", "pos": 0, "io": "_root._io"},
                },
            },
        },
        "seq": [
            {"id": "tag", "type": "u1"},
            {"id": "body", "type": "inner", "size": 1},
        ],
    }));
    let mut tree = parse_ok(&schema, &[0x9C, 0x07]);
    let body = root_field(&tree, "body");
    let v = force_instance_in(
        &schema, &mut tree, body, "first_of_file",
        Limits::default(), CancelToken::new(),
    )
    .unwrap()
    .unwrap();
    match v {
        Value::Node(id) => {
            assert_eq!(tree.get(id).as_scalar().unwrap().as_int().unwrap(), 0x9C);
        }
        other => panic!("expected node, got {:?}", other),
    }
}
