//! Runtime interpreter for declarative binary format schemas.
//!
//! A schema describes how raw bytes encode a structured record: a `seq` of
//! typed attributes, lazily computed `instances`, nested `types`, `enums`,
//! and a small expression language for sizes, conditions, repeat counts,
//! and switch selectors. Nothing is code-generated; the engine interprets
//! the schema at runtime against a bit-level cursor and produces a tagged
//! parse tree, or runs the walk in reverse to serialize a tree back to
//! bytes that are bit-identical to a faithful original.
//!
//! Typical usage pattern:
//!
//! - obtain a `Schema` (the host owns file I/O and YAML parsing; the model
//!   deserializes straight from the document via serde)
//! - call `parse` with the schema, an optional root type name, and the
//!   input bytes, getting a `Tree`
//! - walk the tree through `Tree`/`Node` accessors, forcing instances
//!   through `Engine::instance` as needed
//! - call `serialize` with a tree (parsed or host-built) to get bytes back
//! - call `evaluate` to run a schema expression against an `Activation`
//!
//! Work limits, cancellation, and a metrics sink hang off `Engine`; the
//! free functions use a default one.

pub mod error;
pub mod value;

mod decoder;
mod encoder;
mod encoding;
mod expr;
mod limits;
mod metrics;
mod process;
mod schema;
mod stream;

pub use crate::{
    expr::{cache_stats, Activation, CacheStats},
    limits::{CancelToken, Limits},
    metrics::{MetricEvent, MetricsSink},
    process::{ProcessKind, ProcessSpec, Processor},
    schema::{
        Attribute, Contents, ContentsElem, Endian, EnumSpec, ExprStr,
        InstanceSpec, Meta, Param, RepeatKind, Schema, SwitchSpec, TypeRef,
        TypeRefSpec, TypeSpec, ValidRules, ValidSpec,
    },
    stream::{BitStream, BitWriter, Whence},
    value::{Node, NodeBody, NodeId, Record, Scalar, StreamId, Tree, Value},
};

use crate::error::Result;
use std::{sync::Arc, time::Instant};


/// One engine configuration: work limits plus an optional metrics sink.
/// Cheap to clone; invocations share nothing but the global expression
/// cache.
#[derive(Clone, Default)]
pub struct Engine {
    limits: Limits,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl Engine {
    pub fn new() -> Self {
        Engine::default()
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    /// Parse `bytes` into a tree. `root` picks a named type as the top
    /// level; `None` uses the schema's own.
    pub fn parse(
        &self,
        schema: &Schema,
        root: Option<&str>,
        bytes: &[u8],
        cancel: &CancelToken,
    ) -> Result<Tree> {
        let started = Instant::now();
        let result =
            decoder::parse(schema, root, bytes, self.limits, cancel.clone());
        if let Some(ref sink) = self.metrics {
            sink.duration("parse", started.elapsed());
            match result {
                Ok(_) => {
                    sink.event(MetricEvent::Parsed);
                    sink.event(MetricEvent::BytesRead(bytes.len() as u64));
                }
                Err(ref e) => sink.event(MetricEvent::Errored(e.kind())),
            }
        }
        result
    }

    /// Serialize a tree back to bytes. If the tree came from `parse` and
    /// has not been mutated in ways that break `valid`, `contents`, or
    /// switch-selector derivability, the output equals the original input.
    pub fn serialize(
        &self,
        schema: &Schema,
        root: Option<&str>,
        tree: &Tree,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>> {
        let started = Instant::now();
        let result =
            encoder::serialize(schema, root, tree, self.limits, cancel.clone());
        if let Some(ref sink) = self.metrics {
            sink.duration("serialize", started.elapsed());
            match result {
                Ok(ref bytes) => {
                    sink.event(MetricEvent::Serialized);
                    sink.event(MetricEvent::BytesWritten(bytes.len() as u64));
                }
                Err(ref e) => sink.event(MetricEvent::Errored(e.kind())),
            }
        }
        result
    }

    /// Evaluate a standalone expression against host-supplied bindings.
    pub fn evaluate(&self, src: &str, activation: &Activation) -> Result<Value> {
        let schema = Schema::default();
        let mut vm = decoder::Vm::for_eval(&schema, activation);
        expr::eval::eval_source(&mut vm, &expr::eval::Frame::default(), src)
    }

    /// Force a named instance of a record node, memoising on the tree.
    /// `Ok(None)` means the record's type declares no such instance.
    pub fn instance(
        &self,
        schema: &Schema,
        tree: &mut Tree,
        node: NodeId,
        name: &str,
        cancel: &CancelToken,
    ) -> Result<Option<Value>> {
        decoder::force_instance_in(
            schema,
            tree,
            node,
            name,
            self.limits,
            cancel.clone(),
        )
    }
}

pub fn parse(
    schema: &Schema,
    root: Option<&str>,
    bytes: &[u8],
    cancel: &CancelToken,
) -> Result<Tree> {
    Engine::new().parse(schema, root, bytes, cancel)
}

pub fn serialize(
    schema: &Schema,
    root: Option<&str>,
    tree: &Tree,
    cancel: &CancelToken,
) -> Result<Vec<u8>> {
    Engine::new().serialize(schema, root, tree, cancel)
}

pub fn evaluate(src: &str, activation: &Activation) -> Result<Value> {
    Engine::new().evaluate(src, activation)
}


#[test]
fn test_public_round_trip() {
    let schema: Schema = serde_json::from_value(serde_json::json!({
        "meta": {"id": "demo", "endian": "le"},
        "seq": [
            {"id": "count", "type": "u2"},
            {"id": "body", "type": "u1", "repeat": "expr", "repeat-expr": "count"},
        ],
    }))
    .unwrap();
    let input = [0x02, 0x00, 0xAA, 0xBB];
    let cancel = CancelToken::new();
    let tree = parse(&schema, None, &input, &cancel).unwrap();
    assert_eq!(serialize(&schema, None, &tree, &cancel).unwrap(), input);
}

#[test]
fn test_public_evaluate() {
    let activation = Activation::new().bind("a", 5i64).bind("b", 3i64);
    let v = evaluate("(a & 0xFF) >> 2 + b * (a < 10 ? 1 : 2)", &activation)
        .unwrap();
    assert_eq!(v, Value::Scalar(Scalar::int(4)));
    assert_eq!(
        evaluate("nope", &activation).unwrap_err().kind(),
        error::ErrorKind::UnknownIdentifier,
    );
}

#[test]
fn test_metrics_sink_sees_events() {
    use crate::metrics::test_sink::RecordingSink;

    let sink = Arc::new(RecordingSink::default());
    let engine = Engine::new().with_metrics(sink.clone());
    let schema: Schema = serde_json::from_value(serde_json::json!({
        "seq": [{"id": "n", "type": "u1"}],
    }))
    .unwrap();
    let cancel = CancelToken::new();
    let tree = engine.parse(&schema, None, &[7], &cancel).unwrap();
    engine.serialize(&schema, None, &tree, &cancel).unwrap();
    engine.parse(&schema, None, &[], &cancel).unwrap_err();

    let events = sink.events.lock().unwrap().clone();
    assert!(events.contains(&MetricEvent::Parsed));
    assert!(events.contains(&MetricEvent::BytesRead(1)));
    assert!(events.contains(&MetricEvent::Serialized));
    assert!(events.contains(&MetricEvent::BytesWritten(1)));
    assert!(events.contains(&MetricEvent::Errored(error::ErrorKind::Eof)));
}

#[test]
fn test_engine_instance_access() {
    let schema: Schema = serde_json::from_value(serde_json::json!({
        "seq": [{"id": "a", "type": "u1"}],
        "instances": {"next": {"value": "a + 1"}},
    }))
    .unwrap();
    let cancel = CancelToken::new();
    let engine = Engine::new();
    let mut tree = engine.parse(&schema, None, &[9], &cancel).unwrap();
    let root = tree.root();
    let v = engine
        .instance(&schema, &mut tree, root, "next", &cancel)
        .unwrap()
        .unwrap();
    assert_eq!(v, Value::Scalar(Scalar::int(10)));
    assert_eq!(
        engine.instance(&schema, &mut tree, root, "absent", &cancel).unwrap(),
        None,
    );
}
