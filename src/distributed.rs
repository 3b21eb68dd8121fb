// Distributed: localities, collectives and the distributed primitives
//
// A Communicator is one locality's view of the substrate: who am I, how many
// of us are there, point-to-point send and an asynchronous receive. Messages
// are keyed by (key, source, destination); a receive posted before the send
// waits on a promise, a send before the receive is parked in a mailbox.
//
// Every collective derives its key from the array's annotation name (or the
// node's communication key when the array is unnamed) plus a per-locality
// generation counter. All localities run the same program and issue the same
// collectives in the same order, so the keys line up without coordination.
//
// LocalCluster runs N localities inside one process (one thread or engine
// per locality). It is the substrate the tests run against; a networked
// transport implements the same trait.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::annotation::{tiles_from_value, Annotation, Axis};
use crate::error::EvalError;
use crate::future::{channel, when_all, Future, Promise};
use crate::kernels::{self, Site};
use crate::primitive::Primitive;
use crate::tiling::{check_coverage, TileSpan, Tiling};
use crate::value::{Array, Storage, Value};

pub trait Communicator: Send + Sync + fmt::Debug {
    fn locality(&self) -> usize;

    fn num_localities(&self) -> usize;

    fn send(&self, key: &str, destination: usize, value: Value) -> Result<(), EvalError>;

    fn receive(&self, key: &str, source: usize) -> Future<Value>;

    /// How many collectives this locality has started under `basename`.
    fn next_generation(&self, basename: &str) -> u64;
}

/// Every locality contributes `value`; resolves to all contributions ordered
/// by locality id.
pub fn all_gather(comm: &dyn Communicator, key: &str, value: Value) -> Future<Vec<Value>> {
    let n = comm.num_localities();
    debug!(key, locality = comm.locality(), "all_gather");
    for destination in 0..n {
        if let Err(e) = comm.send(key, destination, value.clone()) {
            return Future::failed(e);
        }
    }
    when_all((0..n).map(|source| comm.receive(key, source)).collect())
}

// In-process substrate

enum Mailbox {
    Delivered(Value),
    Waiting(Promise<Value>),
}

type MailboxKey = (String, usize, usize);

/// N localities sharing one set of mailboxes.
pub struct LocalCluster {
    size: usize,
    mailboxes: Mutex<HashMap<MailboxKey, Mailbox>>,
}

impl fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCluster")
            .field("size", &self.size)
            .field("pending", &self.mailboxes.lock().len())
            .finish()
    }
}

impl LocalCluster {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            size,
            mailboxes: Mutex::new(HashMap::new()),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The communicator of locality `id`.
    pub fn locality(self: &Arc<Self>, id: usize) -> Result<Locality, EvalError> {
        if id >= self.size {
            return Err(EvalError::invalid_argument(format!(
                "locality {id} out of range for a cluster of {}",
                self.size
            )));
        }
        Ok(Locality {
            id,
            cluster: Arc::clone(self),
            generations: Mutex::new(HashMap::new()),
        })
    }

    /// Communicators for every locality, in id order.
    pub fn localities(self: &Arc<Self>) -> Vec<Locality> {
        (0..self.size)
            .map(|id| Locality {
                id,
                cluster: Arc::clone(self),
                generations: Mutex::new(HashMap::new()),
            })
            .collect()
    }
}

/// One locality of a LocalCluster.
pub struct Locality {
    id: usize,
    cluster: Arc<LocalCluster>,
    generations: Mutex<HashMap<String, u64>>,
}

impl Locality {
    /// The only locality of a one-locality cluster.
    pub fn single() -> Self {
        Locality {
            id: 0,
            cluster: LocalCluster::new(1),
            generations: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for Locality {
    fn default() -> Self {
        Self::single()
    }
}

impl fmt::Debug for Locality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Locality({}/{})", self.id, self.cluster.size)
    }
}

impl Communicator for Locality {
    fn locality(&self) -> usize {
        self.id
    }

    fn num_localities(&self) -> usize {
        self.cluster.size
    }

    fn send(&self, key: &str, destination: usize, value: Value) -> Result<(), EvalError> {
        if destination >= self.cluster.size {
            return Err(EvalError::communication(format!(
                "no locality {destination} in a cluster of {}",
                self.cluster.size
            )));
        }
        let slot = (key.to_string(), self.id, destination);
        let waiting = {
            let mut boxes = self.cluster.mailboxes.lock();
            match boxes.remove(&slot) {
                Some(Mailbox::Waiting(promise)) => promise,
                Some(delivered @ Mailbox::Delivered(_)) => {
                    boxes.insert(slot, delivered);
                    return Err(EvalError::communication(format!(
                        "second message under '{key}' from {} to {destination}",
                        self.id
                    )));
                }
                None => {
                    boxes.insert(slot, Mailbox::Delivered(value));
                    return Ok(());
                }
            }
        };
        waiting.set_value(value);
        Ok(())
    }

    fn receive(&self, key: &str, source: usize) -> Future<Value> {
        if source >= self.cluster.size {
            return Future::failed(EvalError::communication(format!(
                "no locality {source} in a cluster of {}",
                self.cluster.size
            )));
        }
        let slot = (key.to_string(), source, self.id);
        let mut boxes = self.cluster.mailboxes.lock();
        match boxes.remove(&slot) {
            Some(Mailbox::Delivered(value)) => Future::ready(value),
            Some(waiting @ Mailbox::Waiting(_)) => {
                boxes.insert(slot, waiting);
                Future::failed(EvalError::communication(format!(
                    "second receive under '{key}' from {source} at {}",
                    self.id
                )))
            }
            None => {
                let (promise, future) = channel();
                boxes.insert(slot, Mailbox::Waiting(promise));
                future
            }
        }
    }

    fn next_generation(&self, basename: &str) -> u64 {
        let mut generations = self.generations.lock();
        let counter = generations.entry(basename.to_string()).or_insert(0);
        let generation = *counter;
        *counter += 1;
        generation
    }
}

// Distributed primitives

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributedOp {
    /// `annotate_d(value, name, tile_spec)`
    Annotate,
    /// `retile_d(value, tile_spec)`
    Retile,
    /// `all_gather_d(value)`
    AllGather,
    /// `dot_d(a, b)`
    Dot,
    Locality,
    NumLocalities,
}

impl DistributedOp {
    pub const ALL: [DistributedOp; 6] = [
        DistributedOp::Annotate,
        DistributedOp::Retile,
        DistributedOp::AllGather,
        DistributedOp::Dot,
        DistributedOp::Locality,
        DistributedOp::NumLocalities,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DistributedOp::Annotate => "annotate_d",
            DistributedOp::Retile => "retile_d",
            DistributedOp::AllGather => "all_gather_d",
            DistributedOp::Dot => "dot_d",
            DistributedOp::Locality => "locality",
            DistributedOp::NumLocalities => "num_localities",
        }
    }

    pub fn patterns(&self) -> &'static [&'static str] {
        match self {
            DistributedOp::Annotate => &["annotate_d(_1, _2, _3)"],
            DistributedOp::Retile => &["retile_d(_1, _2)"],
            DistributedOp::AllGather => &["all_gather_d(_1)"],
            DistributedOp::Dot => &["dot_d(_1, _2)"],
            DistributedOp::Locality => &["locality()"],
            DistributedOp::NumLocalities => &["num_localities()"],
        }
    }
}

/// Run a distributed primitive on its evaluated operands.
pub fn evaluate(op: DistributedOp, args: Vec<Value>, comm: &Arc<dyn Communicator>, node: &Primitive) -> Future<Value> {
    let outcome = match op {
        DistributedOp::Locality => return Future::ready(Value::Int(comm.locality() as i64)),
        DistributedOp::NumLocalities => return Future::ready(Value::Int(comm.num_localities() as i64)),
        DistributedOp::Annotate => annotate_d(args, comm, node),
        DistributedOp::Retile => retile_d(args, comm, node),
        DistributedOp::AllGather => all_gather_d(args, comm, node),
        DistributedOp::Dot => dot_d(args, comm, node),
    };
    outcome.unwrap_or_else(Future::failed)
}

/// Key for the next collective of `op` on the array named `name`.
fn collective_key(comm: &dyn Communicator, op: DistributedOp, name: Option<&str>, node: &Primitive) -> String {
    let base = match name {
        Some(name) => name.to_string(),
        None => node.name.communication_key(),
    };
    let generation = comm.next_generation(&base);
    format!("{base}@{generation}/{}", op.name())
}

fn annotated(value: &Value, op: DistributedOp) -> Result<(&Array, &Annotation), EvalError> {
    let array = value.as_array().ok_or_else(|| {
        EvalError::type_mismatch(format!("{} expects an array, got {}", op.name(), value.type_name()))
    })?;
    let annotation = array.annotation().ok_or_else(|| {
        EvalError::distribution(format!("{} expects an annotated array", op.name()))
    })?;
    Ok((array, annotation))
}

fn int_pair(values: &[Value]) -> Option<TileSpan> {
    match values {
        [start, stop] => {
            let start = usize::try_from(start.as_int()?).ok()?;
            let stop = usize::try_from(stop.as_int()?).ok()?;
            TileSpan::new(start, stop).ok()
        }
        _ => None,
    }
}

fn span_value(span: TileSpan) -> [Value; 2] {
    [Value::Int(span.start as i64), Value::Int(span.stop as i64)]
}

fn bad_message(what: &str, got: &Value) -> EvalError {
    EvalError::communication(format!("malformed {what} message: {got}"))
}

// Axis slicing of row-major storage

/// (outer, extent, inner) element counts around `axis` of `shape`.
fn split_at_axis(shape: &[usize], axis: usize) -> (usize, usize, usize) {
    let outer = shape[..axis].iter().product();
    let inner = shape[axis + 1..].iter().product();
    (outer, shape[axis], inner)
}

/// The sub-array `[span.start, span.stop)` along `axis`.
fn slice_axis(array: &Array, axis: usize, span: TileSpan) -> Result<Array, EvalError> {
    let shape = array.shape();
    let (outer, extent, inner) = split_at_axis(&shape, axis);
    let indices = (0..outer).flat_map(move |o| (span.start..span.stop).flat_map(move |i| (0..inner).map(move |j| (o * extent + i) * inner + j)));
    let mut sliced = shape.clone();
    sliced[axis] = span.len();
    Array::from_shape(&sliced, array.storage().gather(indices))
}

/// Concatenate arrays along `axis`; all other extents must agree.
fn concat_axis(parts: &[Array], axis: usize) -> Result<Array, EvalError> {
    let Some(first) = parts.first() else {
        return Err(EvalError::distribution("nothing to concatenate"));
    };
    let mut shape = first.shape();
    for part in &parts[1..] {
        let other = part.shape();
        let agrees = other.len() == shape.len()
            && other.iter().zip(&shape).enumerate().all(|(i, (a, b))| i == axis || a == b);
        if !agrees {
            return Err(EvalError::shape_mismatch(format!(
                "cannot join tiles of shapes {shape:?} and {other:?}"
            )));
        }
    }
    shape[axis] = parts.iter().map(|p| p.shape()[axis]).sum();
    let (outer, _, inner) = split_at_axis(&shape, axis);
    let mut pieces = Vec::with_capacity(outer * parts.len());
    for o in 0..outer {
        for part in parts {
            let run = part.shape()[axis] * inner;
            pieces.push(part.storage().slice(o * run..(o + 1) * run));
        }
    }
    Array::from_shape(&shape, Storage::concat(&pieces)?)
}

fn axis_index(axis: Axis, array: &Array) -> Result<usize, EvalError> {
    axis.index_in(array.rank()).ok_or_else(|| {
        EvalError::shape_mismatch(format!("axis '{axis}' does not exist for a rank-{} array", array.rank()))
    })
}

// annotate_d

fn annotate_d(args: Vec<Value>, comm: &Arc<dyn Communicator>, node: &Primitive) -> Result<Future<Value>, EvalError> {
    let op = DistributedOp::Annotate;
    let [value, name, spec] = <[Value; 3]>::try_from(args)
        .map_err(|args| EvalError::invalid_argument(format!("annotate_d takes 3 operands, got {}", args.len())))?;
    let name = name
        .as_str()
        .ok_or_else(|| EvalError::type_mismatch(format!("annotate_d: name must be a string, got {}", name.type_name())))?
        .to_string();
    let annotation = Annotation::new(comm.locality(), comm.num_localities())
        .with_name(name.as_str())
        .with_tiles(tiles_from_value(&spec)?);
    let value = crate::annotation::annotate(value, annotation.clone())?;

    let key = collective_key(comm.as_ref(), op, Some(&name), node);
    Ok(all_gather(comm.as_ref(), &key, Value::Str(annotation.to_string())).map(move |texts| {
        let mut all = Vec::with_capacity(texts.len());
        for text in &texts {
            let text = text.as_str().ok_or_else(|| bad_message("annotation", text))?;
            all.push(Annotation::parse(text).map_err(|e| EvalError::communication(e.to_string()))?);
        }
        check_global_coverage(&all)?;
        Ok(value)
    }))
}

/// Coverage of every tiled axis across the annotations of all localities.
fn check_global_coverage(all: &[Annotation]) -> Result<(), EvalError> {
    let Some(first) = all.first() else {
        return Ok(());
    };
    for (axis, _) in first.tiles() {
        let spans: Vec<TileSpan> = all
            .iter()
            .map(|ann| {
                ann.span(*axis).ok_or_else(|| {
                    warn!(%axis, locality = ann.locality, "tile missing on one locality");
                    EvalError::distribution(format!(
                        "locality {} has no tile along '{axis}'",
                        ann.locality
                    ))
                })
            })
            .collect::<Result<_, _>>()?;
        let extent = spans.iter().map(|s| s.stop).max().unwrap_or(0);
        check_coverage(&spans, extent)?;
    }
    Ok(())
}

// retile_d

fn retile_d(args: Vec<Value>, comm: &Arc<dyn Communicator>, node: &Primitive) -> Result<Future<Value>, EvalError> {
    let op = DistributedOp::Retile;
    let [value, spec] = <[Value; 2]>::try_from(args)
        .map_err(|args| EvalError::invalid_argument(format!("retile_d takes 2 operands, got {}", args.len())))?;
    let (array, annotation) = annotated(&value, op)?;
    let (axis, old) = annotation.single_axis()?;
    let new = match tiles_from_value(&spec)?.as_slice() {
        [(target, span)] if *target == axis => *span,
        [(target, _)] => {
            return Err(EvalError::invalid_argument(format!(
                "retile_d cannot move a tiling from '{axis}' to '{target}'"
            )))
        }
        other => {
            return Err(EvalError::invalid_argument(format!(
                "retile_d expects one tile, got {}",
                other.len()
            )))
        }
    };
    let dim = axis_index(axis, array)?;
    let me = comm.locality();
    let array = array.clone();
    let annotation = annotation.clone();
    let key = collective_key(comm.as_ref(), op, annotation.name.as_deref(), node);

    let [a, b] = span_value(old);
    let [c, d] = span_value(new);
    let plan = Value::List(vec![a, b, c, d]);
    let comm = Arc::clone(comm);
    Ok(all_gather(comm.as_ref(), &format!("{key}/plan"), plan).then(move |plans| {
        let step = || -> Result<Future<Value>, EvalError> {
            let mut from = Vec::with_capacity(plans.len());
            let mut to = Vec::with_capacity(plans.len());
            for plan in &plans {
                match plan.as_list() {
                    Some([a, b, c, d]) => {
                        from.push(int_pair(&[a.clone(), b.clone()]).ok_or_else(|| bad_message("retile plan", plan))?);
                        to.push(int_pair(&[c.clone(), d.clone()]).ok_or_else(|| bad_message("retile plan", plan))?);
                    }
                    _ => return Err(bad_message("retile plan", plan)),
                }
            }
            let from = Tiling::new(from)?;
            let to = Tiling::new(to)?;
            let transfers = from.transfers(&to)?;

            let data_key = format!("{key}/data");
            for t in transfers.iter().filter(|t| t.source == me) {
                debug!(source = t.source, destination = t.destination, span = %t.span, "retile transfer");
                let local = t.span.relative_to(old.start);
                let piece = slice_axis(&array, dim, local)?;
                comm.send(&data_key, t.destination, Value::Array(piece))?;
            }
            // Pieces are joined in global order, whatever order the
            // localities own them in.
            let mut arriving: Vec<_> = transfers.iter().filter(|t| t.destination == me).collect();
            arriving.sort_by_key(|t| t.span.start);
            let incoming: Vec<Future<Value>> = arriving.iter().map(|t| comm.receive(&data_key, t.source)).collect();

            let result_annotation = annotation.clone().with_tile(axis, new);
            let template = array.clone();
            Ok(when_all(incoming).map(move |pieces| {
                let parts = pieces
                    .iter()
                    .map(|p| p.as_array().map(crate::annotation::strip).ok_or_else(|| bad_message("tile", p)))
                    .collect::<Result<Vec<_>, _>>()?;
                let joined = if parts.is_empty() {
                    slice_axis(&template, dim, TileSpan { start: 0, stop: 0 })?
                } else {
                    concat_axis(&parts, dim)?
                };
                crate::annotation::annotate(Value::Array(joined), result_annotation)
            }))
        };
        step().unwrap_or_else(Future::failed)
    }))
}

// all_gather_d

fn all_gather_d(args: Vec<Value>, comm: &Arc<dyn Communicator>, node: &Primitive) -> Result<Future<Value>, EvalError> {
    let op = DistributedOp::AllGather;
    let [value] = <[Value; 1]>::try_from(args)
        .map_err(|args| EvalError::invalid_argument(format!("all_gather_d takes 1 operand, got {}", args.len())))?;
    let (array, annotation) = annotated(&value, op)?;
    let (axis, span) = annotation.single_axis()?;
    let dim = axis_index(axis, array)?;
    let key = collective_key(comm.as_ref(), op, annotation.name.as_deref(), node);
    let [start, stop] = span_value(span);
    let local = crate::annotation::strip(array);
    let contribution = Value::List(vec![start, stop, Value::Array(local.clone())]);

    Ok(all_gather(comm.as_ref(), &key, contribution).map(move |tiles| {
        let mut parts: Vec<(TileSpan, Array)> = Vec::with_capacity(tiles.len());
        for tile in &tiles {
            match tile.as_list() {
                Some([start, stop, Value::Array(a)]) => {
                    let span = int_pair(&[start.clone(), stop.clone()]).ok_or_else(|| bad_message("tile", tile))?;
                    parts.push((span, a.clone()));
                }
                _ => return Err(bad_message("tile", tile)),
            }
        }
        let spans: Vec<TileSpan> = parts.iter().map(|(s, _)| *s).collect();
        let extent = spans.iter().map(|s| s.stop).max().unwrap_or(0);
        check_coverage(&spans, extent)?;
        parts.sort_by_key(|(s, _)| *s);
        parts.dedup_by_key(|(s, _)| *s);
        parts.retain(|(s, _)| !s.is_empty());
        let arrays: Vec<Array> = parts.into_iter().map(|(_, a)| a).collect();
        if arrays.is_empty() {
            // Keeps the element type and the other extents.
            return Ok(Value::Array(slice_axis(&local, dim, TileSpan { start: 0, stop: 0 })?));
        }
        Ok(Value::Array(concat_axis(&arrays, dim)?))
    }))
}

// dot_d

fn dot_d(args: Vec<Value>, comm: &Arc<dyn Communicator>, node: &Primitive) -> Result<Future<Value>, EvalError> {
    let op = DistributedOp::Dot;
    let [a, b] = <[Value; 2]>::try_from(args)
        .map_err(|args| EvalError::invalid_argument(format!("dot_d takes 2 operands, got {}", args.len())))?;
    let diagnostic = node.qualified_name();
    let site = Site {
        name: op.name(),
        diagnostic: &diagnostic,
    };

    match (a.annotation(), b.annotation()) {
        (None, None) => Ok(Future::from_outcome(kernels::dot_values(&a, &b, &site))),
        // Rows of the matrix are distributed and the vector is whole: the
        // product's entries follow the same row tiling.
        (Some(ann), None) if a.rank() == Some(2) && b.rank() == Some(1) => {
            let (axis, span) = ann.single_axis()?;
            if axis != Axis::Rows {
                return Err(EvalError::distribution(format!(
                    "dot_d with a whole vector needs a row-tiled matrix, got a tile along '{axis}'"
                )));
            }
            let mut result = Annotation::new(ann.locality, ann.num_localities).with_tile(Axis::Columns, span);
            if let Some(name) = &ann.name {
                result = result.with_name(name.as_str());
            }
            // Every locality checks the row tiling before any product, so
            // a local shape error cannot strand peers inside the gather.
            let key = collective_key(comm.as_ref(), op, ann.name.as_deref(), node);
            let rows = Value::List(span_value(span).to_vec());
            let diagnostic = diagnostic.clone();
            Ok(all_gather(comm.as_ref(), &key, rows).map(move |gathered| {
                let spans = gathered
                    .iter()
                    .map(|m| m.as_list().and_then(int_pair).ok_or_else(|| bad_message("row tile", m)))
                    .collect::<Result<Vec<_>, _>>()?;
                let extent = spans.iter().map(|s| s.stop).max().unwrap_or(0);
                check_coverage(&spans, extent)?;
                let site = Site {
                    name: op.name(),
                    diagnostic: &diagnostic,
                };
                let product = kernels::dot_values(&strip_value(&a), &b, &site)?;
                crate::annotation::annotate(product, result)
            }))
        }
        (Some(x), Some(y)) => {
            let contraction = match (a.rank(), b.rank()) {
                (Some(1), Some(1)) | (Some(2), Some(1)) => Axis::Columns,
                _ => {
                    return Err(EvalError::invalid_argument(format!(
                        "dot_d supports vector·vector and matrix·vector, got ranks {:?} and {:?}",
                        a.rank(),
                        b.rank()
                    )))
                }
            };
            let (ax, sa) = x.single_axis()?;
            let (ay, sb) = y.single_axis()?;
            if ax != contraction || ay != Axis::Columns || sa != sb {
                warn!(left = %x, right = %y, "dot_d contraction tiles differ");
                return Err(EvalError::distribution(format!(
                    "dot_d operands are not tiled alike along the contraction axis ({x} vs {y})"
                )));
            }
            let partial = kernels::dot_values(&strip_value(&a), &strip_value(&b), &site)?;
            let key = collective_key(comm.as_ref(), op, x.name.as_deref(), node);
            let [start, stop] = span_value(sa);
            let contribution = Value::List(vec![start, stop, partial]);
            let diagnostic = diagnostic.clone();
            Ok(all_gather(comm.as_ref(), &key, contribution).map(move |partials| {
                let site = Site {
                    name: op.name(),
                    diagnostic: &diagnostic,
                };
                let mut spans = Vec::with_capacity(partials.len());
                let mut seen = Vec::new();
                let mut total: Option<Value> = None;
                for message in &partials {
                    let Some([start, stop, partial]) = message.as_list() else {
                        return Err(bad_message("partial product", message));
                    };
                    let span = int_pair(&[start.clone(), stop.clone()]).ok_or_else(|| bad_message("partial product", message))?;
                    spans.push(span);
                    // A replicated tile contributes once.
                    if seen.contains(&span) {
                        continue;
                    }
                    seen.push(span);
                    total = Some(match total {
                        None => partial.clone(),
                        Some(sum) => kernels::add_values(&sum, partial, &site)?,
                    });
                }
                let extent = spans.iter().map(|s| s.stop).max().unwrap_or(0);
                check_coverage(&spans, extent)?;
                total.ok_or_else(|| EvalError::distribution("dot_d gathered no partial products"))
            }))
        }
        (None, Some(_)) | (Some(_), None) => Err(EvalError::distribution(
            "dot_d needs both operands tiled alike, or a row-tiled matrix and a whole vector",
        )),
    }
}

fn strip_value(value: &Value) -> Value {
    match value {
        Value::Array(a) => Value::Array(crate::annotation::strip(a)),
        other => other.clone(),
    }
}
