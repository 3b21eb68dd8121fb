// Kernels: the numeric-kernel boundary
//
// A kernel receives fully evaluated operands and a Site (its primitive type
// name plus the node's fully-qualified name for messages). It returns a
// value or a typed error and never sees futures, frames or the tree.
//
// Builtins are plain function pointers in a descriptor table, registered
// into the pattern registry by builtins.rs. Anything implementing Kernel can
// be registered the same way.
//
// Elementwise kernels broadcast scalars (and rank-0 arrays) against arrays,
// require equal shapes otherwise, and carry the operands' annotation over
// to the result: an elementwise result has the same tiling as its inputs.

use std::fmt;

use indexmap::IndexMap;

use crate::annotation::Annotation;
use crate::error::EvalError;
use crate::value::{Array, ElementType, Storage, Value};

/// Where a kernel runs: primitive type name and the node's qualified name.
#[derive(Debug, Clone, Copy)]
pub struct Site<'a> {
    pub name: &'a str,
    pub diagnostic: &'a str,
}

pub trait Kernel: Send + Sync {
    /// Primitive type name, e.g. `__add`.
    fn name(&self) -> &str;

    /// Call patterns the kernel is registered under, e.g. `__add(_1, _2)`.
    fn patterns(&self) -> Vec<String>;

    fn eval(&self, args: &[Value], site: &Site<'_>) -> Result<Value, EvalError>;
}

impl fmt::Debug for dyn Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kernel({})", self.name())
    }
}

pub type KernelFn = fn(&[Value], &Site<'_>) -> Result<Value, EvalError>;

/// A builtin kernel.
#[derive(Clone, Copy)]
pub struct KernelDescriptor {
    pub name: &'static str,
    pub patterns: &'static [&'static str],
    pub doc: &'static str,
    pub implementation: KernelFn,
}

impl Kernel for KernelDescriptor {
    fn name(&self) -> &str {
        self.name
    }

    fn patterns(&self) -> Vec<String> {
        self.patterns.iter().map(|p| p.to_string()).collect()
    }

    fn eval(&self, args: &[Value], site: &Site<'_>) -> Result<Value, EvalError> {
        (self.implementation)(args, site)
    }
}

pub static BUILTIN_KERNELS: &[KernelDescriptor] = &[
    KernelDescriptor {
        name: "__add",
        patterns: &["__add(_1, _2)"],
        doc: "Elementwise sum; concatenates two strings.",
        implementation: add,
    },
    KernelDescriptor {
        name: "__sub",
        patterns: &["__sub(_1, _2)"],
        doc: "Elementwise difference.",
        implementation: |args, site| arithmetic(args, site, Arith::Sub),
    },
    KernelDescriptor {
        name: "__mul",
        patterns: &["__mul(_1, _2)"],
        doc: "Elementwise product.",
        implementation: |args, site| arithmetic(args, site, Arith::Mul),
    },
    KernelDescriptor {
        name: "__div",
        patterns: &["__div(_1, _2)"],
        doc: "Elementwise quotient; integer division truncates.",
        implementation: |args, site| arithmetic(args, site, Arith::Div),
    },
    KernelDescriptor {
        name: "__mod",
        patterns: &["__mod(_1, _2)"],
        doc: "Elementwise remainder.",
        implementation: |args, site| arithmetic(args, site, Arith::Mod),
    },
    KernelDescriptor {
        name: "__minus",
        patterns: &["__minus(_1)"],
        doc: "Elementwise negation.",
        implementation: negate,
    },
    KernelDescriptor {
        name: "__not",
        patterns: &["__not(_1)"],
        doc: "Logical negation; elementwise on arrays.",
        implementation: not,
    },
    KernelDescriptor {
        name: "__lt",
        patterns: &["__lt(_1, _2)"],
        doc: "Less than.",
        implementation: |args, site| compare(args, site, Cmp::Lt),
    },
    KernelDescriptor {
        name: "__le",
        patterns: &["__le(_1, _2)"],
        doc: "Less than or equal.",
        implementation: |args, site| compare(args, site, Cmp::Le),
    },
    KernelDescriptor {
        name: "__gt",
        patterns: &["__gt(_1, _2)"],
        doc: "Greater than.",
        implementation: |args, site| compare(args, site, Cmp::Gt),
    },
    KernelDescriptor {
        name: "__ge",
        patterns: &["__ge(_1, _2)"],
        doc: "Greater than or equal.",
        implementation: |args, site| compare(args, site, Cmp::Ge),
    },
    KernelDescriptor {
        name: "__eq",
        patterns: &["__eq(_1, _2)"],
        doc: "Equality; elementwise on numeric operands.",
        implementation: |args, site| compare(args, site, Cmp::Eq),
    },
    KernelDescriptor {
        name: "__ne",
        patterns: &["__ne(_1, _2)"],
        doc: "Inequality; elementwise on numeric operands.",
        implementation: |args, site| compare(args, site, Cmp::Ne),
    },
    KernelDescriptor {
        name: "make_list",
        patterns: &["make_list(__1)"],
        doc: "List of the arguments.",
        implementation: |args, _| Ok(Value::List(args.to_vec())),
    },
    KernelDescriptor {
        name: "make_dict",
        patterns: &["make_dict(__1)"],
        doc: "Dictionary from (key, value) pairs.",
        implementation: make_dict,
    },
    KernelDescriptor {
        name: "shape",
        patterns: &["shape(_1)"],
        doc: "Shape as a list of extents.",
        implementation: shape,
    },
    KernelDescriptor {
        name: "ndim",
        patterns: &["ndim(_1)"],
        doc: "Rank.",
        implementation: ndim,
    },
    KernelDescriptor {
        name: "size",
        patterns: &["size(_1)"],
        doc: "Number of elements (or list/dictionary entries).",
        implementation: size,
    },
    KernelDescriptor {
        name: "sum",
        patterns: &["sum(_1)"],
        doc: "Sum of all elements.",
        implementation: sum,
    },
    KernelDescriptor {
        name: "dot",
        patterns: &["dot(_1, _2)"],
        doc: "Inner product, matrix-vector or matrix-matrix product.",
        implementation: |args, site| {
            let [a, b] = exactly::<2>(args, site)?;
            dot_values(a, b, site)
        },
    },
    KernelDescriptor {
        name: "constant",
        patterns: &["constant(_1)", "constant(_1, _2)"],
        doc: "Array of the given shape filled with one value.",
        implementation: constant,
    },
    KernelDescriptor {
        name: "assert",
        patterns: &["assert(_1)", "assert(_1, _2)"],
        doc: "Fail with an assertion error unless the condition holds.",
        implementation: assert,
    },
];

/// Builtin kernel by name.
pub fn lookup(name: &str) -> Option<&'static KernelDescriptor> {
    BUILTIN_KERNELS.iter().find(|k| k.name == name)
}

// Operand handling

fn exactly<'a, const N: usize>(args: &'a [Value], site: &Site<'_>) -> Result<&'a [Value; N], EvalError> {
    args.try_into().map_err(|_| {
        EvalError::invalid_argument(format!(
            "{} takes {N} operand(s), got {}",
            site.name,
            args.len()
        ))
    })
}

/// A numeric operand flattened for elementwise work.
struct Operand {
    shape: Vec<usize>,
    data: Storage,
    annotation: Option<Annotation>,
    is_array: bool,
}

impl Operand {
    fn of(value: &Value, site: &Site<'_>) -> Result<Operand, EvalError> {
        let scalar = |data: Storage| Operand {
            shape: Vec::new(),
            data,
            annotation: None,
            is_array: false,
        };
        Ok(match value {
            Value::Bool(b) => scalar(vec![*b].into()),
            Value::Int(n) => scalar(vec![*n].into()),
            Value::Float(x) => scalar(vec![*x].into()),
            Value::Array(a) => Operand {
                shape: a.shape(),
                data: a.storage().clone(),
                annotation: a.annotation().cloned(),
                is_array: true,
            },
            other => {
                return Err(EvalError::type_mismatch(format!(
                    "{}: expected a numeric operand, got {}",
                    site.name,
                    other.type_name()
                )))
            }
        })
    }

    /// Storage index of logical element `i` (scalars broadcast).
    fn at(&self, i: usize) -> usize {
        if self.shape.is_empty() {
            0
        } else {
            i
        }
    }
}

fn is_numeric(value: &Value) -> bool {
    matches!(
        value,
        Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Array(_)
    )
}

fn broadcast_shape(a: &Operand, b: &Operand, site: &Site<'_>) -> Result<Vec<usize>, EvalError> {
    if a.shape.is_empty() {
        Ok(b.shape.clone())
    } else if b.shape.is_empty() || a.shape == b.shape {
        Ok(a.shape.clone())
    } else {
        Err(EvalError::shape_mismatch(format!(
            "{}: operand shapes {:?} and {:?} differ",
            site.name, a.shape, b.shape
        )))
    }
}

/// Elementwise results keep the operands' tiling; two different tilings
/// cannot be combined locally.
fn merge_annotations(a: &Operand, b: &Operand, site: &Site<'_>) -> Result<Option<Annotation>, EvalError> {
    match (&a.annotation, &b.annotation) {
        (Some(x), Some(y)) if x.tiles() != y.tiles() => Err(EvalError::distribution(format!(
            "{}: operands are tiled differently ({x} vs {y})",
            site.name
        ))),
        (Some(x), _) | (None, Some(x)) => Ok(Some(x.clone())),
        (None, None) => Ok(None),
    }
}

fn finish(shape: &[usize], data: Storage, annotation: Option<Annotation>, any_array: bool) -> Result<Value, EvalError> {
    if !any_array {
        if let Some(v) = data.get(0) {
            return Ok(v);
        }
    }
    Ok(Value::Array(
        Array::from_shape(shape, data)?.with_annotation(annotation),
    ))
}

fn overflow(site: &Site<'_>) -> EvalError {
    EvalError::invalid_argument(format!("{}: integer overflow", site.name))
}

// Arithmetic

#[derive(Debug, Clone, Copy)]
enum Arith {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl Arith {
    fn int(self, x: i64, y: i64, site: &Site<'_>) -> Result<i64, EvalError> {
        let result = match self {
            Arith::Add => x.checked_add(y),
            Arith::Sub => x.checked_sub(y),
            Arith::Mul => x.checked_mul(y),
            Arith::Div | Arith::Mod if y == 0 => {
                return Err(EvalError::invalid_argument(format!(
                    "{}: integer division by zero",
                    site.name
                )))
            }
            Arith::Div => x.checked_div(y),
            Arith::Mod => x.checked_rem(y),
        };
        result.ok_or_else(|| overflow(site))
    }

    fn float(self, x: f64, y: f64) -> f64 {
        match self {
            Arith::Add => x + y,
            Arith::Sub => x - y,
            Arith::Mul => x * y,
            Arith::Div => x / y,
            Arith::Mod => x % y,
        }
    }
}

fn add(args: &[Value], site: &Site<'_>) -> Result<Value, EvalError> {
    if let [Value::Str(a), Value::Str(b)] = args {
        return Ok(Value::Str(format!("{a}{b}")));
    }
    arithmetic(args, site, Arith::Add)
}

/// Elementwise sum of two operands.
pub fn add_values(a: &Value, b: &Value, site: &Site<'_>) -> Result<Value, EvalError> {
    arithmetic(&[a.clone(), b.clone()], site, Arith::Add)
}

fn arithmetic(args: &[Value], site: &Site<'_>, op: Arith) -> Result<Value, EvalError> {
    let [a, b] = exactly::<2>(args, site)?;
    let (a, b) = (Operand::of(a, site)?, Operand::of(b, site)?);
    let shape = broadcast_shape(&a, &b, site)?;
    let n: usize = shape.iter().product();
    let floats = a.data.element_type() == ElementType::Float || b.data.element_type() == ElementType::Float;
    let data = if floats {
        let (x, y) = (a.data.to_f64(), b.data.to_f64());
        Storage::from(
            (0..n)
                .map(|i| op.float(x[a.at(i)], y[b.at(i)]))
                .collect::<Vec<f64>>(),
        )
    } else {
        let x = a.data.to_i64().unwrap_or_default();
        let y = b.data.to_i64().unwrap_or_default();
        Storage::from(
            (0..n)
                .map(|i| op.int(x[a.at(i)], y[b.at(i)], site))
                .collect::<Result<Vec<i64>, EvalError>>()?,
        )
    };
    let annotation = merge_annotations(&a, &b, site)?;
    finish(&shape, data, annotation, a.is_array || b.is_array)
}

fn negate(args: &[Value], site: &Site<'_>) -> Result<Value, EvalError> {
    let [a] = exactly::<1>(args, site)?;
    let a = Operand::of(a, site)?;
    let data = match &a.data {
        Storage::Float(d) => Storage::from(d.iter().map(|x| -x).collect::<Vec<f64>>()),
        other => Storage::from(
            other
                .to_i64()
                .unwrap_or_default()
                .into_iter()
                .map(|n| n.checked_neg().ok_or_else(|| overflow(site)))
                .collect::<Result<Vec<i64>, EvalError>>()?,
        ),
    };
    finish(&a.shape, data, a.annotation, a.is_array)
}

fn not(args: &[Value], site: &Site<'_>) -> Result<Value, EvalError> {
    let [a] = exactly::<1>(args, site)?;
    if !matches!(a, Value::Array(_)) {
        return Ok(Value::Bool(!a.truthy()?));
    }
    let a = Operand::of(a, site)?;
    let data = Storage::from(a.data.to_f64().into_iter().map(|x| x == 0.0).collect::<Vec<bool>>());
    finish(&a.shape, data, a.annotation, true)
}

// Comparison

#[derive(Debug, Clone, Copy)]
enum Cmp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Cmp {
    fn holds<T: PartialOrd>(self, x: T, y: T) -> bool {
        match self {
            Cmp::Lt => x < y,
            Cmp::Le => x <= y,
            Cmp::Gt => x > y,
            Cmp::Ge => x >= y,
            Cmp::Eq => x == y,
            Cmp::Ne => x != y,
        }
    }
}

fn compare(args: &[Value], site: &Site<'_>, cmp: Cmp) -> Result<Value, EvalError> {
    let [a, b] = exactly::<2>(args, site)?;
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => return Ok(Value::Bool(cmp.holds(x, y))),
        _ if !(is_numeric(a) && is_numeric(b)) => {
            return match cmp {
                Cmp::Eq => Ok(Value::Bool(a == b)),
                Cmp::Ne => Ok(Value::Bool(a != b)),
                _ => Err(EvalError::type_mismatch(format!(
                    "{}: cannot order {} and {}",
                    site.name,
                    a.type_name(),
                    b.type_name()
                ))),
            }
        }
        _ => {}
    }
    let (a, b) = (Operand::of(a, site)?, Operand::of(b, site)?);
    let shape = broadcast_shape(&a, &b, site)?;
    let n: usize = shape.iter().product();
    let floats = a.data.element_type() == ElementType::Float || b.data.element_type() == ElementType::Float;
    let result: Vec<bool> = if floats {
        let (x, y) = (a.data.to_f64(), b.data.to_f64());
        (0..n).map(|i| cmp.holds(x[a.at(i)], y[b.at(i)])).collect()
    } else {
        let x = a.data.to_i64().unwrap_or_default();
        let y = b.data.to_i64().unwrap_or_default();
        (0..n).map(|i| cmp.holds(x[a.at(i)], y[b.at(i)])).collect()
    };
    let annotation = merge_annotations(&a, &b, site)?;
    finish(&shape, Storage::from(result), annotation, a.is_array || b.is_array)
}

// Structure

fn make_dict(args: &[Value], site: &Site<'_>) -> Result<Value, EvalError> {
    let mut map = IndexMap::new();
    for arg in args {
        match arg.as_list() {
            Some([Value::Str(key), value]) => {
                map.insert(key.clone(), value.clone());
            }
            _ => {
                return Err(EvalError::type_mismatch(format!(
                    "{}: entries must be (\"key\", value) pairs, got {arg}",
                    site.name
                )))
            }
        }
    }
    Ok(Value::Dict(map))
}

fn shape(args: &[Value], site: &Site<'_>) -> Result<Value, EvalError> {
    let [a] = exactly::<1>(args, site)?;
    let dims = a.shape().ok_or_else(|| {
        EvalError::type_mismatch(format!("{}: {} has no shape", site.name, a.type_name()))
    })?;
    Ok(Value::List(dims.into_iter().map(|d| Value::Int(d as i64)).collect()))
}

fn ndim(args: &[Value], site: &Site<'_>) -> Result<Value, EvalError> {
    let [a] = exactly::<1>(args, site)?;
    let rank = a.rank().ok_or_else(|| {
        EvalError::type_mismatch(format!("{}: {} has no rank", site.name, a.type_name()))
    })?;
    Ok(Value::Int(rank as i64))
}

fn size(args: &[Value], site: &Site<'_>) -> Result<Value, EvalError> {
    let [a] = exactly::<1>(args, site)?;
    let n = match a {
        Value::Bool(_) | Value::Int(_) | Value::Float(_) => 1,
        Value::Array(array) => array.len(),
        Value::List(items) => items.len(),
        Value::Dict(map) => map.len(),
        Value::Str(s) => s.chars().count(),
        other => {
            return Err(EvalError::type_mismatch(format!(
                "{}: {} has no size",
                site.name,
                other.type_name()
            )))
        }
    };
    Ok(Value::Int(n as i64))
}

fn sum(args: &[Value], site: &Site<'_>) -> Result<Value, EvalError> {
    let [a] = exactly::<1>(args, site)?;
    let a = Operand::of(a, site)?;
    Ok(match &a.data {
        Storage::Float(d) => Value::Float(d.iter().sum()),
        other => Value::Int(
            other
                .to_i64()
                .unwrap_or_default()
                .into_iter()
                .try_fold(0i64, |acc, n| acc.checked_add(n))
                .ok_or_else(|| overflow(site))?,
        ),
    })
}

/// `c[m×n] = a[m×k] · b[k×n]`, row-major.
/// `None` when `add` or `mul` does.
fn matmul<T: Copy>(
    a: &[T],
    b: &[T],
    (m, k, n): (usize, usize, usize),
    zero: T,
    add: fn(T, T) -> Option<T>,
    mul: fn(T, T) -> Option<T>,
) -> Option<Vec<T>> {
    let mut out = vec![zero; m * n];
    for i in 0..m {
        for p in 0..k {
            let x = a[i * k + p];
            for j in 0..n {
                out[i * n + j] = add(out[i * n + j], mul(x, b[p * n + j])?)?;
            }
        }
    }
    Some(out)
}

/// Product of two operands by rank: vector·vector gives a scalar,
/// matrix·vector and vector·matrix a vector, matrix·matrix a matrix.
/// Scalars multiply elementwise.
pub fn dot_values(a: &Value, b: &Value, site: &Site<'_>) -> Result<Value, EvalError> {
    let (Some(ra), Some(rb)) = (a.rank(), b.rank()) else {
        return Err(EvalError::type_mismatch(format!(
            "{}: expected numeric operands, got {} and {}",
            site.name,
            a.type_name(),
            b.type_name()
        )));
    };
    if ra == 0 || rb == 0 {
        return arithmetic(&[a.clone(), b.clone()], site, Arith::Mul);
    }
    let (sa, sb) = (a.shape().unwrap_or_default(), b.shape().unwrap_or_default());
    let (dims, out_shape) = match (sa.as_slice(), sb.as_slice()) {
        ([k1], [k2]) if k1 == k2 => ((1, *k1, 1), vec![]),
        ([m, k1], [k2]) if k1 == k2 => ((*m, *k1, 1), vec![*m]),
        ([k1], [k2, n]) if k1 == k2 => ((1, *k1, *n), vec![*n]),
        ([m, k1], [k2, n]) if k1 == k2 => ((*m, *k1, *n), vec![*m, *n]),
        _ => {
            return Err(EvalError::shape_mismatch(format!(
                "{}: cannot multiply shapes {sa:?} and {sb:?}",
                site.name
            )))
        }
    };
    let (Some(xa), Some(xb)) = (a.as_array(), b.as_array()) else {
        return Err(EvalError::type_mismatch(format!("{}: expected arrays", site.name)));
    };
    let floats = xa.element_type() == ElementType::Float || xb.element_type() == ElementType::Float;
    let data = if floats {
        Storage::from(matmul(
            &xa.storage().to_f64(),
            &xb.storage().to_f64(),
            dims,
            0.0,
            |x, y| Some(x + y),
            |x, y| Some(x * y),
        )
        .ok_or_else(|| overflow(site))?)
    } else {
        Storage::from(matmul(
            &xa.storage().to_i64().unwrap_or_default(),
            &xb.storage().to_i64().unwrap_or_default(),
            dims,
            0i64,
            i64::checked_add,
            i64::checked_mul,
        )
        .ok_or_else(|| overflow(site))?)
    };
    if out_shape.is_empty() {
        return data
            .get(0)
            .ok_or_else(|| EvalError::shape_mismatch(format!("{}: empty product", site.name)));
    }
    Ok(Value::Array(Array::from_shape(&out_shape, data)?))
}

fn constant(args: &[Value], site: &Site<'_>) -> Result<Value, EvalError> {
    let (fill, dims) = match args {
        [fill] => (fill, Vec::new()),
        [fill, shape] => (fill, extents(shape, site)?),
        _ => {
            return Err(EvalError::new(crate::error::EvalErrorKind::ArityMismatch {
                expected: 2,
                got: args.len(),
            }))
        }
    };
    let fill = fill.scalar().ok_or_else(|| {
        EvalError::type_mismatch(format!(
            "{}: fill value must be a numeric scalar, got {}",
            site.name,
            fill.type_name()
        ))
    })?;
    let n = dims
        .iter()
        .try_fold(1usize, |n, &d| n.checked_mul(d))
        .ok_or_else(|| EvalError::invalid_argument(format!("{}: shape {dims:?} is too large", site.name)))?;
    let data = Storage::from_scalars(&vec![fill; n.max(1)])?;
    let data = if n == 0 { data.slice(0..0) } else { data };
    Ok(Value::Array(Array::from_shape(&dims, data)?))
}

fn extents(shape: &Value, site: &Site<'_>) -> Result<Vec<usize>, EvalError> {
    let extent = |v: &Value| {
        v.as_int()
            .filter(|_| !matches!(v, Value::Bool(_)))
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| {
                EvalError::invalid_argument(format!(
                    "{}: extents must be non-negative integers, got {v}",
                    site.name
                ))
            })
    };
    match shape {
        Value::List(items) if items.len() <= crate::value::MAX_RANK => items.iter().map(extent).collect(),
        Value::List(items) => Err(EvalError::invalid_argument(format!(
            "{}: rank {} exceeds the maximum rank",
            site.name,
            items.len()
        ))),
        other => Ok(vec![extent(other)?]),
    }
}

fn assert(args: &[Value], site: &Site<'_>) -> Result<Value, EvalError> {
    let (cond, message) = match args {
        [cond] => (cond, None),
        [cond, message] => (cond, Some(message)),
        _ => {
            return Err(EvalError::new(crate::error::EvalErrorKind::ArityMismatch {
                expected: 1,
                got: args.len(),
            }))
        }
    };
    if cond.truthy()? {
        return Ok(Value::Nil);
    }
    let message = match message {
        Some(Value::Str(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => format!("condition in {} is false", site.diagnostic),
    };
    Err(EvalError::assertion(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::Axis;
    use crate::error::EvalErrorKind;
    use crate::tiling::TileSpan;

    const SITE: Site<'static> = Site {
        name: "test",
        diagnostic: "/physl/test$0/0",
    };

    fn call(name: &str, args: &[Value]) -> Result<Value, EvalError> {
        lookup(name).unwrap().eval(args, &SITE)
    }

    #[test]
    fn scalar_arithmetic_keeps_integer_type() {
        assert_eq!(call("__add", &[Value::Int(41), Value::Int(1)]).unwrap(), Value::Int(42));
        assert_eq!(call("__div", &[Value::Int(7), Value::Int(2)]).unwrap(), Value::Int(3));
        assert_eq!(call("__mul", &[Value::Int(2), Value::Float(1.5)]).unwrap(), Value::Float(3.0));
        assert_eq!(call("__sub", &[Value::Bool(true), Value::Int(1)]).unwrap(), Value::Int(0));
    }

    #[test]
    fn integer_division_by_zero_is_an_error() {
        let err = call("__mod", &[Value::Int(1), Value::Int(0)]).unwrap_err();
        assert!(matches!(err.kind, EvalErrorKind::InvalidArgument(_)));
        assert_eq!(call("__div", &[Value::Float(1.0), Value::Float(0.0)]).unwrap(), Value::Float(f64::INFINITY));
    }

    #[test]
    fn broadcasting_and_shape_checks() {
        let v = Value::vector(vec![1i64, 2, 3]);
        assert_eq!(call("__mul", &[v.clone(), Value::Int(2)]).unwrap(), Value::vector(vec![2i64, 4, 6]));
        let w = Value::vector(vec![1i64, 2]);
        let err = call("__add", &[v, w]).unwrap_err();
        assert!(matches!(err.kind, EvalErrorKind::ShapeMismatch(_)));
    }

    #[test]
    fn elementwise_keeps_tiling() {
        let span = TileSpan::new(5, 8).unwrap();
        let ann = Annotation::new(1, 2).with_tile(Axis::Columns, span);
        let v = Value::Array(Array::from_shape(&[3], vec![1.0, 2.0, 3.0]).unwrap().with_annotation(Some(ann)));
        let out = call("__add", &[v.clone(), Value::Float(1.0)]).unwrap();
        assert_eq!(out.annotation().unwrap().span(Axis::Columns), Some(span));
        let other = Value::Array(
            Array::from_shape(&[3], vec![1.0, 2.0, 3.0])
                .unwrap()
                .with_annotation(Some(Annotation::new(0, 2).with_tile(Axis::Columns, TileSpan::new(0, 3).unwrap()))),
        );
        let err = call("__add", &[v, other]).unwrap_err();
        assert!(matches!(err.kind, EvalErrorKind::DistributionInvariantViolation(_)));
    }

    #[test]
    fn comparisons() {
        assert_eq!(call("__lt", &[Value::Int(1), Value::Float(1.5)]).unwrap(), Value::Bool(true));
        assert_eq!(call("__eq", &[Value::Str("a".into()), Value::Str("a".into())]).unwrap(), Value::Bool(true));
        // Numeric comparison promotes, unlike structural Value equality.
        let zero_rank = Value::Array(Array::from_shape(&[], vec![3i64]).unwrap());
        assert_ne!(Value::Float(3.0), zero_rank);
        assert_eq!(call("__eq", &[Value::Float(3.0), zero_rank]).unwrap(), Value::Bool(true));
        assert_eq!(call("__ne", &[Value::Nil, Value::Int(0)]).unwrap(), Value::Bool(true));
        assert!(call("__lt", &[Value::Nil, Value::Int(0)]).is_err());
        assert_eq!(
            call("__ge", &[Value::vector(vec![1i64, 5]), Value::Int(2)]).unwrap(),
            Value::vector(vec![false, true])
        );
    }

    #[test]
    fn unary_kernels() {
        assert_eq!(call("__minus", &[Value::Int(3)]).unwrap(), Value::Int(-3));
        assert_eq!(call("__not", &[Value::Int(0)]).unwrap(), Value::Bool(true));
        assert_eq!(call("__not", &[Value::vector(vec![0.0, 2.0])]).unwrap(), Value::vector(vec![true, false]));
    }

    #[test]
    fn dot_by_rank() {
        let a = Value::vector(vec![1i64, 2, 3]);
        let b = Value::vector(vec![4i64, 5, 6]);
        assert_eq!(call("dot", &[a.clone(), b]).unwrap(), Value::Int(32));
        let m = Value::matrix(2, 3, vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0]).unwrap();
        assert_eq!(call("dot", &[m.clone(), a]).unwrap(), Value::vector(vec![1.0, 2.0]));
        let err = call("dot", &[m.clone(), m]).unwrap_err();
        assert!(matches!(err.kind, EvalErrorKind::ShapeMismatch(_)));
    }

    #[test]
    fn integer_dot_overflow_is_an_error() {
        let big = Value::vector(vec![1i64 << 62, 1 << 62]);
        let err = call("dot", &[big, Value::vector(vec![2i64, 2])]).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::InvalidArgument("test: integer overflow".into()));
        let sum = Value::vector(vec![i64::MAX, 1]);
        assert!(call("dot", &[sum, Value::vector(vec![1i64, 1])]).is_err());
    }

    #[test]
    fn introspection() {
        let m = Value::matrix(2, 3, vec![0i64; 6]).unwrap();
        assert_eq!(call("shape", &[m.clone()]).unwrap(), Value::List(vec![Value::Int(2), Value::Int(3)]));
        assert_eq!(call("ndim", &[m.clone()]).unwrap(), Value::Int(2));
        assert_eq!(call("size", &[m]).unwrap(), Value::Int(6));
        assert_eq!(call("sum", &[Value::vector(vec![true, true, false])]).unwrap(), Value::Int(2));
    }

    #[test]
    fn constant_and_assert() {
        let c = call("constant", &[Value::Float(0.5), Value::List(vec![Value::Int(2), Value::Int(2)])]).unwrap();
        assert_eq!(c, Value::matrix(2, 2, vec![0.5; 4]).unwrap());
        let empty = call("constant", &[Value::Int(1), Value::Int(0)]).unwrap();
        assert_eq!(empty.shape(), Some(vec![0]));
        assert_eq!(call("assert", &[Value::Bool(true)]).unwrap(), Value::Nil);
        let huge = Value::List(vec![Value::Int(1 << 40), Value::Int(1 << 40)]);
        let err = call("constant", &[Value::Int(0), huge]).unwrap_err();
        assert!(matches!(err.kind, EvalErrorKind::InvalidArgument(_)), "{err:?}");
        let err = call("assert", &[Value::Int(0), Value::Str("x must be set".into())]).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::AssertionFailure("x must be set".into()));
    }

    #[test]
    fn dictionaries() {
        let pair = Value::List(vec![Value::Str("a".into()), Value::Int(1)]);
        let d = call("make_dict", &[pair]).unwrap();
        assert_eq!(call("size", &[d]).unwrap(), Value::Int(1));
        assert!(call("make_dict", &[Value::Int(1)]).is_err());
    }
}
