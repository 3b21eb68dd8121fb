// Value: runtime values produced and consumed by primitives
//
// Arrays are rank-typed: a rank-R array is a Dense<R> with a `[usize; R]`
// shape, and ArrayData is the closed set R0..R4. Kernels narrow to the rank
// they support (`vector()`, `matrix()`) instead of re-checking shape vectors.
//
// Storage is reference counted, so cloning a Value never copies elements.
//
// Equality is defined for every pair of variants. Different variants are
// never equal, with one exception: a scalar equals a rank-0 array holding the
// same element (same element type, same value).

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::annotation::Annotation;
use crate::ast::Ast;
use crate::error::EvalError;
use crate::primitive::FunctionRef;

/// Element type of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementType {
    Bool,
    Int,
    Float,
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ElementType::Bool => "bool",
            ElementType::Int => "int64",
            ElementType::Float => "double",
        })
    }
}

/// Flat row-major element storage.
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    Bool(Arc<[bool]>),
    Int(Arc<[i64]>),
    Float(Arc<[f64]>),
}

impl Storage {
    pub fn element_type(&self) -> ElementType {
        match self {
            Storage::Bool(_) => ElementType::Bool,
            Storage::Int(_) => ElementType::Int,
            Storage::Float(_) => ElementType::Float,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Storage::Bool(d) => d.len(),
            Storage::Int(d) => d.len(),
            Storage::Float(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `i` as a scalar value.
    pub fn get(&self, i: usize) -> Option<Value> {
        match self {
            Storage::Bool(d) => d.get(i).map(|&b| Value::Bool(b)),
            Storage::Int(d) => d.get(i).map(|&n| Value::Int(n)),
            Storage::Float(d) => d.get(i).map(|&x| Value::Float(x)),
        }
    }

    /// Elements widened to i64 (bools as 0/1). Floats are not narrowed.
    pub fn to_i64(&self) -> Option<Vec<i64>> {
        match self {
            Storage::Bool(d) => Some(d.iter().map(|&b| b as i64).collect()),
            Storage::Int(d) => Some(d.to_vec()),
            Storage::Float(_) => None,
        }
    }

    /// Elements widened to f64.
    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            Storage::Bool(d) => d.iter().map(|&b| if b { 1.0 } else { 0.0 }).collect(),
            Storage::Int(d) => d.iter().map(|&n| n as f64).collect(),
            Storage::Float(d) => d.to_vec(),
        }
    }

    /// Copy of the elements in `range`.
    pub fn slice(&self, range: std::ops::Range<usize>) -> Storage {
        match self {
            Storage::Bool(d) => Storage::Bool(d[range].into()),
            Storage::Int(d) => Storage::Int(d[range].into()),
            Storage::Float(d) => Storage::Float(d[range].into()),
        }
    }

    /// Gather elements by index, in order.
    pub fn gather(&self, indices: impl Iterator<Item = usize>) -> Storage {
        match self {
            Storage::Bool(d) => Storage::Bool(indices.map(|i| d[i]).collect()),
            Storage::Int(d) => Storage::Int(indices.map(|i| d[i]).collect()),
            Storage::Float(d) => Storage::Float(indices.map(|i| d[i]).collect()),
        }
    }

    /// Concatenate storages of one element type.
    pub fn concat(parts: &[Storage]) -> Result<Storage, EvalError> {
        let Some(first) = parts.first() else {
            return Ok(Storage::Float(Arc::from(Vec::<f64>::new())));
        };
        let ty = first.element_type();
        if let Some(other) = parts.iter().find(|p| p.element_type() != ty) {
            return Err(EvalError::type_mismatch(format!(
                "cannot concatenate {ty} and {} elements",
                other.element_type()
            )));
        }
        Ok(match ty {
            ElementType::Bool => Storage::Bool(
                parts
                    .iter()
                    .flat_map(|p| match p {
                        Storage::Bool(d) => d.to_vec(),
                        _ => Vec::new(),
                    })
                    .collect(),
            ),
            ElementType::Int => Storage::Int(parts.iter().filter_map(Storage::to_i64).flatten().collect()),
            ElementType::Float => Storage::Float(parts.iter().flat_map(Storage::to_f64).collect()),
        })
    }

    /// Build storage from scalar values, promoting to the widest element
    /// type present (bool < int64 < double).
    pub fn from_scalars(values: &[Value]) -> Result<Storage, EvalError> {
        let mut ty = if values.is_empty() {
            ElementType::Float
        } else {
            ElementType::Bool
        };
        for v in values {
            let t = v.scalar_element_type().ok_or_else(|| {
                EvalError::type_mismatch(format!("array element must be numeric, got {}", v.type_name()))
            })?;
            ty = ty.max(t);
        }
        Ok(match ty {
            ElementType::Bool => Storage::Bool(values.iter().map(|v| matches!(v.scalar(), Some(Value::Bool(true)))).collect()),
            ElementType::Int => Storage::Int(values.iter().filter_map(|v| v.scalar()?.as_int()).collect()),
            ElementType::Float => Storage::Float(values.iter().filter_map(|v| v.scalar()?.as_float()).collect()),
        })
    }
}

impl From<Vec<bool>> for Storage {
    fn from(v: Vec<bool>) -> Self {
        Storage::Bool(v.into())
    }
}

impl From<Vec<i64>> for Storage {
    fn from(v: Vec<i64>) -> Self {
        Storage::Int(v.into())
    }
}

impl From<Vec<f64>> for Storage {
    fn from(v: Vec<f64>) -> Self {
        Storage::Float(v.into())
    }
}

/// A dense rank-R array.
#[derive(Debug, Clone, PartialEq)]
pub struct Dense<const R: usize> {
    shape: [usize; R],
    data: Storage,
}

impl<const R: usize> Dense<R> {
    pub fn new(shape: [usize; R], data: Storage) -> Result<Self, EvalError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(EvalError::shape_mismatch(format!(
                "shape {shape:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> [usize; R] {
        self.shape
    }

    pub fn data(&self) -> &Storage {
        &self.data
    }
}

/// An array of rank 0 to 4.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    R0(Dense<0>),
    R1(Dense<1>),
    R2(Dense<2>),
    R3(Dense<3>),
    R4(Dense<4>),
}

pub const MAX_RANK: usize = 4;

impl ArrayData {
    /// Build from a dynamic shape; the rank picks the variant.
    pub fn from_shape(shape: &[usize], data: Storage) -> Result<Self, EvalError> {
        Ok(match *shape {
            [] => ArrayData::R0(Dense::new([], data)?),
            [a] => ArrayData::R1(Dense::new([a], data)?),
            [a, b] => ArrayData::R2(Dense::new([a, b], data)?),
            [a, b, c] => ArrayData::R3(Dense::new([a, b, c], data)?),
            [a, b, c, d] => ArrayData::R4(Dense::new([a, b, c, d], data)?),
            _ => {
                return Err(EvalError::shape_mismatch(format!(
                    "rank {} exceeds the maximum rank {MAX_RANK}",
                    shape.len()
                )))
            }
        })
    }

    pub fn rank(&self) -> usize {
        match self {
            ArrayData::R0(_) => 0,
            ArrayData::R1(_) => 1,
            ArrayData::R2(_) => 2,
            ArrayData::R3(_) => 3,
            ArrayData::R4(_) => 4,
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        match self {
            ArrayData::R0(d) => d.shape.to_vec(),
            ArrayData::R1(d) => d.shape.to_vec(),
            ArrayData::R2(d) => d.shape.to_vec(),
            ArrayData::R3(d) => d.shape.to_vec(),
            ArrayData::R4(d) => d.shape.to_vec(),
        }
    }

    pub fn storage(&self) -> &Storage {
        match self {
            ArrayData::R0(d) => &d.data,
            ArrayData::R1(d) => &d.data,
            ArrayData::R2(d) => &d.data,
            ArrayData::R3(d) => &d.data,
            ArrayData::R4(d) => &d.data,
        }
    }

    pub fn element_type(&self) -> ElementType {
        self.storage().element_type()
    }

    pub fn len(&self) -> usize {
        self.storage().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn vector(&self) -> Option<&Dense<1>> {
        match self {
            ArrayData::R1(d) => Some(d),
            _ => None,
        }
    }

    pub fn matrix(&self) -> Option<&Dense<2>> {
        match self {
            ArrayData::R2(d) => Some(d),
            _ => None,
        }
    }
}

/// An array value, optionally carrying its distribution annotation.
#[derive(Debug, Clone)]
pub struct Array {
    data: ArrayData,
    annotation: Option<Annotation>,
}

impl Array {
    pub fn new(data: ArrayData) -> Self {
        Self {
            data,
            annotation: None,
        }
    }

    pub fn from_shape(shape: &[usize], storage: impl Into<Storage>) -> Result<Self, EvalError> {
        ArrayData::from_shape(shape, storage.into()).map(Self::new)
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    pub fn annotation(&self) -> Option<&Annotation> {
        self.annotation.as_ref()
    }

    pub fn with_annotation(mut self, annotation: Option<Annotation>) -> Self {
        self.annotation = annotation;
        self
    }

    pub fn rank(&self) -> usize {
        self.data.rank()
    }

    pub fn shape(&self) -> Vec<usize> {
        self.data.shape()
    }

    pub fn storage(&self) -> &Storage {
        self.data.storage()
    }

    pub fn element_type(&self) -> ElementType {
        self.data.element_type()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Annotations are distribution metadata, not part of the logical value.
impl PartialEq for Array {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

/// A runtime value.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Array),
    List(Vec<Value>),
    Dict(IndexMap<String, Value>),
    Function(FunctionRef),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int64",
            Value::Float(_) => "double",
            Value::Str(_) => "string",
            Value::Array(a) => match a.rank() {
                0 => "array (rank 0)",
                1 => "vector",
                2 => "matrix",
                3 => "tensor (rank 3)",
                _ => "tensor (rank 4)",
            },
            Value::List(_) => "list",
            Value::Dict(_) => "dictionary",
            Value::Function(_) => "function",
        }
    }

    pub fn vector(data: impl Into<Storage>) -> Value {
        let data = data.into();
        let n = data.len();
        Value::Array(Array::new(ArrayData::R1(Dense { shape: [n], data })))
    }

    pub fn matrix(rows: usize, cols: usize, data: impl Into<Storage>) -> Result<Value, EvalError> {
        Ok(Value::Array(Array::new(ArrayData::R2(Dense::new(
            [rows, cols],
            data.into(),
        )?))))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            Value::Int(n) => Some(*n as f64),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionRef> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn annotation(&self) -> Option<&Annotation> {
        self.as_array().and_then(Array::annotation)
    }

    /// Rank: 0 for scalars and rank-0 arrays.
    pub fn rank(&self) -> Option<usize> {
        match self {
            Value::Bool(_) | Value::Int(_) | Value::Float(_) => Some(0),
            Value::Array(a) => Some(a.rank()),
            _ => None,
        }
    }

    /// Shape: empty for scalars.
    pub fn shape(&self) -> Option<Vec<usize>> {
        match self {
            Value::Bool(_) | Value::Int(_) | Value::Float(_) => Some(Vec::new()),
            Value::Array(a) => Some(a.shape()),
            _ => None,
        }
    }

    pub fn element_type(&self) -> Option<ElementType> {
        match self {
            Value::Array(a) => Some(a.element_type()),
            other => other.scalar_element_type(),
        }
    }

    /// The single element of a scalar or rank-0 array.
    pub fn scalar(&self) -> Option<Value> {
        match self {
            Value::Bool(_) | Value::Int(_) | Value::Float(_) => Some(self.clone()),
            Value::Array(a) if a.rank() == 0 => a.storage().get(0),
            _ => None,
        }
    }

    fn scalar_element_type(&self) -> Option<ElementType> {
        match self {
            Value::Bool(_) => Some(ElementType::Bool),
            Value::Int(_) => Some(ElementType::Int),
            Value::Float(_) => Some(ElementType::Float),
            Value::Array(a) if a.rank() == 0 => Some(a.element_type()),
            _ => None,
        }
    }

    /// Truth value used by `if`, `while` and the logical operators.
    pub fn truthy(&self) -> Result<bool, EvalError> {
        Ok(match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(x) => *x != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Dict(map) => !map.is_empty(),
            Value::Function(_) => true,
            Value::Array(a) => match self.scalar() {
                Some(v) => return v.truthy(),
                None => {
                    return Err(EvalError::type_mismatch(format!(
                        "truth value of an array with shape {:?} is ambiguous",
                        a.shape()
                    )))
                }
            },
        })
    }

    /// Stack values into an array one rank higher: scalars become a vector,
    /// equally shaped rank-r arrays become a rank r+1 array.
    pub fn stack(items: &[Value]) -> Result<Value, EvalError> {
        if items.iter().all(|v| v.scalar().is_some() && !matches!(v, Value::Array(_))) {
            return Ok(Value::vector(Storage::from_scalars(items)?));
        }
        let mut inner_shape: Option<Vec<usize>> = None;
        let mut parts = Vec::with_capacity(items.len());
        for item in items {
            let array = match item {
                Value::Array(a) => a,
                other => {
                    return Err(EvalError::type_mismatch(format!(
                        "cannot mix {} with arrays in an array literal",
                        other.type_name()
                    )))
                }
            };
            let shape = array.shape();
            match &inner_shape {
                Some(s) if *s != shape => {
                    return Err(EvalError::shape_mismatch(format!(
                        "array literal rows have shapes {s:?} and {shape:?}"
                    )))
                }
                Some(_) => {}
                None => inner_shape = Some(shape),
            }
            parts.push(array.storage().clone());
        }
        let ty = parts
            .iter()
            .map(Storage::element_type)
            .max()
            .unwrap_or(ElementType::Float);
        let parts: Vec<Storage> = parts.iter().map(|p| promote(p, ty)).collect();
        let mut shape = vec![items.len()];
        shape.extend(inner_shape.unwrap_or_default());
        Ok(Value::Array(Array::new(ArrayData::from_shape(
            &shape,
            Storage::concat(&parts)?,
        )?)))
    }

    /// The literal AST for values that have one (nil, scalars, strings,
    /// lists of those).
    pub fn to_literal_ast(&self) -> Option<Ast> {
        Some(match self {
            Value::Nil => Ast::Nil,
            Value::Bool(b) => Ast::Bool(*b),
            Value::Int(n) => Ast::Int(*n),
            Value::Float(x) => Ast::Float(*x),
            Value::Str(s) => Ast::Str(s.clone()),
            Value::List(items) => Ast::List(
                items
                    .iter()
                    .map(Value::to_literal_ast)
                    .collect::<Option<Vec<_>>>()?,
            ),
            _ => return None,
        })
    }
}

/// Widen storage to `ty`.
pub fn promote(storage: &Storage, ty: ElementType) -> Storage {
    if storage.element_type() == ty {
        return storage.clone();
    }
    match ty {
        ElementType::Bool => storage.clone(),
        ElementType::Int => Storage::Int(storage.to_i64().unwrap_or_default().into()),
        ElementType::Float => Storage::Float(storage.to_f64().into()),
    }
}

/// Structural equality. Element types must match, so `Float(3.0)` differs
/// from `Int(3)` and from a rank-0 Int array holding 3. PhySL's `==`
/// operator promotes numbers and is implemented by the `__eq` kernel.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Dict(a), Value::Dict(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a.same_function(b),
            (Value::Array(a), scalar) | (scalar, Value::Array(a))
                if a.rank() == 0 && matches!(scalar, Value::Bool(_) | Value::Int(_) | Value::Float(_)) =>
            {
                a.storage().get(0).as_ref() == Some(scalar)
            }
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<Array> for Value {
    fn from(a: Array) -> Self {
        Value::Array(a)
    }
}

// Printing

fn write_array(f: &mut fmt::Formatter<'_>, shape: &[usize], data: &Storage, offset: usize) -> fmt::Result {
    let Some((&n, rest)) = shape.split_first() else {
        return match data.get(offset) {
            Some(v) => write!(f, "{v}"),
            None => f.write_str("?"),
        };
    };
    let stride: usize = rest.iter().product();
    f.write_str("[")?;
    for i in 0..n {
        if i > 0 {
            f.write_str(", ")?;
        }
        write_array(f, rest, data, offset + i * stride)?;
    }
    f.write_str("]")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Array(a) => write_array(f, &a.shape(), a.storage(), 0),
            Value::List(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Value::Dict(map) => {
                f.write_str("dict(")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "({k:?}, {v})")?;
                }
                f.write_str(")")
            }
            Value::Function(func) => write!(f, "{func}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_picks_variant() {
        let a = Array::from_shape(&[2, 3], vec![1i64, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(a.rank(), 2);
        assert!(a.data().matrix().is_some());
        assert!(a.data().vector().is_none());
        assert_eq!(a.shape(), vec![2, 3]);
        assert_eq!(a.element_type(), ElementType::Int);
    }

    #[test]
    fn shape_must_match_storage() {
        let err = Array::from_shape(&[2, 2], vec![1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err.kind, crate::error::EvalErrorKind::ShapeMismatch(_)));
        assert!(Array::from_shape(&[1, 1, 1, 1, 1], vec![1.0]).is_err());
    }

    #[test]
    fn cross_variant_equality() {
        let zero_rank = Value::Array(Array::from_shape(&[], vec![3i64]).unwrap());
        assert_eq!(Value::Int(3), zero_rank);
        assert_eq!(zero_rank, Value::Int(3));
        assert_ne!(Value::Float(3.0), zero_rank);
        assert_ne!(Value::Int(1), Value::Float(1.0));
        assert_ne!(Value::Nil, Value::List(vec![]));
        assert_ne!(Value::Str("1".into()), Value::Int(1));
        assert_ne!(Value::vector(vec![3i64]), Value::Int(3));
    }

    #[test]
    fn annotation_is_not_part_of_equality() {
        let plain = Array::from_shape(&[2], vec![1i64, 2]).unwrap();
        let tagged = plain
            .clone()
            .with_annotation(Some(Annotation::new(0, 1)));
        assert_eq!(Value::Array(plain), Value::Array(tagged));
    }

    #[test]
    fn stack_builds_higher_rank() {
        let v = Value::stack(&[Value::Int(1), Value::Float(2.5)]).unwrap();
        assert_eq!(v, Value::vector(vec![1.0, 2.5]));
        let rows = [Value::vector(vec![1i64, 2]), Value::vector(vec![3i64, 4])];
        let m = Value::stack(&rows).unwrap();
        assert_eq!(m.shape(), Some(vec![2, 2]));
        assert_eq!(m.to_string(), "[[1, 2], [3, 4]]");
        let ragged = [Value::vector(vec![1i64]), Value::vector(vec![3i64, 4])];
        assert!(Value::stack(&ragged).is_err());
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Nil.truthy().unwrap());
        assert!(Value::Int(2).truthy().unwrap());
        assert!(!Value::Float(0.0).truthy().unwrap());
        assert!(Value::vector(vec![1i64, 2]).truthy().is_err());
    }

    #[test]
    fn display_list_and_dict() {
        let list = Value::List(vec![Value::Int(1), Value::Str("a".into())]);
        assert_eq!(list.to_string(), "(1, \"a\")");
        let mut map = IndexMap::new();
        map.insert("k".to_string(), Value::Bool(true));
        assert_eq!(Value::Dict(map).to_string(), "dict((\"k\", true))");
    }
}
