// Annotation: per-locality ownership metadata attached to array values
//
// An annotation says "this local array is the tile [start, stop) along these
// axes of a global array, held by locality `id` of `count`". Axes are named
// by position from the innermost: columns, rows, pages, quats. A vector has
// only columns; a matrix has rows and columns. Axes without a tile entry are
// held whole.
//
// Wire format, readable by the ordinary source parser:
//
//   ("args", ("locality", 0, 3), ("name", "x"), ("tile", ("columns", 0, 5)))
//
// The name entry is optional. Distributed primitives use it to key their
// communication, so every locality holding a tile of one array must use the
// same name.

use std::fmt;

use crate::ast::Ast;
use crate::error::{self, EvalError};
use crate::parser;
use crate::tiling::TileSpan;
use crate::value::{Array, Value};

/// A named array axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Axis {
    Quats,
    Pages,
    Rows,
    Columns,
}

impl Axis {
    pub fn name(self) -> &'static str {
        match self {
            Axis::Quats => "quats",
            Axis::Pages => "pages",
            Axis::Rows => "rows",
            Axis::Columns => "columns",
        }
    }

    pub fn from_name(name: &str) -> Option<Axis> {
        match name {
            "quats" => Some(Axis::Quats),
            "pages" => Some(Axis::Pages),
            "rows" => Some(Axis::Rows),
            "columns" => Some(Axis::Columns),
            _ => None,
        }
    }

    /// Axes of a rank-`rank` array, outermost first.
    pub fn for_rank(rank: usize) -> &'static [Axis] {
        static ALL: [Axis; 4] = [Axis::Quats, Axis::Pages, Axis::Rows, Axis::Columns];
        &ALL[4 - rank.min(4)..]
    }

    /// Position of this axis in the shape of a rank-`rank` array.
    pub fn index_in(self, rank: usize) -> Option<usize> {
        Axis::for_rank(rank).iter().position(|&a| a == self)
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub locality: usize,
    pub num_localities: usize,
    pub name: Option<String>,
    tiles: Vec<(Axis, TileSpan)>,
}

impl Annotation {
    pub fn new(locality: usize, num_localities: usize) -> Self {
        Self {
            locality,
            num_localities,
            name: None,
            tiles: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the tile of `axis`, replacing an earlier entry for it.
    pub fn with_tile(mut self, axis: Axis, span: TileSpan) -> Self {
        match self.tiles.iter_mut().find(|(a, _)| *a == axis) {
            Some(entry) => entry.1 = span,
            None => self.tiles.push((axis, span)),
        }
        self
    }

    pub fn with_tiles(self, tiles: impl IntoIterator<Item = (Axis, TileSpan)>) -> Self {
        tiles
            .into_iter()
            .fold(self, |ann, (axis, span)| ann.with_tile(axis, span))
    }

    pub fn tiles(&self) -> &[(Axis, TileSpan)] {
        &self.tiles
    }

    pub fn span(&self, axis: Axis) -> Option<TileSpan> {
        self.tiles
            .iter()
            .find_map(|(a, s)| (*a == axis).then_some(*s))
    }

    /// The single tiled axis, for operations that redistribute along one.
    pub fn single_axis(&self) -> Result<(Axis, TileSpan), EvalError> {
        match self.tiles.as_slice() {
            [(axis, span)] => Ok((*axis, *span)),
            [] => Err(EvalError::distribution("array carries no tile")),
            _ => Err(EvalError::invalid_argument(format!(
                "expected a tile along one axis, got {}",
                self.tiles.len()
            ))),
        }
    }

    /// Every tiled axis must exist for `shape` and match its local extent.
    pub fn check_extents(&self, shape: &[usize]) -> Result<(), EvalError> {
        if self.locality >= self.num_localities {
            return Err(EvalError::distribution(format!(
                "locality {} out of range for {} localities",
                self.locality, self.num_localities
            )));
        }
        for (axis, span) in &self.tiles {
            let Some(i) = axis.index_in(shape.len()) else {
                return Err(EvalError::shape_mismatch(format!(
                    "axis '{axis}' does not exist for a rank-{} array",
                    shape.len()
                )));
            };
            if shape[i] != span.len() {
                return Err(EvalError::shape_mismatch(format!(
                    "tile {span} along '{axis}' has {} elements, local array has {}",
                    span.len(),
                    shape[i]
                )));
            }
        }
        Ok(())
    }

    /// Wire form as a list literal.
    pub fn to_ast(&self) -> Ast {
        let mut entries = vec![
            Ast::Str("args".into()),
            Ast::List(vec![
                Ast::Str("locality".into()),
                Ast::Int(self.locality as i64),
                Ast::Int(self.num_localities as i64),
            ]),
        ];
        if let Some(name) = &self.name {
            entries.push(Ast::List(vec![
                Ast::Str("name".into()),
                Ast::Str(name.clone()),
            ]));
        }
        if !self.tiles.is_empty() {
            entries.push(tiles_to_ast(&self.tiles));
        }
        Ast::List(entries)
    }

    /// Read the wire form back.
    pub fn from_ast(ast: &Ast) -> Result<Self, EvalError> {
        let entries = list_items(ast, "annotation")?;
        match entries.first().and_then(Ast::as_str) {
            Some("args") => {}
            _ => return Err(malformed("annotation must start with \"args\"")),
        }
        let mut locality = None;
        let mut name = None;
        let mut tiles = Vec::new();
        for entry in &entries[1..] {
            let items = list_items(entry, "annotation entry")?;
            match items.first().and_then(Ast::as_str) {
                Some("locality") => match items {
                    [_, id, count] => locality = Some((index(id)?, index(count)?)),
                    _ => return Err(malformed("locality entry needs an id and a count")),
                },
                Some("name") => match items {
                    [_, Ast::Str(s)] => name = Some(s.clone()),
                    _ => return Err(malformed("name entry needs one string")),
                },
                Some("tile") => tiles = tiles_from_ast(entry)?,
                _ => return Err(malformed(format!("unknown annotation entry {entry}"))),
            }
        }
        let (id, count) = locality.ok_or_else(|| malformed("annotation has no locality entry"))?;
        Ok(Self {
            locality: id,
            num_localities: count,
            name,
            tiles: Vec::new(),
        }
        .with_tiles(tiles))
    }

    /// Parse wire-format text.
    pub fn parse(text: &str) -> error::Result<Self> {
        let ast = parser::parse(text)?;
        Ok(Self::from_ast(&ast)?)
    }
}

impl fmt::Display for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ast())
    }
}

fn malformed(msg: impl Into<String>) -> EvalError {
    EvalError::invalid_argument(msg)
}

fn list_items<'a>(ast: &'a Ast, what: &str) -> Result<&'a [Ast], EvalError> {
    match ast {
        Ast::List(items) => Ok(items),
        other => Err(malformed(format!("{what} must be a list, got {other}"))),
    }
}

fn index(ast: &Ast) -> Result<usize, EvalError> {
    ast.as_int()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| malformed(format!("expected a non-negative integer, got {ast}")))
}

/// `("tile", ("rows", 0, 2), ("columns", 0, 5))`
pub fn tiles_to_ast(tiles: &[(Axis, TileSpan)]) -> Ast {
    let mut items = vec![Ast::Str("tile".into())];
    items.extend(tiles.iter().map(|(axis, span)| {
        Ast::List(vec![
            Ast::Str(axis.name().into()),
            Ast::Int(span.start as i64),
            Ast::Int(span.stop as i64),
        ])
    }));
    Ast::List(items)
}

/// Read a `("tile", ...)` list.
pub fn tiles_from_ast(ast: &Ast) -> Result<Vec<(Axis, TileSpan)>, EvalError> {
    let items = list_items(ast, "tile specification")?;
    if items.first().and_then(Ast::as_str) != Some("tile") {
        return Err(malformed(format!("tile specification must start with \"tile\", got {ast}")));
    }
    items[1..]
        .iter()
        .map(|entry| match list_items(entry, "tile entry")? {
            [Ast::Str(axis), start, stop] => {
                let axis = Axis::from_name(axis)
                    .ok_or_else(|| malformed(format!("unknown axis '{axis}'")))?;
                Ok((axis, TileSpan::new(index(start)?, index(stop)?)?))
            }
            _ => Err(malformed(format!("tile entry must be (axis, start, stop), got {entry}"))),
        })
        .collect()
}

/// Read a tile specification passed as a runtime value.
pub fn tiles_from_value(value: &Value) -> Result<Vec<(Axis, TileSpan)>, EvalError> {
    let ast = value
        .to_literal_ast()
        .ok_or_else(|| malformed(format!("tile specification must be a list, got {}", value.type_name())))?;
    tiles_from_ast(&ast)
}

/// Attach an annotation to an array value.
pub fn attach(
    value: Value,
    locality: usize,
    num_localities: usize,
    tiles: Vec<(Axis, TileSpan)>,
) -> Result<Value, EvalError> {
    let annotation = Annotation::new(locality, num_localities).with_tiles(tiles);
    annotate(value, annotation)
}

/// Attach a prepared annotation after checking it against the local shape.
pub fn annotate(value: Value, annotation: Annotation) -> Result<Value, EvalError> {
    match value {
        Value::Array(array) => {
            annotation.check_extents(&array.shape())?;
            Ok(Value::Array(array.with_annotation(Some(annotation))))
        }
        other => Err(EvalError::type_mismatch(format!(
            "only arrays can be annotated, got {}",
            other.type_name()
        ))),
    }
}

/// The annotation of a value, if it carries one.
pub fn extract(value: &Value) -> Option<&Annotation> {
    value.annotation()
}

/// Drop the annotation, keeping the data.
pub fn strip(array: &Array) -> Array {
    array.clone().with_annotation(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(start: usize, stop: usize) -> TileSpan {
        TileSpan::new(start, stop).unwrap()
    }

    #[test]
    fn axes_by_rank() {
        assert_eq!(Axis::for_rank(1), &[Axis::Columns]);
        assert_eq!(Axis::for_rank(2), &[Axis::Rows, Axis::Columns]);
        assert_eq!(Axis::Rows.index_in(2), Some(0));
        assert_eq!(Axis::Rows.index_in(1), None);
        assert_eq!(Axis::Quats.index_in(4), Some(0));
    }

    #[test]
    fn wire_format_round_trips() {
        let ann = Annotation::new(1, 3)
            .with_name("x")
            .with_tile(Axis::Rows, span(0, 2))
            .with_tile(Axis::Columns, span(5, 9));
        let text = ann.to_string();
        assert_eq!(
            text,
            r#"("args", ("locality", 1, 3), ("name", "x"), ("tile", ("rows", 0, 2), ("columns", 5, 9)))"#
        );
        assert_eq!(Annotation::parse(&text).unwrap(), ann);
    }

    #[test]
    fn rejects_malformed_wire_text() {
        assert!(Annotation::parse(r#"("args", ("tile", ("columns", 0, 1)))"#).is_err());
        assert!(Annotation::parse(r#"("meta", ("locality", 0, 1))"#).is_err());
        assert!(Annotation::parse(r#"("args", ("locality", 0, 1), ("tile", ("diagonal", 0, 1)))"#).is_err());
        assert!(Annotation::parse(r#"("args", ("locality", 0, 1), ("tile", ("columns", 3, 1)))"#).is_err());
    }

    #[test]
    fn attach_checks_local_extent() {
        let v = Value::vector(vec![1.0, 2.0, 3.0]);
        let ok = attach(v.clone(), 0, 2, vec![(Axis::Columns, span(0, 3))]).unwrap();
        assert_eq!(extract(&ok).unwrap().span(Axis::Columns), Some(span(0, 3)));
        assert!(attach(v.clone(), 0, 2, vec![(Axis::Columns, span(0, 4))]).is_err());
        assert!(attach(v.clone(), 0, 2, vec![(Axis::Rows, span(0, 3))]).is_err());
        assert!(attach(v, 2, 2, vec![]).is_err());
        assert!(attach(Value::Int(1), 0, 1, vec![]).is_err());
    }

    #[test]
    fn tiles_from_runtime_value() {
        let spec = Value::List(vec![
            Value::Str("tile".into()),
            Value::List(vec![Value::Str("columns".into()), Value::Int(4), Value::Int(9)]),
        ]);
        assert_eq!(tiles_from_value(&spec).unwrap(), vec![(Axis::Columns, span(4, 9))]);
    }
}
