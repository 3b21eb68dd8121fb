// Names: fully-qualified primitive names
//
//   /<scheme>/<primitive>$<sequence>[$<instance>]/<compile-id>[$<line>[$<column>]]
//
//   /physl/__add$0/3$2$9        second line, column 9, first __add of unit 3
//   /physl/variable$1$x/3$1$8   second variable node, bound to `x`
//
// `sequence` counts instantiations of one primitive type within a
// compilation unit, so a name is unique inside its unit and stays the same
// every time the tree is evaluated. Nodes without a source position (the
// implicit block around a multi-expression snippet) omit line and column.

use std::collections::HashMap;
use std::fmt;

use crate::token::Span;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrimitiveName {
    pub scheme: String,
    pub primitive: String,
    pub sequence: usize,
    pub instance: Option<String>,
    pub compile_id: usize,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

impl PrimitiveName {
    /// Split a fully-qualified name back into its parts.
    pub fn parse(text: &str) -> Option<PrimitiveName> {
        let mut parts = text.strip_prefix('/')?.split('/');
        let scheme = parts.next()?;
        let node = parts.next()?;
        let unit = parts.next()?;
        if parts.next().is_some() || scheme.is_empty() {
            return None;
        }

        let mut node = node.split('$');
        let primitive = node.next().filter(|p| !p.is_empty())?;
        let sequence: usize = node.next()?.parse().ok()?;
        let instance = node.next().map(str::to_string);
        if node.next().is_some() {
            return None;
        }

        let mut unit = unit.split('$');
        let compile_id: usize = unit.next()?.parse().ok()?;
        let line: Option<usize> = unit.next().map(str::parse).transpose().ok()?;
        let column: Option<usize> = unit.next().map(str::parse).transpose().ok()?;
        if unit.next().is_some() {
            return None;
        }

        Some(PrimitiveName {
            scheme: scheme.to_string(),
            primitive: primitive.to_string(),
            sequence,
            instance,
            compile_id,
            line,
            column,
        })
    }

    /// The name without its compile id. Localities compiling the same text
    /// get the same key, which makes it usable for pairing messages.
    pub fn communication_key(&self) -> String {
        let mut key = format!("/{}/{}${}", self.scheme, self.primitive, self.sequence);
        if let Some(instance) = &self.instance {
            key.push('$');
            key.push_str(instance);
        }
        if let (Some(line), Some(column)) = (self.line, self.column) {
            key.push_str(&format!("/{line}${column}"));
        }
        key
    }
}

impl fmt::Display for PrimitiveName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}${}", self.scheme, self.primitive, self.sequence)?;
        if let Some(instance) = &self.instance {
            write!(f, "${instance}")?;
        }
        write!(f, "/{}", self.compile_id)?;
        if let Some(line) = self.line {
            write!(f, "${line}")?;
            if let Some(column) = self.column {
                write!(f, "${column}")?;
            }
        }
        Ok(())
    }
}

/// Hands out names for one compilation unit.
#[derive(Debug)]
pub struct NameGenerator {
    scheme: String,
    compile_id: usize,
    sequences: HashMap<String, usize>,
}

impl NameGenerator {
    pub fn new(scheme: impl Into<String>, compile_id: usize) -> Self {
        Self {
            scheme: scheme.into(),
            compile_id,
            sequences: HashMap::new(),
        }
    }

    pub fn compile_id(&self) -> usize {
        self.compile_id
    }

    pub fn next(&mut self, primitive: &str, instance: Option<&str>, span: Option<Span>) -> PrimitiveName {
        let counter = self.sequences.entry(primitive.to_string()).or_insert(0);
        let sequence = *counter;
        *counter += 1;
        PrimitiveName {
            scheme: self.scheme.clone(),
            primitive: primitive.to_string(),
            sequence,
            instance: instance.map(str::to_string),
            compile_id: self.compile_id,
            line: span.map(|s| s.line),
            column: span.map(|s| s.col),
        }
    }
}
