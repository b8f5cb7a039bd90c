//! Flattening of nested arguments into marker-delimited sequences
//!
//! Each top-level argument starts with a [`Flat::Dimension`] marker. Lists and
//! tuples record their length and kind, and their nested sequences carry
//! markers of their own. Scalars get an empty marker, so a flat sequence can
//! always be rebuilt without outside knowledge.

use crate::error::FlattenError;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqKind {
    List,
    Tuple,
}

/// One slot of a flattened argument list
#[derive(Debug, Clone, PartialEq)]
pub enum Flat {
    /// Length and kind of the sequence that follows; `None` for a scalar
    Dimension(Option<(usize, SeqKind)>),
    Value(Value),
}

fn seq_parts(value: &Value) -> Option<(&[Value], SeqKind)> {
    match value {
        Value::List(items) => Some((items, SeqKind::List)),
        Value::Tuple(items) => Some((items, SeqKind::Tuple)),
        _ => None,
    }
}

fn flatten_nested(value: &Value, out: &mut Vec<Flat>) {
    match seq_parts(value) {
        Some((items, kind)) => {
            out.push(Flat::Dimension(Some((items.len(), kind))));
            for item in items {
                flatten_nested(item, out);
            }
        }
        None => out.push(Flat::Value(value.clone())),
    }
}

/// Flatten every argument, marking where each one starts
pub fn flatten_args(args: &[Value]) -> Vec<Flat> {
    let mut out = Vec::new();
    for arg in args {
        if seq_parts(arg).is_none() {
            out.push(Flat::Dimension(None));
        }
        flatten_nested(arg, &mut out);
    }
    out
}

fn build_seq(kind: SeqKind, items: Vec<Value>) -> Value {
    match kind {
        SeqKind::List => Value::List(items),
        SeqKind::Tuple => Value::Tuple(items),
    }
}

fn rebuild_nested<I>(flat: &mut I) -> Result<Value, FlattenError>
where
    I: Iterator<Item = Flat>,
{
    match flat.next() {
        Some(Flat::Value(value)) => Ok(value),
        Some(Flat::Dimension(Some((len, kind)))) => {
            let items = (0..len)
                .map(|_| rebuild_nested(flat))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(build_seq(kind, items))
        }
        Some(Flat::Dimension(None)) => Err(FlattenError::UnexpectedMarker),
        None => Err(FlattenError::UnexpectedEnd),
    }
}

/// Inverse of [`flatten_args`]
pub fn rebuild_args(flat: Vec<Flat>) -> Result<Vec<Value>, FlattenError> {
    let mut iter = flat.into_iter().peekable();
    let mut args = Vec::new();
    while let Some(head) = iter.peek() {
        if matches!(head, Flat::Dimension(None)) {
            iter.next();
            match iter.next() {
                Some(Flat::Value(value)) => args.push(value),
                Some(Flat::Dimension(_)) => return Err(FlattenError::UnexpectedMarker),
                None => return Err(FlattenError::UnexpectedEnd),
            }
        } else {
            args.push(rebuild_nested(&mut iter)?);
        }
    }
    Ok(args)
}

/// Remembers the shape of output arguments across a flattened call
///
/// The caller hands in all arguments with the inputs first. Inputs come back
/// flattened; outputs are only measured, and [`ArgLayout::rebuild`] later
/// pours the produced values back into their original nesting.
#[derive(Debug, Default)]
pub struct ArgLayout {
    out_flat: Vec<Flat>,
}

impl ArgLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the flattened inputs and the number of flat output values
    pub fn flatten(&mut self, in_len: usize, args: &[Value]) -> (Vec<Flat>, usize) {
        let split = in_len.min(args.len());
        let (inputs, outputs) = args.split_at(split);
        self.out_flat = flatten_args(outputs);
        (flatten_args(inputs), self.out_len())
    }

    /// Number of value slots in the remembered outputs
    pub fn out_len(&self) -> usize {
        self.out_flat
            .iter()
            .filter(|slot| matches!(slot, Flat::Value(_)))
            .count()
    }

    /// Rebuild outputs from new flat values, one per value slot
    pub fn rebuild(&self, out_values: Vec<Value>) -> Result<Vec<Value>, FlattenError> {
        let expected = self.out_len();
        if out_values.len() != expected {
            return Err(FlattenError::LengthMismatch {
                expected,
                actual: out_values.len(),
            });
        }

        let mut values = out_values.into_iter();
        let mut flat = Vec::with_capacity(self.out_flat.len());
        for slot in &self.out_flat {
            match slot {
                Flat::Dimension(dim) => flat.push(Flat::Dimension(*dim)),
                Flat::Value(_) => {
                    let value = values.next().ok_or(FlattenError::UnexpectedEnd)?;
                    flat.push(Flat::Value(value));
                }
            }
        }
        rebuild_args(flat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arg() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            any::<i64>().prop_map(Value::Int),
            "[a-z]{0,6}".prop_map(Value::Str),
            Just(Value::Null),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::List),
                proptest::collection::vec(inner, 0..4).prop_map(Value::Tuple),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_rebuild_recovers_nesting(args in proptest::collection::vec(arg(), 0..5)) {
            let flat = flatten_args(&args);
            prop_assert_eq!(rebuild_args(flat).unwrap(), args);
        }
    }

    #[test]
    fn test_scalar_and_nested_markers() {
        let args = vec![
            Value::Int(7),
            Value::List(vec![Value::Int(1), Value::Tuple(vec![Value::Int(2), Value::Int(3)])]),
        ];
        let flat = flatten_args(&args);
        assert_eq!(
            flat,
            vec![
                Flat::Dimension(None),
                Flat::Value(Value::Int(7)),
                Flat::Dimension(Some((2, SeqKind::List))),
                Flat::Value(Value::Int(1)),
                Flat::Dimension(Some((2, SeqKind::Tuple))),
                Flat::Value(Value::Int(2)),
                Flat::Value(Value::Int(3)),
            ]
        );
    }

    #[test]
    fn test_layout_rebuilds_outputs() {
        let args = vec![
            Value::Int(1),
            Value::List(vec![Value::Null, Value::List(vec![Value::Null])]),
            Value::Null,
        ];
        let mut layout = ArgLayout::new();
        let (inputs, out_len) = layout.flatten(1, &args);
        assert_eq!(inputs, vec![Flat::Dimension(None), Flat::Value(Value::Int(1))]);
        assert_eq!(out_len, 3);

        let rebuilt = layout
            .rebuild(vec![Value::Int(10), Value::Int(20), Value::Int(30)])
            .unwrap();
        assert_eq!(
            rebuilt,
            vec![
                Value::List(vec![Value::Int(10), Value::List(vec![Value::Int(20)])]),
                Value::Int(30),
            ]
        );

        assert_eq!(
            layout.rebuild(vec![Value::Int(1)]),
            Err(FlattenError::LengthMismatch {
                expected: 3,
                actual: 1
            })
        );
    }

    #[test]
    fn test_truncated_sequence() {
        let flat = vec![Flat::Dimension(Some((2, SeqKind::List))), Flat::Value(Value::Int(1))];
        assert_eq!(rebuild_args(flat), Err(FlattenError::UnexpectedEnd));
    }
}
