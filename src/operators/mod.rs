//! Operator Registry
//!
//! The closed set of primitive operators. Each [`Op`] carries its bound
//! keyword arguments (functions, indexes, counts) and knows its declared
//! signature; [`Op::make_vertex`] unifies that signature against the actual
//! argument types, grounds the result type, and binds the runtime closure
//! into a typed vertex.
//!
//! Derived operators (integrate, distinct, the lifted join, aggregates,
//! transitive closure) are not vertices: they expand to sub-queries over
//! these primitives. See [`derived`].

pub mod derived;
pub mod group;
pub mod linear;

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::index::Index;
use crate::ir::{OperatorKind, Path, Vertex, VertexBinary, VertexUnary};
use crate::value::{DataType, Value};

use self::linear::{MapFn, MapManyFn, PredFn};

const T: DataType = DataType::Var("T");
const K: DataType = DataType::Var("K");

/// A primitive operator with its keyword arguments bound.
#[derive(Clone)]
pub enum Op {
    Identity,
    IdentityDontRemove,
    /// Pin a Z-set to the in-memory representation.
    EnsureMemory,
    Map { out: DataType, f: MapFn },
    MapMany { out: DataType, f: MapManyFn },
    Filter { f: PredFn },
    Neg,
    Add,
    Haitch,
    MakeSet,
    MakeScalar,
    Reduce { out: DataType, zero: Value, pick: MapFn },
    Delay,
    DelayIndexed { indexes: Vec<Index> },
    Join { on_left: Index, on_right: Index },
    FirstN { index: Index, n: usize },
    Group { by: Index },
    Flatten,
    MakeIndexedPairs { index: Index },
    MakeGrouped { index: Index },
    GetKeys,
    PickRelevant { index: Index },
}

impl Op {
    pub fn kind(&self) -> OperatorKind {
        match self {
            Op::Identity => OperatorKind::Identity,
            Op::IdentityDontRemove => OperatorKind::IdentityDontRemove,
            Op::EnsureMemory | Op::Map { .. } => OperatorKind::Map,
            Op::MapMany { .. } => OperatorKind::MapMany,
            Op::Filter { .. } => OperatorKind::Filter,
            Op::Neg => OperatorKind::Neg,
            Op::Add => OperatorKind::Add,
            Op::Haitch => OperatorKind::Haitch,
            Op::MakeSet => OperatorKind::MakeSet,
            Op::MakeScalar => OperatorKind::MakeScalar,
            Op::Reduce { .. } => OperatorKind::Reduce,
            Op::Delay | Op::DelayIndexed { .. } => OperatorKind::Delay,
            Op::Join { .. } => OperatorKind::Join,
            Op::FirstN { .. } => OperatorKind::FirstN,
            Op::Group { .. } => OperatorKind::Group,
            Op::Flatten => OperatorKind::Flatten,
            Op::MakeIndexedPairs { .. } => OperatorKind::MakeIndexedPairs,
            Op::MakeGrouped { .. } => OperatorKind::MakeGrouped,
            Op::GetKeys => OperatorKind::GetKeys,
            Op::PickRelevant { .. } => OperatorKind::PickRelevant,
        }
    }

    /// Declared signature: parameter types (possibly containing type
    /// variables) and the result type.
    pub fn signature(&self) -> Result<(Vec<DataType>, DataType)> {
        Ok(match self {
            Op::Identity | Op::IdentityDontRemove | Op::Neg | Op::Delay => {
                (vec![T], T)
            }
            Op::EnsureMemory | Op::Filter { .. } => {
                (vec![DataType::zset(T)], DataType::zset(T))
            }
            Op::Map { out, .. } | Op::MapMany { out, .. } => {
                (vec![DataType::zset(T)], DataType::zset(out.clone()))
            }
            Op::Add => (vec![T, T], T),
            Op::Haitch => (
                vec![DataType::zset(T), DataType::zset(T)],
                DataType::zset(T),
            ),
            Op::MakeSet => (vec![T], DataType::zset(T)),
            Op::MakeScalar => (vec![DataType::zset(T)], T),
            Op::Reduce { out, .. } => (vec![DataType::zset(T)], out.clone()),
            Op::DelayIndexed { indexes } => {
                let element = indexes
                    .first()
                    .map(|i| i.source.clone())
                    .ok_or_else(|| Error::runtime("delay_indexed requires at least one index"))?;
                (
                    vec![DataType::zset(element.clone())],
                    DataType::zset(element),
                )
            }
            Op::Join { on_left, on_right } => (
                vec![
                    DataType::zset(on_left.source.clone()),
                    DataType::zset(on_right.source.clone()),
                ],
                DataType::zset(DataType::pair(
                    on_left.source.clone(),
                    on_right.source.clone(),
                )),
            ),
            Op::FirstN { index, .. } => (
                vec![DataType::zset(index.source.clone())],
                DataType::zset(index.source.clone()),
            ),
            Op::Group { by } => (
                vec![DataType::zset(by.source.clone())],
                DataType::grouped(DataType::zset(by.source.clone()), by.key_type.clone()),
            ),
            Op::Flatten => (
                vec![DataType::grouped(DataType::zset(T), K)],
                DataType::zset(DataType::pair(T, K)),
            ),
            Op::MakeIndexedPairs { index } => {
                let (t, k) = pair_components(index)?;
                (
                    vec![DataType::grouped(DataType::zset(t.clone()), k.clone())],
                    DataType::zset(DataType::pair(t, k)),
                )
            }
            Op::MakeGrouped { index } => {
                let (t, k) = pair_components(index)?;
                (
                    vec![DataType::zset(DataType::pair(t.clone(), k.clone()))],
                    DataType::grouped(DataType::zset(t), k),
                )
            }
            Op::GetKeys => (vec![DataType::grouped(T, K)], DataType::Keys(Box::new(K))),
            Op::PickRelevant { index } => {
                let (t, k) = pair_components(index)?;
                (
                    vec![
                        DataType::Keys(Box::new(k.clone())),
                        DataType::zset(DataType::pair(t.clone(), k.clone())),
                    ],
                    DataType::zset(DataType::pair(t, k)),
                )
            }
        })
    }

    /// Unify the signature against actual argument types and build the
    /// typed vertex at `path`.
    pub fn make_vertex(&self, path: Path, arg_types: &[DataType]) -> Result<Vertex> {
        let (params, ret) = self.signature()?;
        if params.len() != arg_types.len() {
            return Err(Error::runtime(format!(
                "operator {} takes {} arguments, {} given",
                self.kind(),
                params.len(),
                arg_types.len()
            )));
        }
        let mut bindings = BTreeMap::new();
        for (expected, actual) in params.iter().zip(arg_types.iter()) {
            unify(expected, actual, &mut bindings)?;
        }
        let args: Vec<DataType> = params
            .iter()
            .map(|p| substitute(p, &bindings))
            .collect();
        let ret = substitute(&ret, &bindings);
        if ret.has_var() || args.iter().any(DataType::has_var) {
            let var = first_var(&ret)
                .or_else(|| args.iter().find_map(first_var))
                .unwrap_or("T");
            return Err(Error::runtime(format!(
                "type variable '{var}' could not be resolved for operator {}",
                self.kind()
            )));
        }

        Ok(match self {
            Op::Delay => Vertex::Delay {
                t: args[0].clone(),
                path,
                indexes: Vec::new(),
            },
            Op::DelayIndexed { indexes } => Vertex::Delay {
                t: args[0].clone(),
                path,
                indexes: indexes.clone(),
            },
            _ => self.build_functional_vertex(path, &args, ret)?,
        })
    }

    fn build_functional_vertex(
        &self,
        path: Path,
        args: &[DataType],
        ret: DataType,
    ) -> Result<Vertex> {
        let unary = |t: &DataType, v: DataType, f| {
            Vertex::Unary(VertexUnary {
                t: t.clone(),
                v,
                kind: self.kind(),
                path: path.clone(),
                f,
            })
        };
        let binary = |t: &DataType, u: &DataType, v: DataType, f| {
            Vertex::Binary(VertexBinary {
                t: t.clone(),
                u: u.clone(),
                v,
                kind: self.kind(),
                path: path.clone(),
                f,
            })
        };

        Ok(match self {
            Op::Identity | Op::IdentityDontRemove => {
                unary(&args[0], ret, Rc::new(|d| Ok(d.clone())))
            }
            Op::EnsureMemory => unary(&args[0], ret, linear::ensure_memory()),
            Op::Map { out, f } => unary(&args[0], ret, linear::map(out.clone(), f.clone())),
            Op::MapMany { out, f } => {
                unary(&args[0], ret, linear::map_many(out.clone(), f.clone()))
            }
            Op::Filter { f } => unary(&args[0], ret, linear::filter(f.clone())),
            Op::Neg => unary(&args[0], ret, linear::neg()),
            Op::Add => binary(&args[0], &args[1], ret, linear::add()),
            Op::Haitch => binary(&args[0], &args[1], ret, linear::haitch()),
            Op::MakeSet => {
                let element = args[0].clone();
                unary(&args[0], ret, linear::make_set(element))
            }
            Op::MakeScalar => {
                let zero = ret.zero_value()?;
                unary(&args[0], ret, linear::make_scalar(zero))
            }
            Op::Reduce { zero, pick, .. } => unary(
                &args[0],
                ret,
                linear::reduce(zero.clone(), pick.clone()),
            ),
            Op::Join { on_left, on_right } => {
                let out = DataType::pair(on_left.source.clone(), on_right.source.clone());
                binary(
                    &args[0],
                    &args[1],
                    ret,
                    linear::join(on_left.clone(), on_right.clone(), out),
                )
            }
            Op::FirstN { index, n } => {
                unary(&args[0], ret, linear::first_n(index.clone(), *n))
            }
            Op::Group { by } => unary(
                &args[0],
                ret,
                group::group(by.clone(), by.source.clone()),
            ),
            Op::Flatten => {
                let out_elem = zset_element(&ret)?;
                unary(&args[0], ret.clone(), group::flatten(out_elem))
            }
            Op::MakeIndexedPairs { index } => {
                let out_elem = zset_element(&ret)?;
                unary(
                    &args[0],
                    ret.clone(),
                    group::make_indexed_pairs(index.clone(), out_elem),
                )
            }
            Op::MakeGrouped { index } => {
                let (t, _) = pair_components(index)?;
                unary(&args[0], ret, group::make_grouped(index.clone(), t))
            }
            Op::GetKeys => unary(&args[0], ret, group::get_keys()),
            Op::PickRelevant { index } => {
                let out_elem = zset_element(&ret)?;
                binary(
                    &args[0],
                    &args[1],
                    ret.clone(),
                    group::pick_relevant(index.clone(), out_elem),
                )
            }
            Op::Delay | Op::DelayIndexed { .. } => unreachable!("handled by make_vertex"),
        })
    }
}

fn pair_components(index: &Index) -> Result<(DataType, DataType)> {
    match &index.source {
        DataType::Pair(t, k) => Ok(((**t).clone(), (**k).clone())),
        other => Err(Error::runtime(format!(
            "expected an index over pairs, saw index over {other}"
        ))),
    }
}

fn zset_element(t: &DataType) -> Result<DataType> {
    match t {
        DataType::ZSet(inner) => Ok((**inner).clone()),
        other => Err(Error::runtime(format!("expected a Z-set type, saw {other}"))),
    }
}

// ---------------------------------------------------------------------------
// Unification
// ---------------------------------------------------------------------------

/// Bind type variables in `expected` against `actual`.
pub fn unify(
    expected: &DataType,
    actual: &DataType,
    bindings: &mut BTreeMap<&'static str, DataType>,
) -> Result<()> {
    match (expected, actual) {
        (DataType::Var(name), actual) => match bindings.get(name) {
            Some(bound) if bound == actual => Ok(()),
            Some(bound) => Err(Error::runtime(format!(
                "type variable '{name}' bound to {bound} cannot also be {actual}"
            ))),
            None => {
                bindings.insert(name, actual.clone());
                Ok(())
            }
        },
        (DataType::ZSet(e), DataType::ZSet(a))
        | (DataType::Set(e), DataType::Set(a))
        | (DataType::Variadic(e), DataType::Variadic(a))
        | (DataType::Keys(e), DataType::Keys(a)) => unify(e, a, bindings),
        (DataType::Pair(e1, e2), DataType::Pair(a1, a2))
        | (DataType::Grouped(e1, e2), DataType::Grouped(a1, a2)) => {
            unify(e1, a1, bindings)?;
            unify(e2, a2, bindings)
        }
        (DataType::Tuple(expecteds), DataType::Tuple(actuals))
            if expecteds.len() == actuals.len() =>
        {
            for (e, a) in expecteds.iter().zip(actuals.iter()) {
                unify(e, a, bindings)?;
            }
            Ok(())
        }
        (expected, actual) if expected == actual => Ok(()),
        (expected, actual) => Err(Error::runtime(format!(
            "cannot unify expected type {expected} with {actual}"
        ))),
    }
}

/// Replace bound type variables.
pub fn substitute(t: &DataType, bindings: &BTreeMap<&'static str, DataType>) -> DataType {
    match t {
        DataType::Var(name) => bindings.get(name).cloned().unwrap_or_else(|| t.clone()),
        DataType::ZSet(e) => DataType::zset(substitute(e, bindings)),
        DataType::Set(e) => DataType::Set(Box::new(substitute(e, bindings))),
        DataType::Variadic(e) => DataType::Variadic(Box::new(substitute(e, bindings))),
        DataType::Keys(e) => DataType::Keys(Box::new(substitute(e, bindings))),
        DataType::Pair(a, b) => {
            DataType::pair(substitute(a, bindings), substitute(b, bindings))
        }
        DataType::Grouped(a, b) => {
            DataType::grouped(substitute(a, bindings), substitute(b, bindings))
        }
        DataType::Tuple(items) => {
            DataType::Tuple(items.iter().map(|i| substitute(i, bindings)).collect())
        }
        other => other.clone(),
    }
}

fn first_var(t: &DataType) -> Option<&'static str> {
    match t {
        DataType::Var(name) => Some(name),
        DataType::ZSet(e) | DataType::Set(e) | DataType::Variadic(e) | DataType::Keys(e) => {
            first_var(e)
        }
        DataType::Pair(a, b) | DataType::Grouped(a, b) => first_var(a).or_else(|| first_var(b)),
        DataType::Tuple(items) | DataType::Union(items) => items.iter().find_map(first_var),
        _ => None,
    }
}
