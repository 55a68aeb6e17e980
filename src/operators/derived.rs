//! Operator Library
//!
//! The user-facing operator constructors. Primitives pass straight through
//! to a single vertex; derived operators expand to sub-queries over the
//! primitives when the compiler knows the actual argument types:
//!
//! - `integrate(a)` is `added = add(delayed, a); delayed = delay(added)`;
//! - `differentiate(a)` is `a + (-delay(a))`;
//! - `distinct(a)` is the sign-change of its running integral;
//! - `join` is the bilinear incremental form (each side joined against the
//!   other side's integral);
//! - aggregates run `reduce -> integrate -> make_set -> differentiate`;
//! - `first_n` runs over the integral and differentiates the result;
//! - `transitive_closure` drives a join/add/distinct step to a fixpoint
//!   inside each step via `integrate_til_zero`.

use std::rc::Rc;

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::index::Index;
use crate::ir_builder::{Call, QueryDef};
use crate::operators::Op;
use crate::value::{DataType, Value};

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

/// `map(a, f)`: elementwise, counts preserved. `out` is the element type
/// `f` produces.
pub fn map(
    a: &str,
    out: DataType,
    f: impl Fn(&Value) -> Result<Value> + 'static,
) -> Call {
    Call::op(
        Op::Map {
            out,
            f: Rc::new(f),
        },
        &[a],
    )
}

/// `map_many(a, f)`: each produced element inherits its origin's count.
pub fn map_many(
    a: &str,
    out: DataType,
    f: impl Fn(&Value) -> Result<Vec<Value>> + 'static,
) -> Call {
    Call::op(
        Op::MapMany {
            out,
            f: Rc::new(f),
        },
        &[a],
    )
}

/// `filter(a, p)`: keep entries satisfying the predicate.
pub fn filter(a: &str, p: impl Fn(&Value) -> Result<bool> + 'static) -> Call {
    Call::op(Op::Filter { f: Rc::new(p) }, &[a])
}

pub fn neg(a: &str) -> Call {
    Call::op(Op::Neg, &[a])
}

pub fn add(a: &str, b: &str) -> Call {
    Call::op(Op::Add, &[a, b])
}

pub fn make_set(a: &str) -> Call {
    Call::op(Op::MakeSet, &[a])
}

pub fn make_scalar(a: &str) -> Call {
    Call::op(Op::MakeScalar, &[a])
}

pub fn delay(a: &str) -> Call {
    Call::op(Op::Delay, &[a])
}

pub fn delay_indexed(a: &str, indexes: Vec<Index>) -> Call {
    Call::op(Op::DelayIndexed { indexes }, &[a])
}

pub fn identity(a: &str) -> Call {
    Call::op(Op::Identity, &[a])
}

/// Pin a Z-set to the in-memory representation.
pub fn ensure_memory(a: &str) -> Call {
    Call::op(Op::EnsureMemory, &[a])
}

/// `group(a, by)`: partition by key.
pub fn group(a: &str, by: Index) -> Call {
    Call::op(Op::Group { by }, &[a])
}

/// `flatten(a)`: re-emit groups as `(value, key)` pairs.
pub fn flatten(a: &str) -> Call {
    Call::op(Op::Flatten, &[a])
}

// ---------------------------------------------------------------------------
// Integration and differentiation
// ---------------------------------------------------------------------------

fn integrate_def(name: &str, t: DataType, indexes: Option<Vec<Index>>, emit_delay: bool) -> QueryDef {
    let mut def = QueryDef::new(name, vec![("a", t.clone())]);
    def.declare("delayed", t);
    def.assign("added", add("delayed", "a"));
    match indexes {
        Some(indexes) => def.assign("delayed", delay_indexed("added", indexes)),
        None => def.assign("delayed", delay("added")),
    };
    def.ret(if emit_delay { &["delayed"] } else { &["added"] });
    def
}

/// `integrate(a)`: the running sum of the stream.
pub fn integrate(a: &str) -> Call {
    Call::sub("integrate", &[a], |args| {
        Ok(integrate_def("integrate", args[0].clone(), None, false))
    })
}

/// `integrate` with declared indexes on the internal delay state.
pub fn integrate_indexed(a: &str, indexes: Vec<Index>) -> Call {
    Call::sub("integrate_indexed", &[a], move |args| {
        Ok(integrate_def(
            "integrate_indexed",
            args[0].clone(),
            Some(indexes.clone()),
            false,
        ))
    })
}

/// The integral up to the *previous* step.
pub fn integrate_delay(a: &str) -> Call {
    Call::sub("integrate_delay", &[a], |args| {
        Ok(integrate_def("integrate_delay", args[0].clone(), None, true))
    })
}

/// `integrate_delay` with declared indexes on the delay state.
pub fn integrate_delay_indexed(a: &str, indexes: Vec<Index>) -> Call {
    Call::sub("integrate_delay_indexed", &[a], move |args| {
        Ok(integrate_def(
            "integrate_delay_indexed",
            args[0].clone(),
            Some(indexes.clone()),
            true,
        ))
    })
}

/// `differentiate(a)`: the first difference, `a + (-delay(a))`.
pub fn differentiate(a: &str) -> Call {
    Call::sub("differentiate", &[a], |args| {
        let t = args[0].clone();
        let mut def = QueryDef::new("differentiate", vec![("a", t)]);
        def.assign("delayed", delay("a"));
        def.assign("negged", neg("delayed"));
        def.assign("added", add("negged", "a"));
        def.ret(&["added"]);
        Ok(def)
    })
}

/// `distinct(a)`: the sign-change indicator of the running integral.
pub fn distinct(a: &str) -> Call {
    Call::sub("distinct", &[a], |args| {
        let t = args[0].clone();
        let mut def = QueryDef::new("distinct", vec![("a", t)]);
        def.assign("integrated", integrate_delay("a"));
        def.assign("haitched", Call::op(Op::Haitch, &["integrated", "a"]));
        def.ret(&["haitched"]);
        Ok(def)
    })
}

// ---------------------------------------------------------------------------
// Joins
// ---------------------------------------------------------------------------

/// The bilinear incremental equi-join: each side's delta joined against
/// the other side's integral.
pub fn join(l: &str, r: &str, on_left: Index, on_right: Index) -> Call {
    Call::sub("join", &[l, r], move |args| {
        let (lt, rt) = (args[0].clone(), args[1].clone());
        let mut def = QueryDef::new("join", vec![("l", lt), ("r", rt)]);
        def.assign(
            "l_integrated",
            integrate_indexed("l", vec![on_left.clone()]),
        );
        def.assign(
            "r_integrated",
            integrate_delay_indexed("r", vec![on_right.clone()]),
        );
        def.assign(
            "joined_1",
            Call::op(
                Op::Join {
                    on_left: on_left.clone(),
                    on_right: on_right.clone(),
                },
                &["l_integrated", "r"],
            ),
        );
        def.assign(
            "joined_2",
            Call::op(
                Op::Join {
                    on_left: on_left.clone(),
                    on_right: on_right.clone(),
                },
                &["l", "r_integrated"],
            ),
        );
        def.assign("added", add("joined_1", "joined_2"));
        def.ret(&["added"]);
        Ok(def)
    })
}

/// Left outer join: the join plus the unmatched left side paired with the
/// `<EMPTY>` marker.
pub fn outer_join(l: &str, r: &str, on_left: Index, on_right: Index) -> Call {
    Call::sub("outer_join", &[l, r], move |args| {
        let (lt, rt) = (args[0].clone(), args[1].clone());
        let left_elem = match &lt {
            DataType::ZSet(inner) => (**inner).clone(),
            other => {
                return Err(Error::runtime(format!(
                    "outer_join expects Z-set arguments, saw {other}"
                )))
            }
        };
        let right_elem = match &rt {
            DataType::ZSet(inner) => (**inner).clone(),
            other => {
                return Err(Error::runtime(format!(
                    "outer_join expects Z-set arguments, saw {other}"
                )))
            }
        };
        let widened_right = DataType::Union(vec![right_elem, DataType::EmptyMarker]);
        let widened_pair = DataType::pair(left_elem.clone(), widened_right);

        let mut def = QueryDef::new("outer_join", vec![("l", lt), ("r", rt)]);
        def.assign(
            "joined",
            join("l", "r", on_left.clone(), on_right.clone()),
        );
        def.assign(
            "lefted",
            map("joined", left_elem.clone(), |p| p.lookup_path("left")),
        );
        def.assign("negged", neg("lefted"));
        def.assign("left_added", add("l", "negged"));
        def.assign(
            "empty_right_added",
            map("left_added", widened_pair.clone(), |v| {
                Ok(Value::pair(v.clone(), Value::Empty))
            }),
        );
        def.assign("widened", map("joined", widened_pair, |p| Ok(p.clone())));
        def.assign("final_added", add("empty_right_added", "widened"));
        def.ret(&["final_added"]);
        Ok(def)
    })
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

fn aggregate_def(name: &str, t: DataType, out: DataType, zero: Value, pick: Rc<dyn Fn(&Value) -> Result<Value>>) -> QueryDef {
    let mut def = QueryDef::new(name, vec![("a", t)]);
    def.assign(
        "reduced",
        Call::op(
            Op::Reduce {
                out,
                zero,
                pick,
            },
            &["a"],
        ),
    );
    def.assign("integrated", integrate("reduced"));
    def.assign("setted", make_set("integrated"));
    def.assign("differentiated", differentiate("setted"));
    def.ret(&["differentiated"]);
    def
}

/// `reduce(a, zero, pick)` incrementalised: emits the retraction of the
/// previous total and the new one.
pub fn reduce(
    a: &str,
    out: DataType,
    zero: Value,
    pick: impl Fn(&Value) -> Result<Value> + 'static,
) -> Call {
    let pick: Rc<dyn Fn(&Value) -> Result<Value>> = Rc::new(pick);
    Call::sub("reduce", &[a], move |args| {
        Ok(aggregate_def(
            "reduce",
            args[0].clone(),
            out.clone(),
            zero.clone(),
            pick.clone(),
        ))
    })
}

/// `sum(a, pick)` over the picked numeric field.
pub fn sum(
    a: &str,
    out: DataType,
    pick: impl Fn(&Value) -> Result<Value> + 'static,
) -> Call {
    let pick: Rc<dyn Fn(&Value) -> Result<Value>> = Rc::new(pick);
    Call::sub("sum", &[a], move |args| {
        let zero = out.zero_value()?;
        Ok(aggregate_def(
            "sum",
            args[0].clone(),
            out.clone(),
            zero,
            pick.clone(),
        ))
    })
}

/// `count(a)`: the total multiplicity.
pub fn count(a: &str) -> Call {
    Call::sub("count", &[a], |args| {
        Ok(aggregate_def(
            "count",
            args[0].clone(),
            DataType::Int,
            Value::int(0),
            Rc::new(|_| Ok(Value::int(1))),
        ))
    })
}

/// `first_n(a, index, n)`: the first `n` elements by index order,
/// incrementalised through integrate/differentiate.
pub fn first_n(a: &str, index: Index, n: usize) -> Call {
    Call::sub("first_n", &[a], move |args| {
        let t = args[0].clone();
        let mut def = QueryDef::new("first_n", vec![("a", t)]);
        def.assign(
            "integrated",
            integrate_indexed("a", vec![index.clone()]),
        );
        def.assign(
            "taken",
            Call::op(
                Op::FirstN {
                    index: index.clone(),
                    n,
                },
                &["integrated"],
            ),
        );
        def.assign("differentiated", differentiate("taken"));
        def.ret(&["differentiated"]);
        Ok(def)
    })
}

// ---------------------------------------------------------------------------
// Transformers
// ---------------------------------------------------------------------------

/// Apply a sub-query per group key.
pub fn per_group(
    args: &[&str],
    builder: impl Fn(&[DataType]) -> Result<QueryDef> + 'static,
) -> Call {
    Call::PerGroup {
        name: "per_group".to_string(),
        args: args.iter().map(|a| (*a).to_string()).collect(),
        builder: Rc::new(builder),
    }
}

/// Drive a sub-query to a fixpoint within each step.
pub fn integrate_til_zero(
    a: &str,
    builder: impl Fn(&[DataType]) -> Result<QueryDef> + 'static,
) -> Call {
    Call::IntegrateTilZero {
        name: "integrate_til_zero".to_string(),
        args: vec![a.to_string()],
        builder: Rc::new(builder),
    }
}

/// Materialise a sub-query into the store without surfacing it as an
/// output; read it back through the cache handle after `inc`.
pub fn cache_into(
    handle: &Cache,
    a: &str,
    builder: impl Fn(&[DataType]) -> Result<QueryDef> + 'static,
) -> Call {
    Call::Cache {
        handle: handle.clone(),
        name: "cache".to_string(),
        args: vec![a.to_string()],
        builder: Rc::new(builder),
    }
}

/// `group(a, by)` then a per-group incremental reduce, then `flatten`.
pub fn group_reduce_flatten(
    a: &str,
    by: Index,
    out: DataType,
    zero: Value,
    pick: impl Fn(&Value) -> Result<Value> + 'static,
) -> Call {
    let pick: Rc<dyn Fn(&Value) -> Result<Value>> = Rc::new(pick);
    Call::sub("group_reduce_flatten", &[a], move |args| {
        let t = args[0].clone();
        let by = by.clone();
        let out = out.clone();
        let zero = zero.clone();
        let pick = pick.clone();
        let mut def = QueryDef::new("group_reduce_flatten", vec![("a", t)]);
        def.assign("grouped", group("a", by));
        def.assign(
            "reduced",
            per_group(&["grouped"], move |inner_args| {
                let mut inner = QueryDef::new("reduce_group", vec![("g", inner_args[0].clone())]);
                let pick = pick.clone();
                inner.assign(
                    "r",
                    reduce("g", out.clone(), zero.clone(), move |v| pick(v)),
                );
                inner.ret(&["r"]);
                Ok(inner)
            }),
        );
        def.assign("flattened", flatten("reduced"));
        def.ret(&["flattened"]);
        Ok(def)
    })
}

/// Transitive closure of an edge Z-set of `Pair<A, A>`, recursed to a
/// fixpoint within each step.
pub fn transitive_closure(a: &str) -> Call {
    integrate_til_zero(a, |args| {
        let t = args[0].clone();
        let pair_elem = match &t {
            DataType::ZSet(inner) => (**inner).clone(),
            other => {
                return Err(Error::runtime(format!(
                    "transitive_closure expects a Z-set of pairs, saw {other}"
                )))
            }
        };
        if !matches!(pair_elem, DataType::Pair(..)) {
            return Err(Error::runtime(format!(
                "transitive_closure expects pair elements, saw {pair_elem}"
            )));
        }
        let on_left = Index::field(pair_elem.clone(), "right")?;
        let on_right = Index::field(pair_elem.clone(), "left")?;

        let mut def = QueryDef::new("transitive_step", vec![("a", t.clone())]);
        def.declare("delayed", t);
        def.assign("joined", join("a", "delayed", on_left, on_right));
        def.assign(
            "picked",
            map("joined", pair_elem, |p| {
                Ok(Value::pair(
                    p.lookup_path("left.left")?,
                    p.lookup_path("right.right")?,
                ))
            }),
        );
        def.assign("unioned", add("a", "picked"));
        def.assign("distincted", distinct("unioned"));
        def.assign("delayed", delay("distincted"));
        def.ret(&["distincted"]);
        Ok(def)
    })
}
