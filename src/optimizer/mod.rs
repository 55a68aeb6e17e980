//! Rewrite Passes
//!
//! The fixed pipeline applied to compiled graphs:
//!
//! 1. **Scalar-delay reshape.** A `delay` whose element is not a Z-set (or
//!    grouped Z-set) becomes `make_set -> delay -> make_scalar`, so the
//!    store only ever persists Z-sets.
//! 2. **Group lifting.** A sub-graph `T -> V` lifts to
//!    `Grouped<T, K> -> Grouped<V, K>`: unary vertices apply per key (a
//!    missing key fails; there is no zero for an arbitrary element),
//!    binary `add` applies per key with the annihilation laws
//!    `0 + x = x`, `x + 0 = x`.
//! 3. **Grouped-delay expansion.** A delay of a grouped type expands into
//!    an indexed sub-graph that re-emits `(value, key)` pairs, selects only
//!    the keys touched this step from the durable buffer, and swaps the
//!    prior-step slice for the new one, keeping per-key delay state
//!    minimal.
//! 4. **Identity elision.** Iteratively removes identity vertices that are
//!    neither inputs, outputs, nor `identity_dont_remove`, re-linking
//!    their predecessor to their successors; runs to a stable form.
//!
//! Every pass rebuilds the graph through [`Graph::new`], re-running the IR
//! invariant checks.

use std::collections::BTreeSet;
use std::rc::Rc;

use tracing::trace;

use crate::error::{Error, Result};
use crate::index::Index;
use crate::ir::{
    BinaryFn, Graph, OperatorKind, Path, PortRef, UnaryFn, Vertex, VertexBinary, VertexUnary,
};
use crate::operators::{group as group_fns, linear};
use crate::value::DataType;
use crate::zset::{Datum, Grouped};

/// Iteration bound for the to-stability passes.
const TIL_STABLE_CAP: usize = 999;

// ---------------------------------------------------------------------------
// Vertex replacement
// ---------------------------------------------------------------------------

/// Replace one vertex with a single-input, single-output sub-graph,
/// re-linking its predecessors and successors.
pub fn replace_vertex(graph: Graph, remove: &Path, replacement: Graph) -> Result<Graph> {
    if graph.input.iter().any(|(p, _)| p == remove) || graph.output.contains(remove) {
        return Err(Error::runtime(format!(
            "cannot replace input/output vertex {remove}"
        )));
    }
    if replacement.input.len() != 1 || replacement.output.len() != 1 {
        return Err(Error::runtime(
            "replacement must have a single input and output",
        ));
    }
    let new_end = replacement.input[0].clone();
    let new_start = replacement.output[0].clone();

    let mut internal: BTreeSet<(Path, PortRef)> = BTreeSet::new();
    let mut from_vertices: BTreeSet<Path> = BTreeSet::new();
    let mut to_ports: BTreeSet<PortRef> = BTreeSet::new();
    for (src, (dst, port)) in &graph.internal {
        if dst == remove {
            from_vertices.insert(src.clone());
        } else if src == remove {
            to_ports.insert((dst.clone(), *port));
        } else {
            internal.insert((src.clone(), (dst.clone(), *port)));
        }
    }
    for src in from_vertices {
        internal.insert((src, new_end.clone()));
    }
    for port in to_ports {
        internal.insert((new_start.clone(), port));
    }
    internal.extend(replacement.internal);

    let vertices = graph
        .vertices
        .into_values()
        .filter(|v| v.path() != remove)
        .chain(replacement.vertices.into_values())
        .collect();
    let mut run_no_output = graph.run_no_output;
    run_no_output.extend(replacement.run_no_output);

    Graph::new(vertices, graph.input, internal, graph.output, run_no_output)
}

// ---------------------------------------------------------------------------
// Identity elision
// ---------------------------------------------------------------------------

/// Remove one removable identity vertex; `Ok(None)` when none remain.
fn remove_one_identity(graph: Graph) -> Result<Option<Graph>> {
    let input_paths: BTreeSet<&Path> = graph.input.iter().map(|(p, _)| p).collect();
    let candidate = graph
        .internal
        .iter()
        .map(|(_, (dst, _))| dst)
        .find(|path| {
            let Ok(vertex) = graph.vertex(path) else {
                return false;
            };
            vertex.kind() == OperatorKind::Identity
                && !input_paths.contains(path)
                && !graph.output.contains(path)
                && !graph.run_no_output.contains(path)
        })
        .cloned();
    let Some(remove) = candidate else {
        return Ok(None);
    };
    trace!(path = %remove, "eliding identity vertex");

    let mut internal: BTreeSet<(Path, PortRef)> = BTreeSet::new();
    let mut from_vertices: BTreeSet<Path> = BTreeSet::new();
    let mut to_ports: BTreeSet<PortRef> = BTreeSet::new();
    for (src, (dst, port)) in &graph.internal {
        if dst == &remove {
            from_vertices.insert(src.clone());
        } else if src == &remove {
            to_ports.insert((dst.clone(), *port));
        } else {
            internal.insert((src.clone(), (dst.clone(), *port)));
        }
    }
    for src in &from_vertices {
        for port in &to_ports {
            internal.insert((src.clone(), port.clone()));
        }
    }

    let vertices = graph
        .vertices
        .into_values()
        .filter(|v| v.path() != &remove)
        .collect();
    Some(Graph::new(
        vertices,
        graph.input,
        internal,
        graph.output,
        graph.run_no_output,
    ))
    .transpose()
}

/// Elide identities until the graph stops changing.
pub fn til_stable_remove_identities(mut graph: Graph) -> Result<Graph> {
    for _ in 0..TIL_STABLE_CAP {
        match remove_one_identity(graph.clone())? {
            Some(next) => graph = next,
            None => return Ok(graph),
        }
    }
    Ok(graph)
}

// ---------------------------------------------------------------------------
// Scalar-delay reshape
// ---------------------------------------------------------------------------

/// Rewrite every delay of a non-Z-set, non-grouped element into
/// `make_set -> delay -> make_scalar`.
pub fn replace_non_zset_delays(mut graph: Graph) -> Result<Graph> {
    loop {
        let target = graph.vertices.values().find_map(|v| match v {
            Vertex::Delay { t, path, .. }
                if !matches!(t, DataType::ZSet(_) | DataType::Grouped(..)) =>
            {
                Some((path.clone(), t.clone()))
            }
            _ => None,
        });
        let Some((path, t)) = target else {
            return Ok(graph);
        };
        trace!(path = %path, "reshaping scalar delay");

        let set_ty = DataType::zset(t.clone());
        let make_set_path = path.child("make_set");
        let delay_path = path.child("delay");
        let make_scalar_path = path.child("make_scalar");

        let make_set = Vertex::Unary(VertexUnary {
            t: t.clone(),
            v: set_ty.clone(),
            kind: OperatorKind::MakeSet,
            path: make_set_path.clone(),
            f: linear::make_set(t.clone()),
        });
        let delay = Vertex::Delay {
            t: set_ty.clone(),
            path: delay_path.clone(),
            indexes: Vec::new(),
        };
        let make_scalar = Vertex::Unary(VertexUnary {
            t: set_ty,
            v: t.clone(),
            kind: OperatorKind::MakeScalar,
            path: make_scalar_path.clone(),
            f: linear::make_scalar(t.zero_value()?),
        });

        let mut internal = BTreeSet::new();
        internal.insert((make_set_path.clone(), (delay_path.clone(), 0)));
        internal.insert((delay_path, (make_scalar_path.clone(), 0)));
        let replacement = Graph::new(
            vec![make_set, delay, make_scalar],
            vec![(make_set_path, 0)],
            internal,
            vec![make_scalar_path],
            vec![],
        )?;
        graph = replace_vertex(graph, &path, replacement)?;
    }
}

// ---------------------------------------------------------------------------
// Group lifting
// ---------------------------------------------------------------------------

fn lift_unary(f: UnaryFn) -> UnaryFn {
    Rc::new(move |datum| {
        let grouped = datum.as_grouped()?;
        let mut out = Grouped::new();
        for (key, member) in grouped.iter() {
            out.set(key.clone(), f(member)?);
        }
        Ok(Datum::Grouped(out))
    })
}

fn lift_add(f: BinaryFn) -> BinaryFn {
    Rc::new(move |a, b| {
        let ga = a.as_grouped()?;
        let gb = b.as_grouped()?;
        let mut out = Grouped::new();
        let mut keys = ga.keys();
        keys.extend(gb.keys());
        for key in keys {
            match (ga.get(&key), gb.get(&key)) {
                // 0 + x = x and x + 0 = x
                (Some(x), None) => out.set(key, x.clone()),
                (None, Some(y)) => out.set(key, y.clone()),
                (Some(x), Some(y)) => out.set(key, f(x, y)?),
                (None, None) => {
                    return Err(Error::runtime(format!("{key} not in either group")))
                }
            }
        }
        Ok(Datum::Grouped(out))
    })
}

/// Lift a sub-graph `T -> V` to `Grouped<T, K> -> Grouped<V, K>`.
pub fn lift_grouped(key: &DataType, graph: Graph) -> Result<Graph> {
    let graph = replace_non_zset_delays(graph)?;

    let lift = |t: &DataType| DataType::grouped(t.clone(), key.clone());
    let mut vertices = Vec::new();
    for vertex in graph.vertices.values() {
        let lifted = match vertex {
            Vertex::Unary(v) => Vertex::Unary(VertexUnary {
                t: lift(&v.t),
                v: lift(&v.v),
                kind: v.kind,
                path: v.path.clone(),
                f: lift_unary(v.f.clone()),
            }),
            Vertex::Binary(v) => {
                if v.kind != OperatorKind::Add {
                    return Err(Error::runtime(format!(
                        "can only lift add binary vertices to grouped, saw {} at {}",
                        v.kind, v.path
                    )));
                }
                Vertex::Binary(VertexBinary {
                    t: lift(&v.t),
                    u: lift(&v.u),
                    v: lift(&v.v),
                    kind: v.kind,
                    path: v.path.clone(),
                    f: lift_add(v.f.clone()),
                })
            }
            Vertex::Delay { t, path, indexes } => Vertex::Delay {
                t: lift(t),
                path: path.clone(),
                indexes: indexes.clone(),
            },
            Vertex::IntegrateTilZero { path, .. } => {
                return Err(Error::runtime(format!(
                    "cannot lift a recursive sub-graph at {path} into a group"
                )))
            }
        };
        vertices.push(lifted);
    }

    let graph = Graph::new(
        vertices,
        graph.input,
        graph.internal,
        graph.output,
        graph.run_no_output,
    )?;
    replace_grouped_delays(key, graph)
}

// ---------------------------------------------------------------------------
// Grouped-delay expansion
// ---------------------------------------------------------------------------

/// The pair index `Pair<T, K> -> K` used by the expanded delay buffer.
fn pair_right_index(pair_ty: &DataType, key: &DataType) -> Result<Index> {
    match key {
        DataType::Tuple(items) => {
            let paths: Vec<String> = (0..items.len()).map(|i| format!("right.{i}")).collect();
            let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
            Index::composite(pair_ty.clone(), &refs)
        }
        _ => Index::field(pair_ty.clone(), "right"),
    }
}

/// Expand every delay of a grouped Z-set into the indexed-pairs sub-graph:
///
/// ```text
///            grouped input                     (touched keys)
///                 |                         first input ----> get_keys
///         make_indexed_pairs                                      |
///                 |                                               v
///   +--> add ---> delay ------------------------------> pick_relevant
///   |      ^        |                                        |    |
///   |      |        +--------------------+                  neg   |
///   |      +--(prior slice, negated)------+                  |    |
///   +---------------(new slice)                              |    v
///                                                      make_grouped --> out
/// ```
fn replace_grouped_delays(key: &DataType, mut graph: Graph) -> Result<Graph> {
    let first_input = graph
        .input
        .first()
        .map(|(p, _)| p.clone())
        .ok_or_else(|| Error::runtime("lifted graph has no input to key deltas from"))?;

    loop {
        let target = graph.vertices.values().find_map(|v| match v {
            Vertex::Delay { t: DataType::Grouped(inner, _), path, .. } => match inner.as_ref() {
                DataType::ZSet(element) => Some((path.clone(), (**element).clone())),
                _ => None,
            },
            _ => None,
        });
        let Some((path, element)) = target else {
            return Ok(graph);
        };
        trace!(path = %path, "expanding grouped delay");

        let pair_ty = DataType::pair(element.clone(), key.clone());
        let index = pair_right_index(&pair_ty, key)?;
        let grouped_ty = DataType::grouped(DataType::zset(element.clone()), key.clone());
        let zset_pair_ty = DataType::zset(pair_ty.clone());
        let keys_ty = DataType::Keys(Box::new(key.clone()));
        let first_input_ty = graph.vertex(&first_input)?.output_type().clone();

        let pairs_path = path.child("make_indexed_pairs");
        let delay_path = path.child("delay");
        let keys_path = path.child("get_keys");
        let relevant_path = path.child("pick_relevant");
        let neg_path = path.child("neg");
        let grouped_path = path.child("make_grouped");
        let add_prior_path = path.child("add_prior");
        let add_new_path = path.child("add_new");

        let new_vertices = vec![
            Vertex::Unary(VertexUnary {
                t: grouped_ty.clone(),
                v: zset_pair_ty.clone(),
                kind: OperatorKind::MakeIndexedPairs,
                path: pairs_path.clone(),
                f: group_fns::make_indexed_pairs(index.clone(), pair_ty.clone()),
            }),
            Vertex::Delay {
                t: zset_pair_ty.clone(),
                path: delay_path.clone(),
                indexes: vec![index.clone()],
            },
            Vertex::Unary(VertexUnary {
                t: first_input_ty,
                v: keys_ty.clone(),
                kind: OperatorKind::GetKeys,
                path: keys_path.clone(),
                f: group_fns::get_keys(),
            }),
            Vertex::Binary(VertexBinary {
                t: keys_ty,
                u: zset_pair_ty.clone(),
                v: zset_pair_ty.clone(),
                kind: OperatorKind::PickRelevant,
                path: relevant_path.clone(),
                f: group_fns::pick_relevant(index.clone(), pair_ty.clone()),
            }),
            Vertex::Unary(VertexUnary {
                t: zset_pair_ty.clone(),
                v: zset_pair_ty.clone(),
                kind: OperatorKind::Neg,
                path: neg_path.clone(),
                f: linear::neg(),
            }),
            Vertex::Unary(VertexUnary {
                t: zset_pair_ty.clone(),
                v: grouped_ty,
                kind: OperatorKind::MakeGrouped,
                path: grouped_path.clone(),
                f: group_fns::make_grouped(index, element),
            }),
            Vertex::Binary(VertexBinary {
                t: zset_pair_ty.clone(),
                u: zset_pair_ty.clone(),
                v: zset_pair_ty.clone(),
                kind: OperatorKind::Add,
                path: add_prior_path.clone(),
                f: linear::add(),
            }),
            Vertex::Binary(VertexBinary {
                t: zset_pair_ty.clone(),
                u: zset_pair_ty.clone(),
                v: zset_pair_ty.clone(),
                kind: OperatorKind::Add,
                path: add_new_path.clone(),
                f: linear::add(),
            }),
        ];

        // Re-route the old delay's edges: predecessors feed the pair
        // builder, successors read the per-key grouped slice.
        let mut internal: BTreeSet<(Path, PortRef)> = BTreeSet::new();
        for (src, (dst, port)) in &graph.internal {
            if dst == &path {
                internal.insert((src.clone(), (pairs_path.clone(), 0)));
            } else if src == &path {
                internal.insert((grouped_path.clone(), (dst.clone(), *port)));
            } else {
                internal.insert((src.clone(), (dst.clone(), *port)));
            }
        }
        internal.insert((first_input.clone(), (keys_path.clone(), 0)));
        internal.insert((keys_path, (relevant_path.clone(), 0)));
        internal.insert((delay_path.clone(), (relevant_path.clone(), 1)));
        internal.insert((relevant_path.clone(), (neg_path.clone(), 0)));
        internal.insert((relevant_path, (grouped_path, 0)));
        internal.insert((delay_path.clone(), (add_prior_path.clone(), 0)));
        internal.insert((neg_path, (add_prior_path.clone(), 1)));
        internal.insert((add_prior_path, (add_new_path.clone(), 0)));
        internal.insert((pairs_path, (add_new_path.clone(), 1)));
        internal.insert((add_new_path, (delay_path, 0)));

        let vertices = graph
            .vertices
            .into_values()
            .filter(|v| v.path() != &path)
            .chain(new_vertices)
            .collect();
        graph = Graph::new(
            vertices,
            graph.input,
            internal,
            graph.output,
            graph.run_no_output,
        )?;
    }
}
