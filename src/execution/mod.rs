//! Step Scheduler
//!
//! One step takes a tuple of input Z-sets (one per declared input, in
//! order) and produces a tuple of output Z-sets:
//!
//! 1. Compute a topological order, treating `delay` vertices as sources
//!    (their incoming edge is a back-edge).
//! 2. Evaluate vertices in order, handing each port its single incoming
//!    value; binary vertices receive their ports in declared order. A
//!    `delay` reads the store's `current` cell; `integrate_til_zero`
//!    re-invokes its inner graph with the running delta until the inner
//!    graph emits an empty Z-set, bounded by a hard iteration cap. The
//!    rounds run against an overlay of the store, so the inner sub-graph's
//!    delay cells advance per round without touching committed state.
//! 3. After evaluation, each delay's incoming value is staged with
//!    `Store::set` — the overlay cells of every fixpoint along with the
//!    ordinary delays.
//! 4. `Store::inc` promotes every pending cell. A failure anywhere aborts
//!    the step and leaves `current` unchanged, fixpoint rounds included.
//!
//! Evaluation within a step is single-threaded, deterministic and
//! sequential; the only suspension points are store I/O.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::ir::{Graph, Path, Vertex};
use crate::store::Store;
use crate::value::{DataType, Value};
use crate::zset::memory::ZSetMemory;
use crate::zset::{Datum, ZSet};

/// Hard cap on `integrate_til_zero` iterations within one step.
pub const FIXPOINT_CAP: usize = 1000;

/// Run one step: feed `inputs` to the graph's input ports, evaluate, stage
/// delay state, commit, and return the outputs in declared order.
///
/// Outputs are materialised to in-memory Z-sets *before* the commit: a
/// SQL-backed handle's buffered changes land on disk during `inc`, so the
/// handle itself would double-count if read afterwards.
pub fn iteration<S: Store>(store: &mut S, graph: &Graph, inputs: Vec<Datum>) -> Result<Vec<Datum>> {
    iteration_with_cap(store, graph, inputs, FIXPOINT_CAP)
}

/// [`iteration`] with an explicit fixpoint iteration cap (see
/// `ExecutionConfig::fixpoint_cap`).
pub fn iteration_with_cap<S: Store>(
    store: &mut S,
    graph: &Graph,
    inputs: Vec<Datum>,
    cap: usize,
) -> Result<Vec<Datum>> {
    let outputs = evaluate(store, graph, inputs, cap)?
        .into_iter()
        .map(|datum| match datum {
            Datum::ZSet(z) => {
                let indexes = z.indexes().to_vec();
                Ok(Datum::mem(z.to_memory()?.with_indexes(indexes)?))
            }
            other => Ok(other),
        })
        .collect::<Result<Vec<_>>>()?;
    store.inc()?;
    Ok(outputs)
}

fn evaluate(
    store: &mut dyn Store,
    graph: &Graph,
    inputs: Vec<Datum>,
    cap: usize,
) -> Result<Vec<Datum>> {
    if inputs.len() != graph.input.len() {
        return Err(Error::runtime(format!(
            "graph takes {} inputs, {} given",
            graph.input.len(),
            inputs.len()
        )));
    }

    let order = schedule(graph)?;
    trace!(vertices = order.len(), "evaluating step");

    let mut port_values: HashMap<(Path, u8), Datum> = HashMap::new();
    for ((path, port), value) in graph.input.iter().zip(inputs) {
        port_values.insert((path.clone(), *port), value);
    }

    let mut outputs_by_path: HashMap<Path, Datum> = HashMap::new();
    let mut fixpoint_cells: Vec<(Path, Datum)> = Vec::new();
    for path in &order {
        let vertex = graph.vertex(path)?;
        let value = match vertex {
            Vertex::Unary(v) => {
                let arg = take_port(&port_values, path, 0)?;
                (v.f)(arg)?
            }
            Vertex::Binary(v) => {
                let a = take_port(&port_values, path, 0)?.clone();
                let b = take_port(&port_values, path, 1)?;
                (v.f)(&a, b)?
            }
            // the value written at step k-1, committed via inc
            Vertex::Delay { .. } => store.get(path)?,
            Vertex::IntegrateTilZero { t, v, path, graph } => {
                let arg = take_port(&port_values, path, 0)?.clone();
                let (value, cells) = fixpoint(&*store, graph, t, v, path, arg, cap)?;
                fixpoint_cells.extend(cells);
                value
            }
        };

        for (src, (dst, port)) in &graph.internal {
            if src == path {
                port_values.insert((dst.clone(), *port), value.clone());
            }
        }
        outputs_by_path.insert(path.clone(), value);
    }

    // Stage every delay's incoming value for the commit: the ordinary
    // delays, then the cells each fixpoint accumulated in its overlay.
    for path in &order {
        if graph.vertex(path)?.is_delay() {
            let staged = take_port(&port_values, path, 0)?.clone();
            store.set(path, staged)?;
        }
    }
    for (path, value) in fixpoint_cells {
        store.set(&path, value)?;
    }

    graph
        .output
        .iter()
        .map(|path| {
            outputs_by_path
                .get(path)
                .cloned()
                .ok_or_else(|| Error::runtime(format!("output vertex {path} was not evaluated")))
        })
        .collect()
}

fn take_port<'a>(
    port_values: &'a HashMap<(Path, u8), Datum>,
    path: &Path,
    port: u8,
) -> Result<&'a Datum> {
    port_values
        .get(&(path.clone(), port))
        .ok_or_else(|| Error::runtime(format!("no value arrived at {path} port {port}")))
}

/// Topological order over the internal edges, with edges *into* delay
/// vertices ignored (the delay's input is last step's value, so it acts as
/// a source).
fn schedule(graph: &Graph) -> Result<Vec<Path>> {
    let mut in_degree: HashMap<&Path, usize> = graph.vertices.keys().map(|p| (p, 0)).collect();
    let mut forward: HashMap<&Path, Vec<&Path>> = HashMap::new();
    for (src, (dst, _)) in &graph.internal {
        if graph.vertex(dst)?.is_delay() {
            continue;
        }
        *in_degree.entry(dst).or_insert(0) += 1;
        forward.entry(src).or_default().push(dst);
    }

    // BTreeSet keeps the ready set (and so evaluation) deterministic.
    let mut ready: BTreeSet<&Path> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(p, _)| *p)
        .collect();
    let mut order: Vec<Path> = Vec::with_capacity(graph.vertices.len());

    while let Some(path) = ready.iter().next().copied() {
        ready.remove(path);
        order.push(path.clone());
        for next in forward.get(path).into_iter().flatten() {
            let d = in_degree
                .get_mut(*next)
                .ok_or_else(|| Error::runtime(format!("edge to unknown vertex {next}")))?;
            *d -= 1;
            if *d == 0 {
                ready.insert(*next);
            }
        }
    }

    if order.len() != graph.vertices.len() {
        return Err(Error::runtime(
            "graph contains a cycle not broken by a delay",
        ));
    }
    Ok(order)
}

/// Overlay store for fixpoint rounds. Reads fall through to the committed
/// base; writes stay local, promoted round-by-round so the inner graph's
/// delays tick. Nothing reaches the base store here — the converged cells
/// are handed back to the outer step, staged with its ordinary delays, and
/// commit (or abort) atomically with it.
struct FixpointStore<'a> {
    base: &'a dyn Store,
    overlay: BTreeMap<Path, Datum>,
    pending: Vec<(Path, Datum)>,
}

impl<'a> FixpointStore<'a> {
    fn new(base: &'a dyn Store) -> FixpointStore<'a> {
        FixpointStore {
            base,
            overlay: BTreeMap::new(),
            pending: Vec::new(),
        }
    }
}

impl Store for FixpointStore<'_> {
    fn get(&self, path: &Path) -> Result<Datum> {
        match self.overlay.get(path) {
            Some(value) => Ok(value.clone()),
            None => self.base.get(path),
        }
    }

    fn set(&mut self, path: &Path, value: Datum) -> Result<()> {
        if !self.overlay.contains_key(path) {
            // surface unknown cells with the base store's error
            self.base.get(path)?;
        }
        self.pending.push((path.clone(), value));
        Ok(())
    }

    fn inc(&mut self) -> Result<()> {
        for (path, value) in self.pending.drain(..) {
            self.overlay.insert(path, value);
        }
        Ok(())
    }
}

/// Drive an inner graph to a fixpoint: re-invoke it with the running delta
/// until it emits an empty Z-set, accumulating the outputs. Returns the
/// accumulated value and the inner delay cells to stage with the outer
/// step.
#[allow(clippy::too_many_arguments)]
fn fixpoint(
    base: &dyn Store,
    inner: &Graph,
    t: &DataType,
    v: &DataType,
    path: &Path,
    first: Datum,
    cap: usize,
) -> Result<(Datum, Vec<(Path, Datum)>)> {
    let out_element = match v {
        DataType::ZSet(element) => (**element).clone(),
        other => {
            return Err(Error::runtime(format!(
                "integrate_til_zero output must be a Z-set, saw {other}"
            )))
        }
    };
    let in_element = match t {
        DataType::ZSet(element) => (**element).clone(),
        other => {
            return Err(Error::runtime(format!(
                "integrate_til_zero input must be a Z-set, saw {other}"
            )))
        }
    };

    let mut staging = FixpointStore::new(base);
    let mut acc = ZSetMemory::new(out_element, Vec::new());
    let mut next = first;
    for round in 0..cap {
        let outputs = evaluate(&mut staging, inner, vec![next], cap)?;
        staging.inc()?;
        let round_delta = outputs
            .first()
            .ok_or_else(|| Error::runtime("recursive sub-graph produced no output"))?
            .as_zset()?
            .to_memory()?;
        if round_delta.is_empty() {
            debug!(%path, rounds = round + 1, "fixpoint converged");
            return Ok((Datum::mem(acc), staging.overlay.into_iter().collect()));
        }
        acc = acc.add_zset(&round_delta)?;
        next = Datum::mem(ZSetMemory::new(in_element.clone(), Vec::new()));
    }
    Err(Error::FixpointOverflow {
        path: path.clone(),
        cap,
    })
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Per-input insert/remove helpers over a compiled graph and its store.
pub struct Actions<'a, S: Store> {
    store: &'a mut S,
    graph: &'a Graph,
    input_elements: Vec<DataType>,
}

impl<'a, S: Store> Actions<'a, S> {
    pub fn new(store: &'a mut S, graph: &'a Graph) -> Result<Actions<'a, S>> {
        let input_elements = graph
            .input
            .iter()
            .map(|(path, port)| {
                let ty = graph
                    .vertex(path)?
                    .input_type(*port)
                    .ok_or_else(|| Error::runtime(format!("input {path} has no port {port}")))?;
                match ty {
                    DataType::ZSet(element) => Ok((**element).clone()),
                    other => Err(Error::runtime(format!(
                        "action inputs must be Z-sets, input {path} is {other}"
                    ))),
                }
            })
            .collect::<Result<_>>()?;
        Ok(Actions {
            store,
            graph,
            input_elements,
        })
    }

    /// Feed one step with `{v: 1}` for each value at `input`, empty deltas
    /// elsewhere.
    pub fn insert(&mut self, input: usize, values: &[Value]) -> Result<Vec<Datum>> {
        self.step_with(input, values, 1)
    }

    /// Feed one step with `{v: -1}` for each value at `input`.
    pub fn remove(&mut self, input: usize, values: &[Value]) -> Result<Vec<Datum>> {
        self.step_with(input, values, -1)
    }

    /// Feed a full tuple of input deltas.
    pub fn step(&mut self, inputs: Vec<Datum>) -> Result<Vec<Datum>> {
        iteration(self.store, self.graph, inputs)
    }

    fn step_with(&mut self, input: usize, values: &[Value], count: i64) -> Result<Vec<Datum>> {
        if input >= self.input_elements.len() {
            return Err(Error::runtime(format!(
                "graph has {} inputs, index {input} given",
                self.input_elements.len()
            )));
        }
        let inputs = self
            .input_elements
            .iter()
            .enumerate()
            .map(|(i, element)| {
                let mut z = ZSetMemory::new(element.clone(), Vec::new());
                if i == input {
                    for value in values {
                        z.update(value.clone(), count)?;
                    }
                }
                Ok(Datum::mem(z))
            })
            .collect::<Result<Vec<_>>>()?;
        self.step(inputs)
    }
}

/// An empty in-memory delta of the given element type.
pub fn empty_delta(element: DataType) -> Datum {
    Datum::mem(ZSetMemory::new(element, Vec::new()))
}

/// A delta from `(value, count)` pairs.
pub fn delta(element: DataType, pairs: impl IntoIterator<Item = (Value, i64)>) -> Result<Datum> {
    Ok(Datum::mem(ZSetMemory::from_pairs(
        element,
        Vec::new(),
        pairs,
    )?))
}

/// Read a step output as a sorted `(value, count)` list.
pub fn entries(datum: &Datum) -> Result<Vec<(Value, i64)>> {
    match datum {
        Datum::ZSet(ZSet::Mem(z)) => Ok(z.iter().map(|(v, c)| (v.clone(), c)).collect()),
        Datum::ZSet(z) => {
            let mut out = z.entries()?;
            out.sort();
            Ok(out)
        }
        other => Err(Error::runtime(format!(
            "expected a Z-set output, saw {other}"
        ))),
    }
}
