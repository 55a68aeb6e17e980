//! Graph IR
//!
//! The compiled form of a query: a DAG of typed vertices keyed by [`Path`].
//! Unary and binary vertices carry a bound evaluation function; `delay`
//! vertices carry their declared index tuple and no function (the scheduler
//! services them from the store); `integrate_til_zero` vertices carry a
//! complete inner sub-graph that the scheduler drives to a fixpoint.
//!
//! Graph construction checks two invariants:
//! - every `(operator kind, path)` pair is unique;
//! - for every internal edge, the source's output type equals the
//!   destination's input type for that port.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fmt::Write as _;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::index::Index;
use crate::value::DataType;
use crate::zset::Datum;

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// A vertex's identity within the graph: an ordered list of name segments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    pub fn root() -> Path {
        Path::default()
    }

    pub fn of(segments: &[&str]) -> Path {
        Path {
            segments: segments.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    /// Extend with one segment.
    pub fn child(&self, segment: &str) -> Path {
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Path { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Identifier-safe form used for SQL table names.
    pub fn table_name(&self) -> String {
        self.segments.join("__")
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

// ---------------------------------------------------------------------------
// Operator kinds
// ---------------------------------------------------------------------------

/// The closed, named set of operator kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperatorKind {
    Add,
    Delay,
    Filter,
    FirstN,
    Haitch,
    Identity,
    IdentityDontRemove,
    Join,
    MakeScalar,
    MakeSet,
    Map,
    MapMany,
    Neg,
    Reduce,
    // group
    Flatten,
    GetKeys,
    Group,
    MakeGrouped,
    MakeIndexedPairs,
    PickRelevant,
    // recursive
    IntegrateTilZero,
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperatorKind::Add => "add",
            OperatorKind::Delay => "delay",
            OperatorKind::Filter => "filter",
            OperatorKind::FirstN => "first_n",
            OperatorKind::Haitch => "haitch",
            OperatorKind::Identity => "identity",
            OperatorKind::IdentityDontRemove => "identity_dont_remove",
            OperatorKind::Join => "join",
            OperatorKind::MakeScalar => "make_scalar",
            OperatorKind::MakeSet => "make_set",
            OperatorKind::Map => "map",
            OperatorKind::MapMany => "map_many",
            OperatorKind::Neg => "neg",
            OperatorKind::Reduce => "reduce",
            OperatorKind::Flatten => "flatten",
            OperatorKind::GetKeys => "get_keys",
            OperatorKind::Group => "group",
            OperatorKind::MakeGrouped => "make_grouped",
            OperatorKind::MakeIndexedPairs => "make_indexed_pairs",
            OperatorKind::PickRelevant => "pick_relevant",
            OperatorKind::IntegrateTilZero => "integrate_til_zero",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Vertices
// ---------------------------------------------------------------------------

pub type UnaryFn = Rc<dyn Fn(&Datum) -> Result<Datum>>;
pub type BinaryFn = Rc<dyn Fn(&Datum, &Datum) -> Result<Datum>>;

/// A unary vertex `T -> V` with a bound evaluation function.
#[derive(Clone)]
pub struct VertexUnary {
    pub t: DataType,
    pub v: DataType,
    pub kind: OperatorKind,
    pub path: Path,
    pub f: UnaryFn,
}

/// A binary vertex `(T, U) -> V`; port 0 is `t`, port 1 is `u`.
#[derive(Clone)]
pub struct VertexBinary {
    pub t: DataType,
    pub u: DataType,
    pub v: DataType,
    pub kind: OperatorKind,
    pub path: Path,
    pub f: BinaryFn,
}

/// A typed vertex.
#[derive(Clone)]
pub enum Vertex {
    Unary(VertexUnary),
    Binary(VertexBinary),
    /// `delay`: output at step `k` is the input at step `k-1`, serviced from
    /// the store. Carries the declared index tuple of its state Z-set.
    Delay {
        t: DataType,
        path: Path,
        indexes: Vec<Index>,
    },
    /// Recursive fixpoint: re-invokes `graph` with the running delta until
    /// the inner graph emits an empty Z-set.
    IntegrateTilZero {
        t: DataType,
        v: DataType,
        path: Path,
        graph: Rc<Graph>,
    },
}

impl Vertex {
    pub fn kind(&self) -> OperatorKind {
        match self {
            Vertex::Unary(v) => v.kind,
            Vertex::Binary(v) => v.kind,
            Vertex::Delay { .. } => OperatorKind::Delay,
            Vertex::IntegrateTilZero { .. } => OperatorKind::IntegrateTilZero,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Vertex::Unary(v) => &v.path,
            Vertex::Binary(v) => &v.path,
            Vertex::Delay { path, .. } | Vertex::IntegrateTilZero { path, .. } => path,
        }
    }

    /// The input type at `port`; `None` when the port does not exist.
    pub fn input_type(&self, port: u8) -> Option<&DataType> {
        match (self, port) {
            (Vertex::Unary(v), 0) => Some(&v.t),
            (Vertex::Binary(v), 0) => Some(&v.t),
            (Vertex::Binary(v), 1) => Some(&v.u),
            (Vertex::Delay { t, .. }, 0) => Some(t),
            (Vertex::IntegrateTilZero { t, .. }, 0) => Some(t),
            _ => None,
        }
    }

    pub fn output_type(&self) -> &DataType {
        match self {
            Vertex::Unary(v) => &v.v,
            Vertex::Binary(v) => &v.v,
            Vertex::Delay { t, .. } => t,
            Vertex::IntegrateTilZero { v, .. } => v,
        }
    }

    pub fn is_delay(&self) -> bool {
        matches!(self, Vertex::Delay { .. })
    }
}

impl fmt::Debug for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vertex::Unary(v) => {
                write!(f, "{} {}({}) -> {}", v.path, v.kind, v.t, v.v)
            }
            Vertex::Binary(v) => {
                write!(f, "{} {}({}, {}) -> {}", v.path, v.kind, v.t, v.u, v.v)
            }
            Vertex::Delay { t, path, .. } => write!(f, "{path} delay({t}) -> {t}"),
            Vertex::IntegrateTilZero { t, v, path, .. } => {
                write!(f, "{path} integrate_til_zero({t}) -> {v}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// An input or internal edge endpoint: a vertex path and a port (0 or 1).
pub type PortRef = (Path, u8);

/// The compiled dataflow graph.
#[derive(Debug, Clone)]
pub struct Graph {
    pub vertices: BTreeMap<Path, Vertex>,
    /// Ordered input ports; each is a fresh per-input identity vertex.
    pub input: Vec<PortRef>,
    /// Internal edges `src -> (dst, port)`.
    pub internal: BTreeSet<(Path, PortRef)>,
    /// Ordered output vertices.
    pub output: Vec<Path>,
    /// Vertices evaluated each step but not surfaced (caches).
    pub run_no_output: Vec<Path>,
}

impl Graph {
    /// Construct and validate.
    pub fn new(
        vertices: Vec<Vertex>,
        input: Vec<PortRef>,
        internal: BTreeSet<(Path, PortRef)>,
        output: Vec<Path>,
        run_no_output: Vec<Path>,
    ) -> Result<Graph> {
        let mut map = BTreeMap::new();
        for vertex in vertices {
            let identifier = (vertex.kind(), vertex.path().clone());
            if let Some(previous) = map.insert(vertex.path().clone(), vertex) {
                return Err(Error::DuplicateVertex {
                    kind: previous.kind().to_string(),
                    path: identifier.1,
                });
            }
        }
        let graph = Graph {
            vertices: map,
            input,
            internal,
            output,
            run_no_output,
        };
        graph.validate()?;
        Ok(graph)
    }

    /// Re-check the construction invariants (rewrites call this after
    /// surgery).
    pub fn validate(&self) -> Result<()> {
        for (path, port) in self.input.iter().chain(self.internal.iter().map(|(_, p)| p)) {
            let vertex = self.vertex(path)?;
            if vertex.input_type(*port).is_none() {
                return Err(Error::runtime(format!(
                    "vertex {path} has no port {port}"
                )));
            }
        }
        for (src, (dst, port)) in &self.internal {
            let src_type = self.vertex(src)?.output_type();
            let dst_vertex = self.vertex(dst)?;
            let dst_type = dst_vertex
                .input_type(*port)
                .ok_or_else(|| Error::runtime(format!("vertex {dst} has no port {port}")))?;
            if src_type != dst_type {
                return Err(Error::TypeMismatch {
                    src: src.clone(),
                    dst: dst.clone(),
                    port: *port,
                    src_type: src_type.to_string(),
                    dst_type: dst_type.to_string(),
                });
            }
        }
        for path in self.output.iter().chain(self.run_no_output.iter()) {
            self.vertex(path)?;
        }
        Ok(())
    }

    pub fn vertex(&self, path: &Path) -> Result<&Vertex> {
        self.vertices
            .get(path)
            .ok_or_else(|| Error::runtime(format!("no vertex at path {path}")))
    }

    /// Every delay vertex, recursing into `integrate_til_zero` inner
    /// graphs. The store allocates one persistent cell per entry.
    pub fn delay_vertices(&self) -> Vec<(Path, DataType, Vec<Index>)> {
        let mut out = Vec::new();
        self.collect_delays(&mut out);
        out
    }

    fn collect_delays(&self, out: &mut Vec<(Path, DataType, Vec<Index>)>) {
        for vertex in self.vertices.values() {
            match vertex {
                Vertex::Delay { t, path, indexes } => {
                    out.push((path.clone(), t.clone(), indexes.clone()));
                }
                Vertex::IntegrateTilZero { graph, .. } => graph.collect_delays(out),
                _ => {}
            }
        }
    }

    /// Predecessor edges into `path`, ordered by port.
    pub fn predecessors(&self, path: &Path) -> Vec<(Path, u8)> {
        let mut preds: Vec<(Path, u8)> = self
            .internal
            .iter()
            .filter(|(_, (dst, _))| dst == path)
            .map(|(src, (_, port))| (src.clone(), *port))
            .collect();
        preds.sort_by_key(|(_, port)| *port);
        preds
    }

    /// Human-readable listing for diagnostics.
    pub fn pformat(&self) -> String {
        let mut out = String::from("<Graph>\ninput:\n");
        for (path, port) in &self.input {
            let _ = writeln!(out, "  {path} [{port}]");
        }
        out.push_str("internal:\n");
        for (src, (dst, port)) in &self.internal {
            let _ = writeln!(out, "  {src}\n  => {dst} [{port}]");
        }
        out.push_str("output:\n");
        for path in &self.output {
            let _ = writeln!(out, "  {path}");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zset::memory::ZSetMemory;
    use crate::zset::ZSet;

    fn identity_vertex(path: Path, t: DataType) -> Vertex {
        Vertex::Unary(VertexUnary {
            t: t.clone(),
            v: t,
            kind: OperatorKind::Identity,
            path,
            f: Rc::new(|d| Ok(d.clone())),
        })
    }

    #[test]
    fn test_path_display_and_table_name() {
        let p = Path::of(&["q", "joined", "delay"]);
        assert_eq!(p.to_string(), "q/joined/delay");
        assert_eq!(p.table_name(), "q__joined__delay");
        assert_eq!(p.child("x").to_string(), "q/joined/delay/x");
    }

    #[test]
    fn test_duplicate_vertex_rejected() {
        let p = Path::of(&["a"]);
        let result = Graph::new(
            vec![
                identity_vertex(p.clone(), DataType::Int),
                identity_vertex(p, DataType::Int),
            ],
            vec![],
            BTreeSet::new(),
            vec![],
            vec![],
        );
        assert!(matches!(result, Err(Error::DuplicateVertex { .. })));
    }

    #[test]
    fn test_edge_type_mismatch_rejected() {
        let a = Path::of(&["a"]);
        let b = Path::of(&["b"]);
        let mut internal = BTreeSet::new();
        internal.insert((a.clone(), (b.clone(), 0)));
        let result = Graph::new(
            vec![
                identity_vertex(a, DataType::Int),
                identity_vertex(b, DataType::Str),
            ],
            vec![],
            internal,
            vec![],
            vec![],
        );
        assert!(matches!(result, Err(Error::TypeMismatch { .. })));
    }

    #[test]
    fn test_delay_vertices_recurse_into_fixpoints() {
        let inner_delay = Vertex::Delay {
            t: DataType::zset(DataType::Int),
            path: Path::of(&["inner", "delay"]),
            indexes: vec![],
        };
        let inner = Graph::new(
            vec![inner_delay],
            vec![],
            BTreeSet::new(),
            vec![],
            vec![],
        )
        .expect("inner graph");

        let itz = Vertex::IntegrateTilZero {
            t: DataType::zset(DataType::Int),
            v: DataType::zset(DataType::Int),
            path: Path::of(&["outer", "itz"]),
            graph: Rc::new(inner),
        };
        let outer = Graph::new(vec![itz], vec![], BTreeSet::new(), vec![], vec![])
            .expect("outer graph");
        let delays = outer.delay_vertices();
        assert_eq!(delays.len(), 1);
        assert_eq!(delays[0].0, Path::of(&["inner", "delay"]));
    }

    #[test]
    fn test_evaluate_identity_function() {
        let v = identity_vertex(Path::of(&["id"]), DataType::zset(DataType::Int));
        let z = ZSetMemory::singleton(DataType::Int, crate::value::Value::int(1), 1).expect("z");
        let datum = Datum::ZSet(ZSet::Mem(z));
        match &v {
            Vertex::Unary(u) => {
                let out = (u.f)(&datum).expect("eval");
                assert_eq!(out, datum);
            }
            _ => unreachable!(),
        }
    }
}
