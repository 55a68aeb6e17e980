//! Compiler Front-End
//!
//! Turns a [`QueryDef`], a straight-line single-assignment statement
//! list, into a typed [`Graph`].
//!
//! A query definition mirrors a pure function over Z-sets:
//!
//! ```text
//! fn transitive(a: ZSet<Row>) -> ZSet<Row>:
//!     delayed: ZSet<Row>              # annotation-only declaration
//!     joined  = join(a, delayed, ..)  # operator / sub-query calls
//!     added   = add(joined, a)
//!     delayed = delay(added)          # resolves the forward reference
//!     return added
//! ```
//!
//! Compilation runs in phases:
//! 1. **Type resolution.** Two passes over the assignments bind each
//!    target's type, so a forward reference (the `delay` feedback idiom)
//!    resolves on the second pass. Operator signatures unify their type
//!    variables against actual argument types; an unresolvable variable is
//!    a compile error keyed by query and target.
//! 2. **Target compilation.** Every assignment compiles to a sub-graph:
//!    primitives become single vertices; sub-queries compile recursively
//!    under an extended path; transformer-lifted calls (`per_group`,
//!    `integrate_til_zero`, caches) compile the inner query and then
//!    rewrite it.
//! 3. **Stitching.** One identity vertex is created per input port (so an
//!    input can feed several consumers), edges are added per the statement
//!    arguments, and the assembled graph re-checks the IR invariants.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::rc::Rc;

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::ir::{Graph, OperatorKind, Path, PortRef, Vertex, VertexUnary};
use crate::operators::{substitute, unify, Op};
use crate::optimizer;
use crate::value::DataType;

/// Builds a concrete sub-query from the actual argument types.
pub type SubBuilder = Rc<dyn Fn(&[DataType]) -> Result<QueryDef>>;

/// One call on the right-hand side of an assignment.
#[derive(Clone)]
pub enum Call {
    /// A primitive operator application.
    Op { op: Op, args: Vec<String> },
    /// A sub-query call, compiled recursively.
    Sub {
        name: String,
        args: Vec<String>,
        builder: SubBuilder,
    },
    /// Transformer: lift the inner query over a grouped collection,
    /// applying it per key.
    PerGroup {
        name: String,
        args: Vec<String>,
        builder: SubBuilder,
    },
    /// Transformer: drive the inner query to a fixpoint within each step.
    IntegrateTilZero {
        name: String,
        args: Vec<String>,
        builder: SubBuilder,
    },
    /// Transformer: materialise the inner query into the store without
    /// surfacing it as an output.
    Cache {
        handle: Cache,
        name: String,
        args: Vec<String>,
        builder: SubBuilder,
    },
}

impl Call {
    pub fn op(op: Op, args: &[&str]) -> Call {
        Call::Op {
            op,
            args: args.iter().map(|a| (*a).to_string()).collect(),
        }
    }

    pub fn sub(
        name: &str,
        args: &[&str],
        builder: impl Fn(&[DataType]) -> Result<QueryDef> + 'static,
    ) -> Call {
        Call::Sub {
            name: name.to_string(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            builder: Rc::new(builder),
        }
    }

    fn args(&self) -> &[String] {
        match self {
            Call::Op { args, .. }
            | Call::Sub { args, .. }
            | Call::PerGroup { args, .. }
            | Call::IntegrateTilZero { args, .. }
            | Call::Cache { args, .. } => args,
        }
    }
}

/// One single-assignment statement.
#[derive(Clone)]
pub struct Stmt {
    pub targets: Vec<String>,
    pub call: Call,
}

/// A straight-line, single-assignment query definition.
#[derive(Clone)]
pub struct QueryDef {
    pub name: String,
    pub params: Vec<(String, DataType)>,
    pub declares: Vec<(String, DataType)>,
    pub stmts: Vec<Stmt>,
    pub ret: Vec<String>,
}

impl QueryDef {
    pub fn new(name: &str, params: Vec<(&str, DataType)>) -> QueryDef {
        QueryDef {
            name: name.to_string(),
            params: params
                .into_iter()
                .map(|(n, t)| (n.to_string(), t))
                .collect(),
            declares: Vec::new(),
            stmts: Vec::new(),
            ret: Vec::new(),
        }
    }

    /// Annotation-only declaration (`x: T`); allows one forward reference.
    pub fn declare(&mut self, name: &str, ty: DataType) -> &mut Self {
        self.declares.push((name.to_string(), ty));
        self
    }

    pub fn assign(&mut self, target: &str, call: Call) -> &mut Self {
        self.stmts.push(Stmt {
            targets: vec![target.to_string()],
            call,
        });
        self
    }

    pub fn assign_multi(&mut self, targets: &[&str], call: Call) -> &mut Self {
        self.stmts.push(Stmt {
            targets: targets.iter().map(|t| (*t).to_string()).collect(),
            call,
        });
        self
    }

    /// The single terminal return.
    pub fn ret(&mut self, targets: &[&str]) -> &mut Self {
        self.ret = targets.iter().map(|t| (*t).to_string()).collect();
        self
    }

    fn err(&self, target: &str, message: impl Into<String>) -> Error {
        Error::Compile {
            query: self.name.clone(),
            target: target.to_string(),
            message: message.into(),
        }
    }
}

/// Compile a query to its final graph: front-end compilation followed by
/// the scalar-delay reshape and identity elision to a stable form.
pub fn compile(def: &QueryDef) -> Result<Graph> {
    let graph = compile_query(def, &Path::root())?;
    let graph = optimizer::replace_non_zset_delays(graph)?;
    let graph = optimizer::til_stable_remove_identities(graph)?;
    graph.validate()?;
    Ok(graph)
}

// ---------------------------------------------------------------------------
// Type resolution
// ---------------------------------------------------------------------------

/// Resolve every target's type. Two passes over the assignments so forward
/// references (declared names assigned later) ground on the second pass.
fn resolve_scope(def: &QueryDef) -> Result<BTreeMap<String, DataType>> {
    let mut seen_targets = BTreeSet::new();
    for stmt in &def.stmts {
        for target in &stmt.targets {
            if !seen_targets.insert(target.clone()) {
                return Err(def.err(target, "assigned more than once (body must be SSA)"));
            }
        }
    }

    let mut scope: BTreeMap<String, DataType> = BTreeMap::new();
    for (name, ty) in def.params.iter().chain(def.declares.iter()) {
        scope.insert(name.clone(), ty.clone());
    }

    for pass in 0..2 {
        for stmt in &def.stmts {
            let target = &stmt.targets[0];
            let mut arg_types = Vec::new();
            let mut missing = None;
            for arg in stmt.call.args() {
                match scope.get(arg) {
                    Some(ty) => arg_types.push(ty.clone()),
                    None => {
                        missing = Some(arg.clone());
                        break;
                    }
                }
            }
            if let Some(arg) = missing {
                if pass == 0 {
                    continue;
                }
                return Err(def.err(target, format!("'{arg}' is not a valid target")));
            }

            let rets = call_ret_types(def, target, &stmt.call, &arg_types)?;
            if rets.len() != stmt.targets.len() {
                return Err(def.err(
                    target,
                    format!(
                        "call produces {} values but {} targets given",
                        rets.len(),
                        stmt.targets.len()
                    ),
                ));
            }
            for (t, ty) in stmt.targets.iter().zip(rets) {
                scope.insert(t.clone(), ty);
            }
        }
    }

    for target in &def.ret {
        if !scope.contains_key(target) {
            return Err(def.err(target, "returned name is not a valid target"));
        }
    }
    Ok(scope)
}

/// The output types a query definition produces.
fn query_output_types(def: &QueryDef) -> Result<Vec<DataType>> {
    let scope = resolve_scope(def)?;
    def.ret
        .iter()
        .map(|t| {
            scope
                .get(t)
                .cloned()
                .ok_or_else(|| def.err(t, "returned name is not a valid target"))
        })
        .collect()
}

fn call_ret_types(
    def: &QueryDef,
    target: &str,
    call: &Call,
    arg_types: &[DataType],
) -> Result<Vec<DataType>> {
    match call {
        Call::Op { op, .. } => {
            let (params, ret) = op.signature().map_err(|e| def.err(target, e.to_string()))?;
            if params.len() != arg_types.len() {
                return Err(def.err(
                    target,
                    format!(
                        "operator {} takes {} arguments, {} given",
                        op.kind(),
                        params.len(),
                        arg_types.len()
                    ),
                ));
            }
            let mut bindings = BTreeMap::new();
            for (expected, actual) in params.iter().zip(arg_types.iter()) {
                unify(expected, actual, &mut bindings).map_err(|e| def.err(target, e.to_string()))?;
            }
            let ret = substitute(&ret, &bindings);
            if ret.has_var() {
                return Err(Error::UnresolvedTypeVar {
                    query: def.name.clone(),
                    var: format!("{ret}"),
                });
            }
            Ok(vec![ret])
        }
        Call::Sub { builder, .. } | Call::Cache { builder, .. } => {
            let inner = builder(arg_types)?;
            query_output_types(&inner)
        }
        Call::PerGroup { builder, .. } => {
            let (unlifted, key) = unlift_arg_types(def, target, arg_types)?;
            let inner = builder(&unlifted)?;
            Ok(query_output_types(&inner)?
                .into_iter()
                .map(|out| DataType::grouped(out, key.clone()))
                .collect())
        }
        Call::IntegrateTilZero { builder, .. } => {
            let inner = builder(arg_types)?;
            query_output_types(&inner)
        }
    }
}

/// Strip one `Grouped<_, K>` layer off every argument, checking the key
/// types agree.
fn unlift_arg_types(
    def: &QueryDef,
    target: &str,
    arg_types: &[DataType],
) -> Result<(Vec<DataType>, DataType)> {
    let mut key: Option<DataType> = None;
    let mut unlifted = Vec::new();
    for ty in arg_types {
        match ty {
            DataType::Grouped(inner, k) => {
                match &key {
                    Some(existing) if existing != k.as_ref() => {
                        return Err(def.err(
                            target,
                            format!("grouped arguments disagree on key type: {existing} vs {k}"),
                        ));
                    }
                    _ => key = Some((**k).clone()),
                }
                unlifted.push((**inner).clone());
            }
            other => {
                return Err(def.err(
                    target,
                    format!("per_group arguments must be grouped, saw {other}"),
                ))
            }
        }
    }
    let key = key.ok_or_else(|| def.err(target, "per_group requires at least one argument"))?;
    Ok((unlifted, key))
}

// ---------------------------------------------------------------------------
// Graph assembly
// ---------------------------------------------------------------------------

/// Compile one query definition into a graph rooted at `base/<name>`.
pub fn compile_query(def: &QueryDef, base: &Path) -> Result<Graph> {
    let path = base.child(&def.name);
    let scope = resolve_scope(def)?;

    // Compile each assignment to a sub-graph keyed by statement index.
    let mut stmt_graphs: Vec<Graph> = Vec::new();
    for stmt in &def.stmts {
        let target = &stmt.targets[0];
        let arg_types: Vec<DataType> = stmt
            .call
            .args()
            .iter()
            .map(|arg| {
                scope
                    .get(arg)
                    .cloned()
                    .ok_or_else(|| def.err(target, format!("'{arg}' is not a valid target")))
            })
            .collect::<Result<_>>()?;
        let target_path = path.child(target);
        let graph = compile_call(def, target, &stmt.call, &arg_types, &target_path)?;
        if graph.input.len() != stmt.call.args().len() {
            return Err(def.err(
                target,
                format!(
                    "call expects {} inputs but {} arguments given",
                    graph.input.len(),
                    stmt.call.args().len()
                ),
            ));
        }
        stmt_graphs.push(graph);
    }

    // One identity vertex per input port, so an input can feed several
    // downstream ports cleanly.
    let mut vertices: Vec<Vertex> = Vec::new();
    let mut input: Vec<PortRef> = Vec::new();
    for (i, (_, ty)) in def.params.iter().enumerate() {
        let identity_path = path.child(&format!("input_{i}"));
        vertices.push(Vertex::Unary(VertexUnary {
            t: ty.clone(),
            v: ty.clone(),
            kind: OperatorKind::Identity,
            path: identity_path.clone(),
            f: Rc::new(|d| Ok(d.clone())),
        }));
        input.push((identity_path, 0));
    }

    // Where does a named value come from?
    let producer = |name: &str| -> Option<(usize, usize)> {
        def.stmts.iter().enumerate().find_map(|(i, stmt)| {
            stmt.targets
                .iter()
                .position(|t| t == name)
                .map(|pos| (i, pos))
        })
    };

    let mut internal: BTreeSet<(Path, PortRef)> = BTreeSet::new();
    let mut run_no_output: Vec<Path> = Vec::new();
    for (stmt_index, stmt) in def.stmts.iter().enumerate() {
        let target = &stmt.targets[0];
        for (j, arg) in stmt.call.args().iter().enumerate() {
            let dst_port = stmt_graphs[stmt_index].input[j].clone();
            if let Some(param_index) = def.params.iter().position(|(n, _)| n == arg) {
                internal.insert((input[param_index].0.clone(), dst_port));
            } else {
                let (src_stmt, position) = producer(arg)
                    .ok_or_else(|| def.err(target, format!("'{arg}' is not a valid target")))?;
                let src_path = stmt_graphs[src_stmt]
                    .output
                    .get(position)
                    .cloned()
                    .ok_or_else(|| {
                        def.err(target, format!("'{arg}' produces no connectable output"))
                    })?;
                internal.insert((src_path, dst_port));
            }
        }
    }

    let mut output: Vec<Path> = Vec::new();
    for name in &def.ret {
        let (src_stmt, position) = producer(name)
            .ok_or_else(|| def.err(name, "returned name is not a valid target"))?;
        let src_path = stmt_graphs[src_stmt]
            .output
            .get(position)
            .cloned()
            .ok_or_else(|| def.err(name, "returned name produces no connectable output"))?;
        output.push(src_path);
    }

    for graph in stmt_graphs {
        vertices.extend(graph.vertices.into_values());
        internal.extend(graph.internal);
        run_no_output.extend(graph.run_no_output);
    }

    Graph::new(vertices, input, internal, output, run_no_output)
}

fn compile_call(
    def: &QueryDef,
    target: &str,
    call: &Call,
    arg_types: &[DataType],
    path: &Path,
) -> Result<Graph> {
    match call {
        Call::Op { op, .. } => {
            let (params, _) = op.signature().map_err(|e| def.err(target, e.to_string()))?;
            let vertex = op
                .make_vertex(path.clone(), arg_types)
                .map_err(|e| def.err(target, e.to_string()))?;
            let input: Vec<PortRef> = (0..params.len() as u8)
                .map(|port| (path.clone(), port))
                .collect();
            Graph::new(
                vec![vertex],
                input,
                BTreeSet::new(),
                vec![path.clone()],
                vec![],
            )
        }
        Call::Sub { builder, .. } => {
            let inner = builder(arg_types)?;
            compile_query(&inner, path)
        }
        Call::PerGroup { builder, .. } => {
            let (unlifted, key) = unlift_arg_types(def, target, arg_types)?;
            let inner = builder(&unlifted)?;
            let graph = compile_query(&inner, path)?;
            optimizer::lift_grouped(&key, graph)
        }
        Call::IntegrateTilZero { builder, .. } => {
            let inner = builder(arg_types)?;
            let graph = compile_query(&inner, path)?;
            let graph = optimizer::replace_non_zset_delays(graph)?;
            let graph = optimizer::til_stable_remove_identities(graph)?;
            wrap_integrate_til_zero(def, target, path, graph)
        }
        Call::Cache {
            handle, builder, ..
        } => {
            let inner = builder(arg_types)?;
            let graph = compile_query(&inner, path)?;
            let delays = graph.delay_vertices();
            match delays.as_slice() {
                [(delay_path, _, _)] => handle.register(delay_path.clone()),
                other => {
                    return Err(def.err(
                        target,
                        format!(
                            "a cached sub-query must hold exactly one delay, found {}",
                            other.len()
                        ),
                    ))
                }
            }
            let run_no_output = graph
                .run_no_output
                .iter()
                .chain(graph.output.iter())
                .cloned()
                .collect();
            Ok(Graph {
                run_no_output,
                output: Vec::new(),
                ..graph
            })
        }
    }
}

/// Insert the recursion sentinels: an `identity_dont_remove` at the input
/// and an `integrate_til_zero` vertex carrying the inner graph.
fn wrap_integrate_til_zero(
    def: &QueryDef,
    target: &str,
    path: &Path,
    inner: Graph,
) -> Result<Graph> {
    if inner.input.len() != 1 || inner.output.len() != 1 {
        return Err(def.err(
            target,
            "integrate_til_zero requires a single-input, single-output sub-query",
        ));
    }
    let (input_path, input_port) = &inner.input[0];
    let t = inner
        .vertex(input_path)?
        .input_type(*input_port)
        .ok_or_else(|| def.err(target, "inner graph has a malformed input port"))?
        .clone();
    let v = inner.vertex(&inner.output[0])?.output_type().clone();

    let sentinel_path = path.child("input");
    let itz_path = path.child("integrate_til_zero");
    let sentinel = Vertex::Unary(VertexUnary {
        t: t.clone(),
        v: t.clone(),
        kind: OperatorKind::IdentityDontRemove,
        path: sentinel_path.clone(),
        f: Rc::new(|d| Ok(d.clone())),
    });
    let itz = Vertex::IntegrateTilZero {
        t,
        v,
        path: itz_path.clone(),
        graph: Rc::new(inner),
    };
    let mut internal = BTreeSet::new();
    internal.insert((sentinel_path.clone(), (itz_path.clone(), 0)));
    Graph::new(
        vec![sentinel, itz],
        vec![(sentinel_path, 0)],
        internal,
        vec![itz_path],
        vec![],
    )
}
