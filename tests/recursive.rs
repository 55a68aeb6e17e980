//! Transitive closure driven to a fixpoint within each step.

mod common;

use common::pair_entries;
use zincr::execution::{delta, iteration};
use zincr::{compile, ops, DataType, Datum, Error, QueryDef, Store, StoreMemory, Value};

// left = parent id, right = id
const EDGES: [(i64, i64); 5] = [(0, 1), (1, 2), (2, 3), (0, 4), (1, 5)];

fn pair_ty() -> DataType {
    DataType::pair(DataType::Int, DataType::Int)
}

fn edges_delta(edges: &[(i64, i64)], count: i64) -> Datum {
    delta(
        pair_ty(),
        edges
            .iter()
            .map(|(l, r)| (Value::pair(Value::int(*l), Value::int(*r)), count)),
    )
    .expect("delta")
}

fn closure_graph() -> zincr::Graph {
    let mut def = QueryDef::new("reachability", vec![("a", DataType::zset(pair_ty()))]);
    def.assign("closured", ops::transitive_closure("a"));
    def.assign("integrated", ops::integrate("closured"));
    def.ret(&["integrated"]);
    compile(&def).expect("compile")
}

#[test]
fn test_closure_single_pass() {
    common::init_tracing();
    let graph = closure_graph();
    let mut store = StoreMemory::from_graph(&graph).expect("store");

    let out = iteration(&mut store, &graph, vec![edges_delta(&EDGES[..3], 1)]).expect("step");
    assert_eq!(
        pair_entries(&out[0]),
        vec![
            (0, 1, 1),
            (0, 2, 1),
            (0, 3, 1),
            (1, 2, 1),
            (1, 3, 1),
            (2, 3, 1),
        ]
    );
}

#[test]
fn test_closure_incremental_updates() {
    let graph = closure_graph();
    let mut store = StoreMemory::from_graph(&graph).expect("store");

    // feed the edges in two batches, then an echo of the second batch
    iteration(&mut store, &graph, vec![edges_delta(&EDGES[..3], 1)]).expect("step");
    iteration(&mut store, &graph, vec![edges_delta(&EDGES[3..], 1)]).expect("step");
    let out = iteration(&mut store, &graph, vec![edges_delta(&EDGES[3..], 1)]).expect("step");
    assert_eq!(
        pair_entries(&out[0]),
        vec![
            (0, 1, 1),
            (0, 2, 1),
            (0, 3, 1),
            (0, 4, 1),
            (0, 5, 1),
            (1, 2, 1),
            (1, 3, 1),
            (1, 5, 1),
            (2, 3, 1),
        ]
    );

    // removing 1 -> 2 severs every path through it
    let out = iteration(&mut store, &graph, vec![edges_delta(&[(1, 2)], -1)]).expect("step");
    assert_eq!(
        pair_entries(&out[0]),
        vec![(0, 1, 1), (0, 4, 1), (0, 5, 1), (1, 5, 1), (2, 3, 1)]
    );
}

#[test]
fn test_closure_empty_step_is_stable() {
    let graph = closure_graph();
    let mut store = StoreMemory::from_graph(&graph).expect("store");

    iteration(&mut store, &graph, vec![edges_delta(&EDGES, 1)]).expect("step");
    let before = iteration(&mut store, &graph, vec![edges_delta(&[], 1)]).expect("step");
    let again = iteration(&mut store, &graph, vec![edges_delta(&[], 1)]).expect("step");
    assert_eq!(pair_entries(&before[0]), pair_entries(&again[0]));
}

/// A closure statement next to a sibling that fails after the fixpoint has
/// converged. The aborted step must leave every committed delay cell
/// untouched — the recursive sub-graph's cells included.
fn guarded_closure_graph() -> zincr::Graph {
    let mut def = QueryDef::new(
        "guarded_reachability",
        vec![("a", DataType::zset(pair_ty()))],
    );
    def.assign("closured", ops::transitive_closure("a"));
    def.assign(
        "checked",
        ops::map("closured", pair_ty(), |p| {
            if p.lookup_path("right")? == Value::int(9) {
                Err(Error::runtime("node nine must stay unreachable"))
            } else {
                Ok(p.clone())
            }
        }),
    );
    def.assign("integrated", ops::integrate("closured"));
    def.ret(&["integrated"]);
    compile(&def).expect("compile")
}

fn snapshot_cells<S: Store>(graph: &zincr::Graph, store: &S) -> Vec<(zincr::Path, Vec<(Value, i64)>)> {
    graph
        .delay_vertices()
        .into_iter()
        .map(|(path, _, _)| {
            let cell = store.get(&path).expect("cell");
            let mut entries = cell.as_zset().expect("zset").entries().expect("entries");
            entries.sort();
            (path, entries)
        })
        .collect()
}

#[test]
fn test_failed_step_leaves_recursive_state() {
    let graph = guarded_closure_graph();
    let mut store = StoreMemory::from_graph(&graph).expect("store");

    iteration(&mut store, &graph, vec![edges_delta(&EDGES, 1)]).expect("step");
    let before = snapshot_cells(&graph, &store);

    // (8, 9) derives a pair ending in 9 once the fixpoint converges, so
    // the downstream sibling fails and the whole step aborts
    let err = iteration(&mut store, &graph, vec![edges_delta(&[(8, 9)], 1)])
        .expect_err("step should abort");
    assert!(err.to_string().contains("unreachable"));

    assert_eq!(
        snapshot_cells(&graph, &store),
        before,
        "an aborted step must not change committed delay state"
    );

    // the next step continues from the pre-failure state: (0, 8) reaches
    // nothing new besides itself
    let out = iteration(&mut store, &graph, vec![edges_delta(&[(0, 8)], 1)]).expect("step");
    assert_eq!(
        pair_entries(&out[0]),
        vec![
            (0, 1, 1),
            (0, 2, 1),
            (0, 3, 1),
            (0, 4, 1),
            (0, 5, 1),
            (0, 8, 1),
            (1, 2, 1),
            (1, 3, 1),
            (1, 5, 1),
            (2, 3, 1),
        ]
    );
}
