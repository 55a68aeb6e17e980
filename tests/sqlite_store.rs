//! The same query scenarios with delay state in SQLite, plus storage
//! idempotence and frontier behaviour.

mod common;

use common::{expect_ints, int_entries, pair_entries, zset_int};
use tempfile::TempDir;
use zincr::execution::{delta, entries, iteration, Actions};
use zincr::zset::sql::SqliteConn;
use zincr::{compile, ops, DataType, Error, Index, KeyMatch, QueryDef, Store, StoreSqlite, Value};

fn sqlite_store(graph: &zincr::Graph) -> (StoreSqlite, TempDir) {
    let dir = TempDir::new().expect("tempdir");
    let conn = SqliteConn::open(dir.path().join("state.db")).expect("open");
    let store = StoreSqlite::from_graph(conn, graph, "t", true).expect("store");
    (store, dir)
}

fn int_step(
    store: &mut StoreSqlite,
    graph: &zincr::Graph,
    pairs: &[(i64, i64)],
) -> Vec<(i64, i64)> {
    let input = delta(
        DataType::Int,
        pairs.iter().map(|(v, c)| (Value::int(*v), *c)),
    )
    .expect("delta");
    let out = iteration(store, graph, vec![input]).expect("step");
    int_entries(&out[0])
}

#[test]
fn test_integrate_on_sqlite() {
    common::init_tracing();
    let mut def = QueryDef::new("running_total", vec![("a", zset_int())]);
    def.assign("integrated", ops::integrate("a"));
    def.ret(&["integrated"]);
    let graph = compile(&def).expect("compile");
    let (mut store, _dir) = sqlite_store(&graph);

    assert_eq!(int_step(&mut store, &graph, &[(8, 1)]), expect_ints(&[(8, 1)]));
    assert_eq!(
        int_step(&mut store, &graph, &[(6, 1)]),
        expect_ints(&[(6, 1), (8, 1)])
    );
    assert_eq!(
        int_step(&mut store, &graph, &[(4, 1)]),
        expect_ints(&[(4, 1), (6, 1), (8, 1)])
    );
    assert_eq!(
        int_step(&mut store, &graph, &[(5, 1)]),
        expect_ints(&[(4, 1), (5, 1), (6, 1), (8, 1)])
    );
    assert_eq!(
        int_step(&mut store, &graph, &[(4, 1)]),
        expect_ints(&[(4, 2), (5, 1), (6, 1), (8, 1)])
    );
}

#[test]
fn test_distinct_integrate_on_sqlite() {
    let mut def = QueryDef::new("distinct_total", vec![("a", zset_int())]);
    def.assign("distincted", ops::distinct("a"));
    def.assign("integrated", ops::integrate("distincted"));
    def.ret(&["integrated"]);
    let graph = compile(&def).expect("compile");
    let (mut store, _dir) = sqlite_store(&graph);

    assert_eq!(int_step(&mut store, &graph, &[(3, 1)]), expect_ints(&[(3, 1)]));
    assert_eq!(int_step(&mut store, &graph, &[(3, 1)]), expect_ints(&[(3, 1)]));
    assert_eq!(
        int_step(&mut store, &graph, &[(4, 1)]),
        expect_ints(&[(3, 1), (4, 1)])
    );
    assert_eq!(
        int_step(&mut store, &graph, &[(3, -1)]),
        expect_ints(&[(3, 1), (4, 1)])
    );
    assert_eq!(
        int_step(&mut store, &graph, &[(3, -1)]),
        expect_ints(&[(4, 1)])
    );
}

#[test]
fn test_join_on_sqlite() {
    let pair_ty = DataType::pair(DataType::Int, DataType::Int);
    let on_left = Index::field(pair_ty.clone(), "left").expect("index");
    let on_right = Index::field(pair_ty.clone(), "left").expect("index");

    let mut def = QueryDef::new(
        "matching",
        vec![
            ("l", DataType::zset(pair_ty.clone())),
            ("r", DataType::zset(pair_ty.clone())),
        ],
    );
    def.assign("joined", ops::join("l", "r", on_left, on_right));
    def.ret(&["joined"]);
    let graph = compile(&def).expect("compile");
    let (mut store, _dir) = sqlite_store(&graph);
    let mut actions = Actions::new(&mut store, &graph).expect("actions");

    let edge = |l: i64, r: i64| Value::pair(Value::int(l), Value::int(r));

    actions.insert(0, &[edge(1, 10)]).expect("step");
    let out = actions.insert(1, &[edge(2, 20)]).expect("step");
    assert!(entries(&out[0]).expect("entries").is_empty());

    let out = actions.insert(1, &[edge(1, 30)]).expect("step");
    assert_eq!(
        entries(&out[0]).expect("entries"),
        vec![(Value::pair(edge(1, 10), edge(1, 30)), 1)]
    );
}

#[test]
fn test_transitive_closure_on_sqlite() {
    let pair_ty = DataType::pair(DataType::Int, DataType::Int);
    let mut def = QueryDef::new("reachability", vec![("a", DataType::zset(pair_ty.clone()))]);
    def.assign("closured", ops::transitive_closure("a"));
    def.assign("integrated", ops::integrate("closured"));
    def.ret(&["integrated"]);
    let graph = compile(&def).expect("compile");
    let (mut store, _dir) = sqlite_store(&graph);

    let edges = delta(
        pair_ty,
        [(0i64, 1i64), (1, 2), (2, 3)]
            .iter()
            .map(|(l, r)| (Value::pair(Value::int(*l), Value::int(*r)), 1)),
    )
    .expect("delta");
    let out = iteration(&mut store, &graph, vec![edges]).expect("step");
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
fn test_state_survives_reopen() {
    let mut def = QueryDef::new("running_total", vec![("a", zset_int())]);
    def.assign("integrated", ops::integrate("a"));
    def.ret(&["integrated"]);
    let graph = compile(&def).expect("compile");

    let dir = TempDir::new().expect("tempdir");
    let db = dir.path().join("state.db");

    {
        let conn = SqliteConn::open(&db).expect("open");
        let mut store = StoreSqlite::from_graph(conn, &graph, "t", true).expect("store");
        int_step(&mut store, &graph, &[(8, 1)]);
        int_step(&mut store, &graph, &[(6, 1)]);
    }

    // a second process opens the same tables and continues the stream
    let conn = SqliteConn::open(&db).expect("reopen");
    let mut store = StoreSqlite::from_graph(conn, &graph, "t", false).expect("store");
    assert_eq!(
        int_step(&mut store, &graph, &[(4, 1)]),
        expect_ints(&[(4, 1), (6, 1), (8, 1)])
    );
}

#[test]
fn test_index_scan_deterministic_across_flushes() {
    // iter_by_index output is ordered by key whether or not the store has
    // flushed; insertion history does not matter.
    let index = Index::identity(DataType::Int);
    let mut def = QueryDef::new("indexed_total", vec![("a", zset_int())]);
    def.assign("integrated", ops::integrate_indexed("a", vec![index.clone()]));
    def.ret(&["integrated"]);
    let graph = compile(&def).expect("compile");
    let (mut store, _dir) = sqlite_store(&graph);

    let input = delta(
        DataType::Int,
        [(Value::int(4), 1), (Value::int(1), 1), (Value::int(9), 1)],
    )
    .expect("delta");
    let out = iteration(&mut store, &graph, vec![input]).expect("step");
    let scanned: Vec<i64> = out[0]
        .as_zset()
        .expect("zset")
        .iter_by_index(&index, &KeyMatch::All)
        .expect("scan")
        .into_iter()
        .map(|(_, v, _)| v.as_int().expect("int"))
        .collect();
    assert_eq!(scanned, vec![1, 4, 9]);

    // second step: buffered changes interleave into the on-disk order
    let input = delta(DataType::Int, [(Value::int(2), 1), (Value::int(7), 1)]).expect("delta");
    let out = iteration(&mut store, &graph, vec![input]).expect("step");
    let scanned: Vec<i64> = out[0]
        .as_zset()
        .expect("zset")
        .iter_by_index(&index, &KeyMatch::All)
        .expect("scan")
        .into_iter()
        .map(|(_, v, _)| v.as_int().expect("int"))
        .collect();
    assert_eq!(scanned, vec![1, 2, 4, 7, 9]);
}

#[test]
fn test_step_failure_leaves_current_state() {
    // feeding a malformed input aborts the step before inc; committed
    // state stays readable
    let mut def = QueryDef::new("running_total", vec![("a", zset_int())]);
    def.assign("integrated", ops::integrate("a"));
    def.ret(&["integrated"]);
    let graph = compile(&def).expect("compile");
    let (mut store, _dir) = sqlite_store(&graph);

    int_step(&mut store, &graph, &[(8, 1)]);
    assert!(iteration(&mut store, &graph, vec![]).is_err());
    assert_eq!(
        int_step(&mut store, &graph, &[(6, 1)]),
        expect_ints(&[(6, 1), (8, 1)])
    );
}

#[test]
fn test_failed_step_leaves_recursive_state() {
    // a transitive closure next to a sibling that fails after the fixpoint
    // converged: the aborted step must leave every on-disk delay cell
    // untouched, the recursive sub-graph's cells included
    let pair_ty = DataType::pair(DataType::Int, DataType::Int);
    let mut def = QueryDef::new(
        "guarded_reachability",
        vec![("a", DataType::zset(pair_ty.clone()))],
    );
    def.assign("closured", ops::transitive_closure("a"));
    def.assign(
        "checked",
        ops::map("closured", pair_ty.clone(), |p| {
            if p.lookup_path("right")? == Value::int(9) {
                Err(Error::runtime("node nine must stay unreachable"))
            } else {
                Ok(p.clone())
            }
        }),
    );
    def.assign("integrated", ops::integrate("closured"));
    def.ret(&["integrated"]);
    let graph = compile(&def).expect("compile");
    let (mut store, _dir) = sqlite_store(&graph);

    let edges = |pairs: &[(i64, i64)], count: i64| {
        delta(
            pair_ty.clone(),
            pairs
                .iter()
                .map(|(l, r)| (Value::pair(Value::int(*l), Value::int(*r)), count)),
        )
        .expect("delta")
    };

    iteration(
        &mut store,
        &graph,
        vec![edges(&[(0, 1), (1, 2), (2, 3)], 1)],
    )
    .expect("step");

    let snapshot = |store: &StoreSqlite| -> Vec<(zincr::Path, Vec<(Value, i64)>)> {
        graph
            .delay_vertices()
            .into_iter()
            .map(|(path, _, _)| {
                let cell = store.get(&path).expect("cell");
                let mut rows = cell.as_zset().expect("zset").entries().expect("entries");
                rows.sort();
                (path, rows)
            })
            .collect()
    };
    let before = snapshot(&store);

    let err = iteration(&mut store, &graph, vec![edges(&[(8, 9)], 1)])
        .expect_err("step should abort");
    assert!(err.to_string().contains("unreachable"));
    assert_eq!(
        snapshot(&store),
        before,
        "an aborted step must not change committed delay state"
    );

    // the engine continues cleanly from the pre-failure state
    let out = iteration(&mut store, &graph, vec![edges(&[(0, 8)], 1)]).expect("step");
    assert_eq!(
        pair_entries(&out[0]),
        vec![
            (0, 1, 1),
            (0, 2, 1),
            (0, 3, 1),
            (0, 8, 1),
            (1, 2, 1),
            (1, 3, 1),
            (2, 3, 1),
        ]
    );
}
