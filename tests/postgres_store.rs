//! PostgreSQL store parity. Ignored unless `ZINCR_TEST_PG_URL` points at a
//! scratch database:
//!
//! ```bash
//! ZINCR_TEST_PG_URL=postgresql://postgres@127.0.0.1:5432/zincr_test \
//!     cargo test --test postgres_store -- --ignored
//! ```

mod common;

use common::{expect_ints, int_entries, zset_int};
use zincr::execution::{delta, iteration};
use zincr::zset::sql::PgConn;
use zincr::{compile, ops, DataType, QueryDef, StorePostgres, Value};

fn pg_conn() -> Option<PgConn> {
    let url = std::env::var("ZINCR_TEST_PG_URL").ok()?;
    let conn = PgConn::connect(&url).expect("connect");
    Some(conn)
}

fn unique_prefix(name: &str) -> String {
    // one schema-free namespace per test run
    format!("{name}_{}", std::process::id())
}

fn int_step(
    store: &mut StorePostgres,
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
#[ignore = "requires ZINCR_TEST_PG_URL"]
fn test_integrate_on_postgres() {
    let Some(conn) = pg_conn() else { return };
    conn.disable_seqscan().expect("seqscan off");

    let mut def = QueryDef::new("running_total", vec![("a", zset_int())]);
    def.assign("integrated", ops::integrate("a"));
    def.ret(&["integrated"]);
    let graph = compile(&def).expect("compile");
    let mut store =
        StorePostgres::from_graph(conn, &graph, &unique_prefix("it"), true).expect("store");

    assert_eq!(int_step(&mut store, &graph, &[(8, 1)]), expect_ints(&[(8, 1)]));
    assert_eq!(
        int_step(&mut store, &graph, &[(6, 1)]),
        expect_ints(&[(6, 1), (8, 1)])
    );
    assert_eq!(
        int_step(&mut store, &graph, &[(4, 1)]),
        expect_ints(&[(4, 1), (6, 1), (8, 1)])
    );
}

#[test]
#[ignore = "requires ZINCR_TEST_PG_URL"]
fn test_distinct_on_postgres() {
    let Some(conn) = pg_conn() else { return };

    let mut def = QueryDef::new("distinct_only", vec![("a", zset_int())]);
    def.assign("distincted", ops::distinct("a"));
    def.ret(&["distincted"]);
    let graph = compile(&def).expect("compile");
    let mut store =
        StorePostgres::from_graph(conn, &graph, &unique_prefix("dt"), true).expect("store");

    assert_eq!(int_step(&mut store, &graph, &[(3, 1)]), expect_ints(&[(3, 1)]));
    assert_eq!(int_step(&mut store, &graph, &[(3, 1)]), expect_ints(&[]));
    assert_eq!(
        int_step(&mut store, &graph, &[(3, -2)]),
        expect_ints(&[(3, -1)])
    );
}
