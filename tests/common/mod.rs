//! Shared helpers for the integration suites.
#![allow(dead_code)]

use zincr::execution::entries;
use zincr::{Config, DataType, Datum, Value};

/// Route engine tracing through `RUST_LOG` when debugging a suite.
pub fn init_tracing() {
    Config::default().init_logging();
}

pub fn zset_int() -> DataType {
    DataType::zset(DataType::Int)
}

/// A step output as sorted `(value, count)` integers.
pub fn int_entries(d: &Datum) -> Vec<(i64, i64)> {
    entries(d)
        .expect("entries")
        .into_iter()
        .map(|(v, c)| (v.as_int().expect("int"), c))
        .collect()
}

/// A step output of `Pair<int, int>` as sorted `(left, right, count)`.
pub fn pair_entries(d: &Datum) -> Vec<(i64, i64, i64)> {
    let mut out: Vec<(i64, i64, i64)> = entries(d)
        .expect("entries")
        .into_iter()
        .map(|(v, c)| {
            let left = v.lookup_path("left").expect("left").as_int().expect("int");
            let right = v
                .lookup_path("right")
                .expect("right")
                .as_int()
                .expect("int");
            (left, right, c)
        })
        .collect();
    out.sort();
    out
}

/// Build the expected `(value, count)` list from literals.
pub fn expect_ints(pairs: &[(i64, i64)]) -> Vec<(i64, i64)> {
    pairs.to_vec()
}

#[allow(dead_code)]
pub fn int_value(i: i64) -> Value {
    Value::int(i)
}
