//! Joins, grouping, aggregates, first-n and caches against the in-memory
//! store.

mod common;

use std::sync::Arc;

use common::{expect_ints, int_entries, zset_int};
use zincr::execution::{delta, entries, iteration, Actions};
use zincr::{
    compile, ops, Cache, DataType, Datum, Index, KeyMatch, QueryDef, Record, RecordSchema,
    StoreMemory, Value,
};

fn left_schema() -> Arc<RecordSchema> {
    RecordSchema::new(
        "queries.Left",
        vec![
            ("kind", DataType::Str),
            ("name", DataType::Str),
            ("sound_id", DataType::Int),
        ],
    )
}

fn right_schema() -> Arc<RecordSchema> {
    RecordSchema::new(
        "queries.Right",
        vec![("sound_id", DataType::Int), ("sound", DataType::Str)],
    )
}

fn left(kind: &str, name: &str, sound_id: i64) -> Value {
    Record::new(
        &left_schema(),
        vec![
            ("kind", Value::str(kind)),
            ("name", Value::str(name)),
            ("sound_id", Value::int(sound_id)),
        ],
    )
    .expect("left record")
}

fn right(sound_id: i64, sound: &str) -> Value {
    Record::new(
        &right_schema(),
        vec![
            ("sound_id", Value::int(sound_id)),
            ("sound", Value::str(sound)),
        ],
    )
    .expect("right record")
}

fn join_graph(outer: bool) -> zincr::Graph {
    let lt = DataType::zset(DataType::Record(left_schema()));
    let rt = DataType::zset(DataType::Record(right_schema()));
    let on_left = Index::field(DataType::Record(left_schema()), "sound_id").expect("index");
    let on_right = Index::field(DataType::Record(right_schema()), "sound_id").expect("index");

    let mut def = QueryDef::new("sounds", vec![("l", lt), ("r", rt)]);
    if outer {
        def.assign("joined", ops::outer_join("l", "r", on_left, on_right));
    } else {
        def.assign("joined", ops::join("l", "r", on_left, on_right));
    }
    def.ret(&["joined"]);
    compile(&def).expect("compile")
}

#[test]
fn test_indexed_join() {
    let graph = join_graph(false);
    let mut store = StoreMemory::from_graph(&graph).expect("store");
    let mut actions = Actions::new(&mut store, &graph).expect("actions");

    actions.insert(0, &[left("cat", "felix", 1)]).expect("step");
    actions.insert(0, &[left("cat", "felix", 1)]).expect("step");

    let out = actions.insert(1, &[right(2, "woof")]).expect("step");
    assert!(entries(&out[0]).expect("entries").is_empty());

    let out = actions.insert(1, &[right(1, "miaow")]).expect("step");
    assert_eq!(
        entries(&out[0]).expect("entries"),
        vec![(Value::pair(left("cat", "felix", 1), right(1, "miaow")), 2)]
    );

    let out = actions.insert(0, &[left("dog", "fido", 2)]).expect("step");
    assert_eq!(
        entries(&out[0]).expect("entries"),
        vec![(Value::pair(left("dog", "fido", 2), right(2, "woof")), 1)]
    );

    let out = actions.remove(0, &[left("cat", "felix", 1)]).expect("step");
    assert_eq!(
        entries(&out[0]).expect("entries"),
        vec![(Value::pair(left("cat", "felix", 1), right(1, "miaow")), -1)]
    );
}

#[test]
fn test_join_commutes_up_to_swap() {
    // map(swap, join(r, l)) = join(l, r)
    let lt = DataType::zset(DataType::Record(left_schema()));
    let rt = DataType::zset(DataType::Record(right_schema()));
    let on_left = Index::field(DataType::Record(left_schema()), "sound_id").expect("index");
    let on_right = Index::field(DataType::Record(right_schema()), "sound_id").expect("index");

    let mut def = QueryDef::new("both_ways", vec![("l", lt), ("r", rt)]);
    def.assign(
        "forward",
        ops::join("l", "r", on_left.clone(), on_right.clone()),
    );
    def.assign("backward", ops::join("r", "l", on_right, on_left));
    def.assign(
        "swapped",
        ops::map(
            "backward",
            DataType::pair(
                DataType::Record(left_schema()),
                DataType::Record(right_schema()),
            ),
            |p| {
                Ok(Value::pair(
                    p.lookup_path("right")?,
                    p.lookup_path("left")?,
                ))
            },
        ),
    );
    def.ret(&["forward", "swapped"]);
    let graph = compile(&def).expect("compile");
    let mut store = StoreMemory::from_graph(&graph).expect("store");
    let mut actions = Actions::new(&mut store, &graph).expect("actions");

    actions.insert(0, &[left("cat", "felix", 1)]).expect("step");
    let out = actions
        .insert(1, &[right(1, "miaow"), right(2, "woof")])
        .expect("step");
    assert_eq!(
        entries(&out[0]).expect("entries"),
        entries(&out[1]).expect("entries")
    );
}

#[test]
fn test_outer_join_fills_missing_right() {
    let graph = join_graph(true);
    let mut store = StoreMemory::from_graph(&graph).expect("store");
    let mut actions = Actions::new(&mut store, &graph).expect("actions");

    let felix = left("cat", "felix", 1);
    let out = actions.insert(0, &[felix.clone()]).expect("step");
    assert_eq!(
        entries(&out[0]).expect("entries"),
        vec![(Value::pair(felix.clone(), Value::Empty), 1)]
    );

    let out = actions.insert(1, &[right(2, "woof")]).expect("step");
    assert!(entries(&out[0]).expect("entries").is_empty());

    // match arrives: the empty-filled pair retracts
    let out = actions.insert(1, &[right(1, "miaow")]).expect("step");
    let mut got = entries(&out[0]).expect("entries");
    got.sort_by_key(|(_, c)| *c);
    assert_eq!(
        got,
        vec![
            (Value::pair(felix.clone(), Value::Empty), -1),
            (Value::pair(felix.clone(), right(1, "miaow")), 1),
        ]
    );

    // the left row was matched, so removing it retracts only the join row
    let out = actions.remove(0, &[felix.clone()]).expect("step");
    assert_eq!(
        entries(&out[0]).expect("entries"),
        vec![(Value::pair(felix, right(1, "miaow")), -1)]
    );
}

fn len_index() -> Index {
    Index::atom("len", DataType::Str, DataType::Int, |v| {
        Value::int(v.as_str().map_or(0, |s| s.len() as i64))
    })
}

#[test]
fn test_group_map_flatten() {
    let mut def = QueryDef::new(
        "upper_by_len",
        vec![("a", DataType::zset(DataType::Str))],
    );
    def.assign("grouped", ops::group("a", len_index()));
    def.assign(
        "uppered",
        ops::per_group(&["grouped"], |args| {
            let mut inner = QueryDef::new("upper", vec![("g", args[0].clone())]);
            inner.assign(
                "u",
                ops::map("g", DataType::Str, |v| {
                    Ok(Value::str(v.as_str()?.to_uppercase()))
                }),
            );
            inner.ret(&["u"]);
            Ok(inner)
        }),
    );
    def.assign("flattened", ops::flatten("uppered"));
    def.ret(&["flattened"]);
    let graph = compile(&def).expect("compile");
    let mut store = StoreMemory::from_graph(&graph).expect("store");
    let mut actions = Actions::new(&mut store, &graph).expect("actions");

    let expect_pair = |word: &str, len: i64, count: i64| {
        vec![(Value::pair(Value::str(word), Value::int(len)), count)]
    };

    let out = actions.insert(0, &[Value::str("cat")]).expect("step");
    assert_eq!(entries(&out[0]).expect("entries"), expect_pair("CAT", 3, 1));

    let out = actions.insert(0, &[Value::str("ca")]).expect("step");
    assert_eq!(entries(&out[0]).expect("entries"), expect_pair("CA", 2, 1));

    let out = actions.insert(0, &[Value::str("dog")]).expect("step");
    assert_eq!(entries(&out[0]).expect("entries"), expect_pair("DOG", 3, 1));

    let out = actions.insert(0, &[Value::str("cat")]).expect("step");
    assert_eq!(entries(&out[0]).expect("entries"), expect_pair("CAT", 3, 1));

    let out = actions.remove(0, &[Value::str("cat")]).expect("step");
    assert_eq!(entries(&out[0]).expect("entries"), expect_pair("CAT", 3, -1));
}

#[test]
fn test_group_reduce_flatten_totals_per_key() {
    let mut def = QueryDef::new(
        "len_totals",
        vec![("a", DataType::zset(DataType::Str))],
    );
    def.assign(
        "totals",
        ops::group_reduce_flatten("a", len_index(), DataType::Int, Value::int(0), |_| {
            Ok(Value::int(1))
        }),
    );
    def.ret(&["totals"]);
    let graph = compile(&def).expect("compile");
    let mut store = StoreMemory::from_graph(&graph).expect("store");
    let mut actions = Actions::new(&mut store, &graph).expect("actions");

    // first word of length 3: count 1 appears
    let out = actions.insert(0, &[Value::str("cat")]).expect("step");
    assert_eq!(
        entries(&out[0]).expect("entries"),
        vec![(Value::pair(Value::int(1), Value::int(3)), 1)]
    );

    // second word of length 3: count moves 1 -> 2, other keys untouched
    let out = actions.insert(0, &[Value::str("dog")]).expect("step");
    let mut got = entries(&out[0]).expect("entries");
    got.sort_by_key(|(_, c)| *c);
    assert_eq!(
        got,
        vec![
            (Value::pair(Value::int(1), Value::int(3)), -1),
            (Value::pair(Value::int(2), Value::int(3)), 1),
        ]
    );

    let out = actions.insert(0, &[Value::str("ca")]).expect("step");
    assert_eq!(
        entries(&out[0]).expect("entries"),
        vec![(Value::pair(Value::int(1), Value::int(2)), 1)]
    );
}

fn product_schema() -> Arc<RecordSchema> {
    RecordSchema::new(
        "queries.Product",
        vec![("name", DataType::Str), ("price", DataType::Int)],
    )
}

fn product(name: &str, price: i64) -> Value {
    Record::new(
        &product_schema(),
        vec![("name", Value::str(name)), ("price", Value::int(price))],
    )
    .expect("product")
}

#[test]
fn test_sum_count_join_and_cache() {
    let one_left = Index::atom("one", DataType::Int, DataType::Int, |_| Value::int(1));
    let one_right = Index::atom("one", DataType::Int, DataType::Int, |_| Value::int(1));
    let pair_int = DataType::pair(DataType::Int, DataType::Int);
    let index_joined = Index::atom("one", pair_int.clone(), DataType::Int, |_| Value::int(1));
    let cache_joined = Cache::new();

    let mut def = QueryDef::new(
        "totals_and_counts",
        vec![("a", DataType::zset(DataType::Record(product_schema())))],
    );
    def.assign(
        "summed",
        ops::reduce("a", DataType::Int, Value::int(0), |p| {
            p.lookup_path("price")
        }),
    );
    def.assign("counted", ops::count("a"));
    def.assign(
        "joined",
        ops::join("summed", "counted", one_left, one_right),
    );
    {
        let index_joined = index_joined.clone();
        def.assign(
            "_cached",
            ops::cache_into(&cache_joined, "joined", move |args| {
                let mut inner = QueryDef::new("cache_totals", vec![("j", args[0].clone())]);
                inner.assign(
                    "integrated",
                    ops::integrate_indexed("j", vec![index_joined.clone()]),
                );
                inner.ret(&["integrated"]);
                Ok(inner)
            }),
        );
    }
    def.assign(
        "flattened",
        ops::map(
            "joined",
            DataType::Tuple(vec![DataType::Int, DataType::Int]),
            |p| {
                Ok(Value::tuple([
                    p.lookup_path("left")?,
                    p.lookup_path("right")?,
                ]))
            },
        ),
    );
    def.ret(&["flattened"]);
    let graph = compile(&def).expect("compile");
    let mut store = StoreMemory::from_graph(&graph).expect("store");

    let totals = |d: &Datum| -> Vec<((i64, i64), i64)> {
        let mut out: Vec<((i64, i64), i64)> = entries(d)
            .expect("entries")
            .into_iter()
            .map(|(v, c)| {
                let total = v.lookup_path("0").expect("total").as_int().expect("int");
                let n = v.lookup_path("1").expect("count").as_int().expect("int");
                ((total, n), c)
            })
            .collect();
        out.sort_by_key(|(_, c)| *c);
        out
    };

    {
        let mut actions = Actions::new(&mut store, &graph).expect("actions");

        let out = actions.insert(0, &[product("tv", 3)]).expect("step");
        assert_eq!(totals(&out[0]), vec![((3, 1), 1)]);

        let out = actions.insert(0, &[product("radio", 5)]).expect("step");
        assert_eq!(totals(&out[0]), vec![((3, 1), -1), ((8, 2), 1)]);

        let out = actions.insert(0, &[product("radio", 5)]).expect("step");
        assert_eq!(totals(&out[0]), vec![((8, 2), -1), ((13, 3), 1)]);

        let out = actions.remove(0, &[product("tv", 3)]).expect("step");
        assert_eq!(totals(&out[0]), vec![((13, 3), -1), ((10, 2), 1)]);
    }

    // the cached integral holds the current (total, count) pair
    let cached = cache_joined.zset(&store).expect("cache");
    let rows = cached
        .iter_by_index(
            &index_joined,
            &KeyMatch::Keys(vec![zincr::value::Key::Atom(zincr::Atom::Int(1))]),
        )
        .expect("scan");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1, Value::pair(Value::int(10), Value::int(2)));
    assert_eq!(rows[0].2, 1);
}

#[test]
fn test_first_n() {
    let index = Index::identity(DataType::Int);
    let mut def = QueryDef::new("smallest_three", vec![("a", zset_int())]);
    def.assign("taken", ops::first_n("a", index.clone(), 3));
    def.assign(
        "integrated",
        ops::integrate_indexed("taken", vec![index.clone()]),
    );
    def.ret(&["integrated"]);
    let graph = compile(&def).expect("compile");
    let mut store = StoreMemory::from_graph(&graph).expect("store");
    let mut actions = Actions::new(&mut store, &graph).expect("actions");

    let mut read = |values: &[Value], count: i64| -> Vec<i64> {
        let out = if count > 0 {
            actions.insert(0, values).expect("step")
        } else {
            actions.remove(0, values).expect("step")
        };
        out[0]
            .as_zset()
            .expect("zset")
            .iter_by_index(&index, &KeyMatch::All)
            .expect("scan")
            .into_iter()
            .flat_map(|(_, v, c)| {
                let v = v.as_int().expect("int");
                std::iter::repeat(v).take(usize::try_from(c).expect("positive"))
            })
            .collect()
    };

    assert_eq!(read(&[Value::int(1)], 1), vec![1]);
    assert_eq!(read(&[Value::int(2)], 1), vec![1, 2]);
    assert_eq!(read(&[Value::int(5)], 1), vec![1, 2, 5]);
    assert_eq!(read(&[Value::int(4)], 1), vec![1, 2, 4]);
    assert_eq!(read(&[Value::int(1)], 1), vec![1, 1, 2]);
    assert_eq!(read(&[Value::int(-1)], 1), vec![-1, 1, 1]);
    assert_eq!(read(&[Value::int(1)], -1), vec![-1, 1, 2]);
}

#[test]
fn test_map_many_inherits_counts() {
    let mut def = QueryDef::new("explode", vec![("a", zset_int())]);
    def.assign(
        "exploded",
        ops::map_many("a", DataType::Int, |v| {
            let i = v.as_int()?;
            Ok(vec![Value::int(i), Value::int(i + 100)])
        }),
    );
    def.ret(&["exploded"]);
    let graph = compile(&def).expect("compile");
    let mut store = StoreMemory::from_graph(&graph).expect("store");

    let input = delta(DataType::Int, [(Value::int(1), 2)]).expect("delta");
    let out = iteration(&mut store, &graph, vec![input]).expect("step");
    assert_eq!(int_entries(&out[0]), expect_ints(&[(1, 2), (101, 2)]));
}
