//! Property tests over the universal laws.

use proptest::prelude::*;
use zincr::execution::{delta, iteration};
use zincr::value::codec;
use zincr::{compile, ops, DataType, Index, KeyMatch, QueryDef, StoreMemory, Value, ZSetMemory};

fn zset_from(pairs: &[(i64, i64)]) -> ZSetMemory {
    ZSetMemory::from_pairs(
        DataType::Int,
        Vec::new(),
        pairs.iter().map(|(v, c)| (Value::int(*v), *c)),
    )
    .expect("zset")
}

fn small_pairs() -> impl Strategy<Value = Vec<(i64, i64)>> {
    prop::collection::vec(((-8i64..8), (-3i64..4)), 0..12)
}

fn streams() -> impl Strategy<Value = Vec<Vec<(i64, i64)>>> {
    prop::collection::vec(small_pairs(), 1..6)
}

proptest! {
    #[test]
    fn prop_addition_commutes(a in small_pairs(), b in small_pairs()) {
        let (za, zb) = (zset_from(&a), zset_from(&b));
        prop_assert_eq!(
            za.add_zset(&zb).expect("add"),
            zb.add_zset(&za).expect("add")
        );
    }

    #[test]
    fn prop_addition_associates(a in small_pairs(), b in small_pairs(), c in small_pairs()) {
        let (za, zb, zc) = (zset_from(&a), zset_from(&b), zset_from(&c));
        let left = za.add_zset(&zb).expect("add").add_zset(&zc).expect("add");
        let right = za.add_zset(&zb.add_zset(&zc).expect("add")).expect("add");
        prop_assert_eq!(left, right);
    }

    #[test]
    fn prop_negation_cancels(a in small_pairs()) {
        let za = zset_from(&a);
        prop_assert!(za.add_zset(&za.neg()).expect("add").is_empty());
    }

    #[test]
    fn prop_no_zero_entries(a in small_pairs(), b in small_pairs()) {
        let sum = zset_from(&a).add_zset(&zset_from(&b)).expect("add");
        prop_assert!(sum.iter().all(|(_, c)| c != 0));
    }

    #[test]
    fn prop_integrate_differentiate_duality(stream in streams()) {
        // integrate(differentiate(a)) = a and differentiate(integrate(a)) = a,
        // step-wise, for arbitrary streams
        for order in [true, false] {
            let mut def = QueryDef::new(
                "round_trip",
                vec![("a", DataType::zset(DataType::Int))],
            );
            if order {
                def.assign("x", ops::integrate("a"));
                def.assign("y", ops::differentiate("x"));
            } else {
                def.assign("x", ops::differentiate("a"));
                def.assign("y", ops::integrate("x"));
            }
            def.ret(&["y"]);
            let graph = compile(&def).expect("compile");
            let mut store = StoreMemory::from_graph(&graph).expect("store");

            for step in &stream {
                let input = delta(
                    DataType::Int,
                    step.iter().map(|(v, c)| (Value::int(*v), *c)),
                )
                .expect("delta");
                let out =
                    iteration(&mut store, &graph, vec![input]).expect("step");
                let got = out[0].as_zset().expect("zset").to_memory().expect("mem");
                prop_assert_eq!(got, zset_from(step));
            }
        }
    }

    #[test]
    fn prop_index_scan_is_sorted_and_insertion_independent(mut values in prop::collection::vec(-50i64..50, 1..30)) {
        let index = Index::identity(DataType::Int);
        let forward = ZSetMemory::from_pairs(
            DataType::Int,
            vec![index.clone()],
            values.iter().map(|v| (Value::int(*v), 1)),
        )
        .expect("zset");
        values.reverse();
        let backward = ZSetMemory::from_pairs(
            DataType::Int,
            vec![index.clone()],
            values.iter().map(|v| (Value::int(*v), 1)),
        )
        .expect("zset");

        let scan = |z: &ZSetMemory| -> Vec<i64> {
            z.iter_by_index(&index, &KeyMatch::All)
                .expect("scan")
                .into_iter()
                .map(|(_, v, _)| v.as_int().expect("int"))
                .collect()
        };
        let forward_scan = scan(&forward);
        let mut sorted = forward_scan.clone();
        sorted.sort_unstable();
        prop_assert_eq!(&forward_scan, &sorted);
        prop_assert_eq!(forward_scan, scan(&backward));
    }

    #[test]
    fn prop_codec_round_trips_pairs(l in -1000i64..1000, r in ".*") {
        let ty = DataType::pair(DataType::Int, DataType::Str);
        let value = Value::pair(Value::int(l), Value::str(&r));
        let bytes = codec::encode(&value);
        prop_assert_eq!(codec::decode(&ty, &bytes).expect("decode"), value);
    }

    #[test]
    fn prop_identity_deterministic(l in -1000i64..1000, r in ".*") {
        let a = Value::pair(Value::int(l), Value::str(&r));
        let b = Value::pair(Value::int(l), Value::str(&r));
        prop_assert_eq!(codec::identity(&a), codec::identity(&b));
    }
}
