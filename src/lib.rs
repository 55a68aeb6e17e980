//! # Zincr
//!
//! An incremental view-maintenance engine: a small DBSP-style dataflow
//! runtime. A query is a pure function from input streams of Z-sets
//! (multisets with signed multiplicities) to output streams of Z-sets; the
//! compiler turns it into a fixed, typed dataflow graph, and the scheduler
//! executes the graph step-wise on batches of changes. Integrating the
//! outputs over time equals running the non-incremental query over the
//! integrated inputs.
//!
//! ## Pipeline
//!
//! ```text
//! QueryDef (SSA statements over the operator library)
//!     |
//! [ir_builder]   two-pass resolution, type unification  ->  Graph
//!     |
//! [optimizer]    scalar-delay reshape, group lifting,
//!                grouped-delay expansion, identity elision
//!     |
//! [store]        one persistent cell per delay vertex
//!     |
//! [execution]    topological step evaluator, fixpoint driving,
//!                atomic commit via Store::inc
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use zincr::{ops, DataType, QueryDef, StoreMemory, Value};
//! use zincr::execution::{delta, entries, iteration};
//!
//! let mut def = QueryDef::new("running_total", vec![("a", DataType::zset(DataType::Int))]);
//! def.assign("integrated", ops::integrate("a"));
//! def.ret(&["integrated"]);
//!
//! let graph = zincr::compile(&def).unwrap();
//! let mut store = StoreMemory::from_graph(&graph).unwrap();
//!
//! let out = iteration(&mut store, &graph,
//!     vec![delta(DataType::Int, [(Value::int(8), 1)]).unwrap()]).unwrap();
//! assert_eq!(entries(&out[0]).unwrap(), vec![(Value::int(8), 1)]);
//! ```
//!
//! Delay state lives in a pluggable [`store::Store`]: in-memory, or SQL
//! (SQLite/PostgreSQL) with one indexed table per delay vertex.

pub mod btree;
pub mod cache;
pub mod config;
pub mod error;
pub mod execution;
pub mod index;
pub mod ir;
pub mod ir_builder;
pub mod operators;
pub mod optimizer;
pub mod sorted_set;
pub mod store;
pub mod value;
pub mod zset;

// The operator library under its working name.
pub use operators::derived as ops;

pub use cache::Cache;
pub use config::Config;
pub use error::{Error, Result};
pub use execution::{iteration, Actions};
pub use index::Index;
pub use ir::{Graph, OperatorKind, Path};
pub use ir_builder::{compile, Call, QueryDef};
pub use store::{Store, StoreMemory, StorePostgres, StoreSqlite};
pub use value::{Atom, DataType, Record, RecordSchema, Value};
pub use zset::memory::ZSetMemory;
pub use zset::{Datum, KeyMatch, Match, ZSet};
