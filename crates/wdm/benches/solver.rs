// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Solver benchmarks: dirty marking and element retrieval.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use wdm::{
    GraphSolver, IntermediateGraphSolver, NotifyRequestBuilder, PropertyFlags, PropertyInfo,
    PropertyPathHandle, Result, Tag, TlvWriter, TraitCatalog, TraitDataHandle, TraitDataSource,
    TraitLocator, TraitPath, TraitPathStore, TraitSchema, TraitSchemaEngine,
};

// root(1) -> a(2) -> { b(3) -> { c(4), d(5) }, e(6) }, f(7), g(8)
const PROPERTIES: &[PropertyInfo] = &[
    PropertyInfo { parent: 0, context_tag: 0, flags: PropertyFlags::empty() },
    PropertyInfo { parent: 1, context_tag: 1, flags: PropertyFlags::empty() },
    PropertyInfo { parent: 2, context_tag: 1, flags: PropertyFlags::empty() },
    PropertyInfo { parent: 3, context_tag: 1, flags: PropertyFlags::empty() },
    PropertyInfo { parent: 3, context_tag: 2, flags: PropertyFlags::empty() },
    PropertyInfo { parent: 2, context_tag: 2, flags: PropertyFlags::empty() },
    PropertyInfo { parent: 1, context_tag: 2, flags: PropertyFlags::empty() },
    PropertyInfo { parent: 1, context_tag: 3, flags: PropertyFlags::empty() },
];

const SCHEMA: TraitSchema = TraitSchema::new(0x0001_0B00, 1, 1, PROPERTIES);
const T: TraitDataHandle = 1;

struct BenchSource;

impl TraitDataSource for BenchSource {
    fn version(&self) -> u64 {
        7
    }

    fn exists(&self, _path: PropertyPathHandle) -> bool {
        true
    }

    fn read_leaf(&self, path: PropertyPathHandle, tag: Tag, writer: &mut TlvWriter) -> Result<()> {
        writer.put_unsigned(tag, u64::from(path.schema_handle()))
    }

    fn next_dictionary_key(
        &self,
        _dictionary: PropertyPathHandle,
        _after: Option<u16>,
    ) -> Option<u16> {
        None
    }
}

struct BenchCatalog {
    source: BenchSource,
}

impl TraitCatalog for BenchCatalog {
    fn schema(&self, _handle: TraitDataHandle) -> Option<&dyn TraitSchemaEngine> {
        Some(&SCHEMA)
    }

    fn source(&self, _handle: TraitDataHandle) -> Option<&dyn TraitDataSource> {
        Some(&self.source)
    }

    fn locator(&self, _handle: TraitDataHandle) -> Option<TraitLocator> {
        Some(TraitLocator::default())
    }
}

fn bench_set_dirty_dedup(c: &mut Criterion) {
    let handles = [4u16, 5, 6, 7, 8, 3, 2];
    c.bench_function("solver_set_dirty_dedup", |b| {
        b.iter(|| {
            let mut solver = IntermediateGraphSolver::new();
            solver.add_trait(T).expect("add");
            for &h in &handles {
                solver
                    .set_dirty(TraitPath::new(T, PropertyPathHandle::new(h)), &SCHEMA)
                    .expect("dirty");
            }
            black_box(solver.is_dirty(T));
        });
    });
}

fn bench_retrieve_merge_element(c: &mut Criterion) {
    let catalog = BenchCatalog {
        source: BenchSource,
    };
    c.bench_function("solver_retrieve_merge_element", |b| {
        b.iter(|| {
            let mut solver = IntermediateGraphSolver::new();
            solver.add_trait(T).expect("add");
            // Siblings c and d: LCA at b with a two-entry merge set.
            for h in [4u16, 5] {
                solver
                    .set_dirty(TraitPath::new(T, PropertyPathHandle::new(h)), &SCHEMA)
                    .expect("dirty");
            }

            let mut sent = TraitPathStore::with_capacity(16);
            let mut buf = [0u8; 512];
            let mut builder = NotifyRequestBuilder::new(&mut buf);
            builder.start_notify_request(Some(1), None).expect("start");
            builder.start_data_list().expect("list");
            let r = solver
                .retrieve_trait_instance_data(&mut builder, T, &catalog, false, None, &mut sent)
                .expect("retrieve");
            black_box(r.element_written);
            black_box(builder.end_notify_request().expect("finalize"));
        });
    });
}

criterion_group!(benches, bench_set_dirty_dedup, bench_retrieve_merge_element);
criterion_main!(benches);
