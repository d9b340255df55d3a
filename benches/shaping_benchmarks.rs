//! Benchmarks for the result-shaping stages and statement templates.
//!
//! Run with: `cargo bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sqlweave::cache::MemoryTranslationCache;
use sqlweave::config::{
    EngineSettings, Format, MaskKind, ParamLookup, Pivot, SecureMask, ShapingDirectives,
    SqlTemplate, Translate,
};
use sqlweave::exec::ExecutionContext;
use sqlweave::secure::DefaultDesensitizer;
use sqlweave::shaping::{pivot, run_pipeline, DataSet, ShapeEnv};
use sqlweave::CellValue;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

const REPORT_TEMPLATE: &str = "select staff_id, staff_name, status, amount from sys_staff \
    where 1=1 #[and status = :status] #[and dept_id in (:deptIds)] \
    #[and staff_name like :name] order by staff_id";

fn staff_rows(n: usize) -> DataSet {
    let rows = (0..n)
        .map(|i| {
            vec![
                CellValue::Text(format!("S{:05}", i)),
                CellValue::Text(format!("Staff Member {}", i)),
                CellValue::Text(format!("138{:08}", i)),
                CellValue::Text((i % 3).to_string()),
                CellValue::Float64(i as f64 * 12.5),
            ]
        })
        .collect();
    DataSet::new(
        vec![
            "staff_id".into(),
            "staff_name".into(),
            "mobile".into(),
            "status".into(),
            "amount".into(),
        ],
        rows,
    )
}

fn sales_rows(groups: usize) -> DataSet {
    let mut rows = Vec::new();
    for g in 0..groups {
        for month in 1..=12 {
            rows.push(vec![
                CellValue::Text(format!("region-{}", g)),
                CellValue::Text(format!("2024-{:02}", month)),
                CellValue::Int64((g * month) as i64),
            ]);
        }
    }
    DataSet::new(vec!["region".into(), "month".into(), "qty".into()], rows)
}

fn caches() -> MemoryTranslationCache {
    let cache = MemoryTranslationCache::new();
    cache.put(
        "status",
        vec![
            vec!["0".into(), "Inactive".into()],
            vec!["1".into(), "Active".into()],
            vec!["2".into(), "Archived".into()],
        ],
    );
    cache
}

struct Params;

impl ParamLookup for Params {
    fn named(&self, name: &str) -> CellValue {
        match name {
            "status" => CellValue::Int64(1),
            "deptIds" => CellValue::Array(vec!["D1".into(), "D2".into(), "D3".into()]),
            _ => CellValue::Null,
        }
    }

    fn positional(&self, _index: usize) -> Option<CellValue> {
        None
    }
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_template(c: &mut Criterion) {
    let template = SqlTemplate::parse(REPORT_TEMPLATE).unwrap();
    c.bench_function("template_parse", |b| {
        b.iter(|| SqlTemplate::parse(black_box(REPORT_TEMPLATE)).unwrap())
    });
    c.bench_function("template_bind", |b| {
        b.iter(|| template.bind(black_box(&Params)).unwrap())
    });
}

fn bench_pipeline(c: &mut Criterion) {
    let caches = caches();
    let env = ShapeEnv {
        caches: Some(&caches),
        decryptor: None,
        desensitizer: &DefaultDesensitizer,
    };
    let settings = EngineSettings::default();
    let directives = ShapingDirectives {
        translates: vec![Translate::new("status", "status")],
        masks: vec![SecureMask::new("mobile", MaskKind::Mobile)],
        formats: vec![Format::number("amount", "#,##0.00")],
        ..Default::default()
    };

    let mut group = c.benchmark_group("pipeline");
    for size in [100, 1_000, 10_000] {
        let data = staff_rows(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| {
                let mut data = data.clone();
                let mut ctx = ExecutionContext::start("bench", "staff", &settings);
                run_pipeline(&mut data, &directives, &env, &mut ctx).unwrap();
                ctx.finish();
                data
            })
        });
    }
    group.finish();
}

fn bench_pivot(c: &mut Criterion) {
    let spec = Pivot {
        category_columns: vec!["month".into()],
        group_columns: vec!["region".into()],
        start_column: "qty".into(),
        end_column: None,
        default_value: None,
        categories: None,
    };
    let mut group = c.benchmark_group("pivot");
    for groups in [10, 100, 1_000] {
        let data = sales_rows(groups);
        group.bench_with_input(BenchmarkId::from_parameter(groups), &data, |b, data| {
            b.iter(|| {
                let mut data = data.clone();
                pivot::pivot(&mut data, &spec).unwrap();
                data
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_template, bench_pipeline, bench_pivot);
criterion_main!(benches);
