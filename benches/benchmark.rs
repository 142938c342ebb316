use criterion::{black_box, criterion_group, criterion_main, Criterion};
use release_screens::{
    classify, retake_offset, sanitize_filename, select_timestamps, validate_existing_hosting,
    ContentCategory, HostConfig, ResponseMapping, SizePolicy, SourceKind, TimestampRequest,
    UploadedImageRecord,
};
use std::collections::BTreeMap;
use std::time::Duration;

// Fast settings for all benchmarks
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

fn benchmark_timestamp_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("timestamps");
    configure_fast_group(&mut group);

    let movie = TimestampRequest::new(7200.0, 23.976, 6);
    let mut disc_retake = TimestampRequest::new(2700.0, 25.0, 12);
    disc_retake.source_kind = SourceKind::Bluray;
    disc_retake.category = ContentCategory::Tv;
    disc_retake.retake_ordinal = 3;

    group.bench_function("movie", |b| {
        b.iter(|| black_box(select_timestamps(black_box(&movie))));
    });
    group.bench_function("disc_tv_retake", |b| {
        b.iter(|| black_box(select_timestamps(black_box(&disc_retake))));
    });

    group.finish();
}

fn benchmark_size_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("validation");
    configure_fast_group(&mut group);

    let policy = SizePolicy {
        min_bytes: Some(75_000),
        max_bytes: Some(10_000_000),
    };
    let sizes = [4_000u64, 50_000, 750_000, 12_000_000];
    let perturbations = [5.0, 10.0, -10.0, 100.0, -100.0];

    group.bench_function("classify", |b| {
        b.iter(|| {
            for size in &sizes {
                black_box(classify(black_box(*size), 10_000, &policy));
            }
        });
    });
    group.bench_function("retake_offset", |b| {
        b.iter(|| {
            for attempt in 1..=5 {
                black_box(retake_offset(black_box(60.0), attempt, &perturbations, 3600.0));
            }
        });
    });

    group.finish();
}

fn benchmark_existing_hosting(c: &mut Criterion) {
    let mut group = c.benchmark_group("existing_hosting");
    configure_fast_group(&mut group);

    let hosts: Vec<HostConfig> = ["alpha", "beta", "gamma"]
        .iter()
        .map(|name| HostConfig {
            name: name.to_string(),
            endpoint: format!("https://{name}.example/upload"),
            api_key: None,
            api_key_field: "key".to_string(),
            api_key_header: None,
            file_field: "image".to_string(),
            form_fields: BTreeMap::new(),
            response: ResponseMapping::default(),
            max_concurrency: None,
            min_image_size: None,
            max_image_size: None,
            duplicate_markers: Vec::new(),
            domains: vec![format!("{name}.example")],
        })
        .collect();
    let records: Vec<UploadedImageRecord> = (0..12)
        .map(|i| UploadedImageRecord {
            img_url: format!("https://i.gamma.example/t{i}.png"),
            raw_url: format!("https://i.gamma.example/{i}.png"),
            web_url: format!("https://gamma.example/v/{i}"),
            host_name: None,
            source_screenshot_index: i,
            release_url: None,
        })
        .collect();
    let approved = vec!["beta".to_string(), "gamma".to_string()];

    group.bench_function("domain_lookup", |b| {
        b.iter(|| black_box(validate_existing_hosting(black_box(&records), &approved, &hosts)));
    });

    group.finish();
}

fn benchmark_filename_sanitization(c: &mut Criterion) {
    let mut group = c.benchmark_group("filename_sanitization");
    configure_fast_group(&mut group);

    let names = [
        "Some Movie 2021 1080p BluRay",
        "Show: S01E01 / \"Pilot\"",
        "   ",
    ];

    group.bench_function("sanitize", |b| {
        b.iter(|| {
            for name in &names {
                black_box(sanitize_filename(black_box(name)));
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_timestamp_selection,
    benchmark_size_validation,
    benchmark_existing_hosting,
    benchmark_filename_sanitization
);
criterion_main!(benches);
