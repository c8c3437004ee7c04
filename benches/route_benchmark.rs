use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use portal_router::{Config, FileCache, PathNormalizer, RouteTable};

use std::{fs, path::Path, time::SystemTime};

fn portal_tree(root: &Path) {
    for rel in [
        "website/index.php",
        "website/announcements.php",
        "website/style.css",
        "modules/admin/reports.php",
        "modules/student/dashboard.php",
        "modules/super_admin/settings.php",
        "unified_login.php",
    ] {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, rel).unwrap();
    }
}

fn route_resolution_benchmark(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    portal_tree(dir.path());
    let config = Config::new().with_app_root(dir.path().to_string_lossy().to_string());
    let table = RouteTable::from_config(&config);
    let normalizer = PathNormalizer::from_config(&config);

    let mut group = c.benchmark_group("route_resolution");
    let cases = [
        ("landing", "/"),
        ("content_root", "/announcements.php"),
        ("module_root", "/settings.php"),
        ("app_root", "/unified_login.php"),
        ("not_found", "/does_not_exist.php"),
        ("traversal", "/../../etc/passwd"),
    ];
    for (name, uri) in cases.iter() {
        let path = normalizer.normalize(uri);
        group.bench_with_input(BenchmarkId::from_parameter(name), &path, |b, path| {
            b.iter(|| black_box(table.resolve(black_box(path))));
        });
    }
    group.finish();
}

fn static_cache_benchmark(c: &mut Criterion) {
    let time = SystemTime::now();
    let mut cache = FileCache::from_capacity(100, 1024 * 1024);
    for i in 0..100 {
        let name = format!("website/assets/file{}.css", i);
        cache.push(Path::new(&name), Bytes::from(vec![b'x'; 4096]), time);
    }

    c.bench_function("static_cache_hit", |b| {
        b.iter(|| black_box(cache.find(black_box(Path::new("website/assets/file50.css")), time)));
    });
    c.bench_function("static_cache_miss", |b| {
        b.iter(|| black_box(cache.find(black_box(Path::new("website/assets/missing.css")), time)));
    });
}

criterion_group!(benches, route_resolution_benchmark, static_cache_benchmark);
criterion_main!(benches);
