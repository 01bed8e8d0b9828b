use criterion::{black_box, criterion_group, criterion_main, Criterion};
use roster_kernel_core::{BusinessId, EntityKind, IdScheme};

fn bench_format(c: &mut Criterion) {
    c.bench_function("format_session_ids_10000", |b| {
        b.iter(|| {
            for sequence in 1..=10_000_u32 {
                if let Err(err) = IdScheme::SESSION.format(black_box(2025), sequence) {
                    panic!("format benchmark failed: {err}");
                }
            }
        });
    });
}

fn bench_parse(c: &mut Criterion) {
    let raw = (1..=10_000_u32)
        .filter_map(|sequence| IdScheme::USER_STUDENT.format(2025, sequence % 9_999 + 1).ok())
        .map(|id| id.to_string())
        .collect::<Vec<_>>();

    c.bench_function("parse_user_ids_10000", |b| {
        b.iter(|| {
            for candidate in &raw {
                if let Err(err) = BusinessId::parse(EntityKind::User, black_box(candidate)) {
                    panic!("parse benchmark failed: {err}");
                }
            }
        });
    });
}

criterion_group!(identifier_benches, bench_format, bench_parse);
criterion_main!(identifier_benches);
