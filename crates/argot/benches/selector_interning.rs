//! Selector interning benchmarks: warm-table hits, fresh registrations,
//! and typed-variant resolution.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use argot::Selector;

/// Repeatedly intern an already-registered selector (the common case on a
/// warm runtime).
fn bench_intern_hit(c: &mut Criterion) {
    let _ = Selector::register("describeWith:options:", None);
    c.bench_function("selector_intern_hit", |b| {
        b.iter(|| black_box(Selector::register("describeWith:options:", None)));
    });
}

/// Intern a stream of fresh names (write-lock path plus peer creation).
fn bench_intern_miss(c: &mut Criterion) {
    let mut counter = 0u64;
    c.bench_function("selector_intern_miss", |b| {
        b.iter(|| {
            counter = counter.wrapping_add(1);
            let name = format!("freshSelector{counter}:");
            black_box(Selector::register(&name, Some("v@:@")))
        });
    });
}

/// Resolve a typed selector whose untyped peer and sibling variants are
/// already registered (chain walk with type comparison).
fn bench_intern_typed_hit(c: &mut Criterion) {
    let _ = Selector::register("benchTyped:", Some("v@:i"));
    let _ = Selector::register("benchTyped:", Some("i@:i"));
    let _ = Selector::register("benchTyped:", Some("d@:i"));
    c.bench_function("selector_intern_typed_hit", |b| {
        b.iter(|| black_box(Selector::register("benchTyped:", Some("i@:i"))));
    });
}

/// Resolve the untyped peer of a typed selector.
fn bench_untyped_peer(c: &mut Criterion) {
    let sel = Selector::register("benchPeer:", Some("v@:@"));
    c.bench_function("selector_untyped_peer", |b| {
        b.iter(|| black_box(sel.untyped()));
    });
}

criterion_group!(
    benches,
    bench_intern_hit,
    bench_intern_miss,
    bench_intern_typed_hit,
    bench_untyped_peer
);
criterion_main!(benches);
