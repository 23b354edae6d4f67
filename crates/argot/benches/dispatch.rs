//! Dispatch hot-path benchmarks: resolved sends, inherited sends, and the
//! miss paths that fall through to the hooks.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use argot::{
    Class, Id, MethodDesc, Object, Selector, add_method_list, cached_entry,
    get_slot, lookup_slot,
};

unsafe extern "C" fn bench_imp(
    _receiver: Id,
    _sel: Selector,
    _args: *const *mut u8,
    ret: *mut u8,
) {
    // SAFETY: dispatch guarantees a 16-byte return buffer.
    unsafe { ret.cast::<usize>().write_unaligned(1) };
}

fn bench_direct_send(c: &mut Criterion) {
    let class = Class::new_root("BenchDirect").unwrap();
    add_method_list(
        class,
        &[MethodDesc { name: "benchPing", types: "q@:", imp: bench_imp }],
    );
    let sel = Selector::register("benchPing", Some("q@:"));
    let obj = Object::new(class);

    c.bench_function("dispatch_direct", |b| {
        b.iter(|| {
            let mut recv = obj.as_id();
            // SAFETY: recv is a live object.
            black_box(unsafe { lookup_slot(&mut recv, sel, None) })
        });
    });
}

fn bench_inherited_send(c: &mut Criterion) {
    let root = Class::new_root("BenchInhRoot").unwrap();
    add_method_list(
        root,
        &[MethodDesc { name: "benchDeep", types: "q@:", imp: bench_imp }],
    );
    let mut leaf = root;
    for i in 0..8 {
        leaf = Class::new(&format!("BenchInh{i}"), leaf).unwrap();
    }
    let sel = Selector::register("benchDeep", Some("q@:"));
    let obj = Object::new(leaf);

    c.bench_function("dispatch_inherited_depth8", |b| {
        b.iter(|| {
            let mut recv = obj.as_id();
            // SAFETY: recv is a live object.
            black_box(unsafe { lookup_slot(&mut recv, sel, None) })
        });
    });
}

fn bench_forwarded_send(c: &mut Criterion) {
    let class = Class::new_root("BenchFwd").unwrap();
    let sel = Selector::register("benchAbsent", Some("q@:"));
    let obj = Object::new(class);

    c.bench_function("dispatch_forwarded", |b| {
        b.iter(|| {
            let mut recv = obj.as_id();
            // SAFETY: recv is a live object.
            black_box(unsafe { lookup_slot(&mut recv, sel, None) })
        });
    });
}

fn bench_get_slot(c: &mut Criterion) {
    let class = Class::new_root("BenchGetSlot").unwrap();
    add_method_list(
        class,
        &[MethodDesc { name: "benchProbe", types: "q@:", imp: bench_imp }],
    );
    let sel = Selector::register("benchProbe", Some("q@:"));

    c.bench_function("get_slot", |b| {
        b.iter(|| black_box(get_slot(class, sel)));
    });
    c.bench_function("cache_probe", |b| {
        b.iter(|| black_box(cached_entry(sel, class)));
    });
}

criterion_group!(
    benches,
    bench_direct_send,
    bench_inherited_send,
    bench_forwarded_send,
    bench_get_slot
);
criterion_main!(benches);
