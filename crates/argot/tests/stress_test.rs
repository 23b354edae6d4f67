//! Concurrency stress: interning, dispatch against live registration, and
//! racing initialization.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use argot::{
    Class, Id, MethodDesc, Object, Selector, add_method_list, get_slot,
    lookup_slot,
};

unsafe extern "C" fn echo_imp(
    _receiver: Id,
    _sel: Selector,
    _args: *const *mut u8,
    ret: *mut u8,
) {
    // SAFETY: dispatch guarantees a 16-byte return buffer.
    unsafe { ret.cast::<usize>().write_unaligned(5) };
}

#[test]
fn test_concurrent_interning_converges() {
    let names: Vec<String> = (0..32).map(|i| format!("stressSel{i}:")).collect();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let names = names.clone();
            thread::spawn(move || {
                names
                    .iter()
                    .map(|n| Selector::register(n, Some("v@:@")))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let results: Vec<Vec<Selector>> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();
    for per_thread in &results[1..] {
        for (a, b) in per_thread.iter().zip(results[0].iter()) {
            assert_eq!(a, b);
        }
    }
}

#[test]
fn test_dispatch_races_registration() {
    let root = Class::new_root("StressRoot").unwrap();
    add_method_list(
        root,
        &[MethodDesc { name: "stressEcho", types: "q@:", imp: echo_imp }],
    );
    let sel = Selector::register("stressEcho", Some("q@:"));

    // One thread keeps defining overrides on fresh subclasses (growing the
    // selector's dtable); others hammer lookups on the root's instances.
    let writer = thread::spawn(move || {
        for i in 0..64 {
            let sub = Class::new(&format!("StressSub{i}"), root).unwrap();
            add_method_list(
                sub,
                &[MethodDesc { name: "stressEcho", types: "q@:", imp: echo_imp }],
            );
        }
    });

    let readers: Vec<_> = (0..4)
        .map(|_| {
            thread::spawn(move || {
                let obj = Object::new(root);
                for _ in 0..2_000 {
                    let mut recv = obj.as_id();
                    // SAFETY: recv is a live object.
                    let slot = unsafe { lookup_slot(&mut recv, sel, None) };
                    // The root's own binding must resolve throughout.
                    assert_eq!(slot.owner(), Some(root));
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    // Every subclass override is visible once registration settles.
    for i in 0..64 {
        let sub = argot::lookup_class(&format!("StressSub{i}")).unwrap();
        assert_eq!(get_slot(sub, sel).unwrap().owner(), Some(sub));
    }
}

#[test]
fn test_initialization_stampede() {
    static RUNS: AtomicUsize = AtomicUsize::new(0);
    unsafe extern "C" fn counting_init(
        _receiver: Id,
        _sel: Selector,
        _args: *const *mut u8,
        _ret: *mut u8,
    ) {
        RUNS.fetch_add(1, Ordering::SeqCst);
    }

    // A chain of classes, each with its own initializer; many threads race
    // to message the leaves.
    let root = Class::new_root("StampedeRoot").unwrap();
    let mid = Class::new("StampedeMid", root).unwrap();
    let leaf = Class::new("StampedeLeaf", mid).unwrap();
    for class in [root, mid, leaf] {
        add_method_list(
            class.metaclass(),
            &[MethodDesc { name: "initialize", types: "v@:", imp: counting_init }],
        );
        add_method_list(
            class,
            &[MethodDesc { name: "stampedePoke", types: "v@:", imp: echo_imp }],
        );
    }

    let sel = Selector::register("stampedePoke", Some("v@:"));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            thread::spawn(move || {
                let obj = Object::new(leaf);
                let mut recv = obj.as_id();
                // SAFETY: recv is a live object.
                let slot = unsafe { lookup_slot(&mut recv, sel, None) };
                assert_eq!(slot.owner(), Some(leaf));
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Exactly one initializer run per class in the chain.
    assert_eq!(RUNS.load(Ordering::SeqCst), 3);
}
