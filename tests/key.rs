use irontile::{KeyAllocator, OpKey};
use std::collections::{HashMap, HashSet};

#[test]
fn test_allocated_key_format() {
    let alloc = KeyAllocator::with_session("abc");

    assert_eq!(alloc.allocate("fetch").as_str(), "fetch-abc-0");
    assert_eq!(alloc.allocate("fetch").as_str(), "fetch-abc-1");
    assert_eq!(alloc.allocate("reduction").as_str(), "reduction-abc-2");
}

#[test]
fn test_allocated_keys_are_unique() {
    let alloc = KeyAllocator::with_session("s1");
    let keys: HashSet<OpKey> = (0..1000).map(|_| alloc.allocate("op")).collect();

    assert_eq!(keys.len(), 1000);
}

#[test]
fn test_allocation_is_unique_across_threads() {
    let alloc = KeyAllocator::with_session("mt");
    let keys: Vec<OpKey> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| s.spawn(|| (0..250).map(|_| alloc.allocate("op")).collect::<Vec<_>>()))
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap_or_default())
            .collect()
    });

    let unique: HashSet<&OpKey> = keys.iter().collect();
    assert_eq!(keys.len(), 1000);
    assert_eq!(unique.len(), 1000);
}

#[test]
fn test_sessions_differ_between_allocators() {
    let a = KeyAllocator::new();
    let b = KeyAllocator::new();

    assert_ne!(a.session(), b.session());
    assert_ne!(a.allocate("op"), b.allocate("op"));
}

#[test]
fn test_derive_is_deterministic() {
    let parent = OpKey::new("rebalance-xyz-7");

    assert_eq!(parent.derive("map", &[3]), parent.derive("map", &[3]));
    assert_eq!(
        OpKey::new("rebalance-xyz-7").derive("chunk", &[0]),
        parent.derive("chunk", &[0])
    );
}

#[test]
fn test_derive_distinguishes_inputs() {
    let parent = OpKey::new("p");
    let other = OpKey::new("q");

    assert_ne!(parent.derive("map", &[0]), parent.derive("map", &[1]));
    assert_ne!(parent.derive("map", &[0]), parent.derive("reduce", &[0]));
    assert_ne!(parent.derive("map", &[0]), other.derive("map", &[0]));
    assert_ne!(parent.derive("chunk", &[1, 0]), parent.derive("chunk", &[0, 1]));
}

#[test]
fn test_derive_readable_prefix() {
    let child = OpKey::new("p").derive("shuffle-map", &[2]);

    assert!(child.as_str().starts_with("shuffle-map-"));
    assert_eq!(child.as_str().len(), "shuffle-map-".len() + 24);
}

#[test]
fn test_key_conversions_and_display() {
    let from_str: OpKey = "chunk-42".into();
    let from_string: OpKey = String::from("chunk-42").into();

    assert_eq!(from_str, from_string);
    assert_eq!(from_str.to_string(), "chunk-42");
    assert_eq!(format!("{from_str}"), "chunk-42");
}

#[test]
fn test_key_in_hashmap_with_str_lookup() {
    let mut map = HashMap::new();
    map.insert(OpKey::new("a"), 1);
    map.insert(OpKey::new("b"), 2);

    assert_eq!(map.get("a"), Some(&1));
    assert_eq!(map.get(&OpKey::new("b")), Some(&2));
    assert_eq!(map.get("c"), None);
}

#[test]
fn test_key_serializes_as_plain_string() -> anyhow::Result<()> {
    let key = OpKey::new("fetch-s-1");
    let json = serde_json::to_string(&key)?;

    assert_eq!(json, "\"fetch-s-1\"");
    assert_eq!(serde_json::from_str::<OpKey>(&json)?, key);
    Ok(())
}
