//! End-to-end provider scenarios over an in-memory volume

use ember_reflect::{Field, FieldLayout, Name, Registry, StructType};
use ember_resource::{
    bootstrap_resource_types, mark_resource_type, BinaryWriter, ContainerId, DefaultCoordinator,
    ManualClock, MemoryVfs, ProviderConfig, ResourceProvider, ScriptStorage, StringRegistry,
    TickingClock,
};
use ember_resource::serial::{ResourceIndex, IndexContainer, IndexItem, RESOURCE_INDEX_FILE, RESOURCE_INDEX_STRING_REGISTRY_FILE};
use std::sync::Arc;

const MESH: &str = "mesh_t";

fn mesh_name() -> Name {
    Name::intern(MESH)
}

fn build_registry() -> Arc<Registry> {
    let mut registry = Registry::new();
    registry.add_struct(StructType::new(
        MESH,
        32,
        8,
        vec![
            Field::new("vertex_count", 0, 4, FieldLayout::UnsignedInt),
            Field::new("lod_bias", 4, 4, FieldLayout::Floating),
            Field::new("flags", 8, 8, FieldLayout::UnsignedInt),
            Field::new("tag", 16, 8, FieldLayout::InternedString),
            Field::new("reserved", 24, 8, FieldLayout::UnsignedInt),
        ],
    ));
    mark_resource_type(&mut registry, mesh_name());
    bootstrap_resource_types(&mut registry);
    Arc::new(registry)
}

fn encode_mesh(
    registry: &Arc<Registry>,
    vertex_count: u32,
    tag: &str,
    string_registry: Option<Arc<StringRegistry>>,
) -> Vec<u8> {
    let storage = ScriptStorage::new(registry.clone());
    let writer = BinaryWriter::new(storage, string_registry);

    let mut instance = [0u8; 32];
    instance[0..4].copy_from_slice(&vertex_count.to_ne_bytes());
    instance[4..8].copy_from_slice(&1.5f32.to_ne_bytes());
    instance[8..16].copy_from_slice(&0xF0F0u64.to_ne_bytes());
    instance[16..24].copy_from_slice(&(Name::intern(tag).id() as u64).to_ne_bytes());
    instance[24..32].copy_from_slice(&7u64.to_ne_bytes());

    let mut encoded = Vec::new();
    writer
        .write_instance(&mut encoded, mesh_name(), &instance)
        .unwrap();
    encoded
}

fn loaded_vertex_count(provider: &ResourceProvider, name: &str) -> Option<u32> {
    provider.with_loaded(mesh_name(), Name::intern(name), |bytes| {
        u32::from_ne_bytes(bytes[0..4].try_into().unwrap())
    })
}

#[test]
fn scan_registers_and_loads_used_resources() {
    let registry = build_registry();
    let vfs = MemoryVfs::new();
    vfs.put_file("assets/crate.bin", encode_mesh(&registry, 128, "props", None));
    vfs.put_file("assets/barrel.bin", encode_mesh(&registry, 64, "props", None));

    let mut provider = ResourceProvider::new(
        ProviderConfig::new(1_000_000_000, "assets").with_worker_count(1),
        registry,
        Arc::new(vfs),
    )
    .with_clock(Arc::new(ManualClock::new()));

    provider.add_usage(mesh_name(), Name::intern("crate"), 1);
    provider.execute();
    assert!(provider.scan_done());

    let registered = provider.drain_registered_events(mesh_name());
    assert_eq!(registered.len(), 2);

    // Only the used resource was loaded.
    assert_eq!(loaded_vertex_count(&provider, "crate"), Some(128));
    assert_eq!(loaded_vertex_count(&provider, "barrel"), None);

    let loaded = provider.drain_loaded_events(mesh_name());
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].name, Name::intern("crate"));
}

#[test]
fn refcount_drop_to_zero_clears_operation_and_containers() {
    let registry = build_registry();
    let vfs = MemoryVfs::new();
    vfs.put_file("assets/crate.bin", encode_mesh(&registry, 16, "props", None));

    let mut provider = ResourceProvider::new(
        ProviderConfig::new(1_000_000_000, "assets").with_worker_count(1),
        registry,
        Arc::new(vfs),
    )
    .with_clock(Arc::new(ManualClock::new()));

    let usages: Vec<_> = (0..3u32)
        .map(|slot| provider.add_usage(mesh_name(), Name::intern("crate"), slot))
        .collect();
    provider.execute();

    let state = provider
        .entry_state(mesh_name(), Name::intern("crate"))
        .unwrap();
    assert_eq!(state.usage_count, 3);
    assert!(state.loaded_container.is_valid());

    for usage in usages {
        assert!(provider.remove_usage(usage));
    }
    provider.execute();

    let state = provider
        .entry_state(mesh_name(), Name::intern("crate"))
        .unwrap();
    assert_eq!(state.usage_count, 0);
    assert!(!state.has_operation);
    assert_eq!(state.loaded_container, ContainerId::INVALID);
    assert_eq!(state.loading_container, ContainerId::INVALID);
    assert_eq!(loaded_vertex_count(&provider, "crate"), None);
}

#[test]
fn serve_budget_spreads_loads_over_frames() {
    let registry = build_registry();
    let vfs = MemoryVfs::new();
    let names = ["m1", "m2", "m3", "m4", "m5"];
    for (slot, name) in names.iter().enumerate() {
        vfs.put_file(
            format!("assets/{name}.bin"),
            encode_mesh(&registry, (slot as u32 + 1) * 10, "lod", None),
        );
    }

    // Every clock read costs 30us of simulated work against a 500us budget.
    let mut provider = ResourceProvider::new(
        ProviderConfig::new(500_000, "assets").with_worker_count(1),
        registry,
        Arc::new(vfs),
    )
    .with_clock(Arc::new(TickingClock::new(30_000)));

    // Priorities 5..1: m1 is the most urgent.
    for (slot, name) in names.iter().enumerate() {
        provider.add_usage(mesh_name(), Name::intern(name), 5 - slot as u32);
    }

    provider.execute();
    let mut event_order: Vec<Name> = provider
        .drain_loaded_events(mesh_name())
        .into_iter()
        .map(|event| event.name)
        .collect();

    // The budget is too small for all five; the served ones are the highest
    // priorities in order.
    assert!(!event_order.is_empty());
    assert!(event_order.len() < names.len());
    for (slot, name) in event_order.iter().enumerate() {
        assert_eq!(*name, Name::intern(names[slot]));
    }

    // Remaining frames finish the rest.
    for _ in 0..32 {
        provider.execute();
        event_order.extend(
            provider
                .drain_loaded_events(mesh_name())
                .into_iter()
                .map(|event| event.name),
        );
        if event_order.len() == names.len() {
            break;
        }
    }

    // Exactly one loaded event per resource, in priority order.
    assert_eq!(event_order.len(), names.len());
    for (slot, name) in event_order.iter().enumerate() {
        assert_eq!(*name, Name::intern(names[slot]));
    }

    // Container ids increase with completion order.
    let container_ids: Vec<ContainerId> = names
        .iter()
        .map(|name| {
            provider
                .entry_state(mesh_name(), Name::intern(name))
                .unwrap()
                .loaded_container
        })
        .collect();
    for pair in container_ids.windows(2) {
        assert!(pair[0] < pair[1]);
    }
}

#[test]
fn modified_file_reloads_after_debounce() {
    let registry = build_registry();
    let vfs = MemoryVfs::new();
    vfs.put_file("assets/crate.bin", encode_mesh(&registry, 100, "props", None));

    let clock = Arc::new(ManualClock::new());
    let coordinator = Arc::new(DefaultCoordinator::new(10_000_000));
    let mut provider = ResourceProvider::new(
        ProviderConfig::new(1_000_000_000, "assets").with_worker_count(1),
        registry.clone(),
        Arc::new(vfs.clone()),
    )
    .with_clock(clock.clone())
    .with_coordinator(coordinator);

    provider.add_usage(mesh_name(), Name::intern("crate"), 1);
    provider.execute();
    assert_eq!(loaded_vertex_count(&provider, "crate"), Some(100));
    let first_container = provider
        .entry_state(mesh_name(), Name::intern("crate"))
        .unwrap()
        .loaded_container;

    // Touch the file twice in quick succession; both land in one debounce
    // window.
    vfs.put_file("assets/crate.bin", encode_mesh(&registry, 200, "props", None));
    vfs.put_file("assets/crate.bin", encode_mesh(&registry, 250, "props", None));
    provider.execute();

    let updated = provider.drain_updated_events();
    assert_eq!(updated.len(), 2);
    let state = provider
        .entry_state(mesh_name(), Name::intern("crate"))
        .unwrap();
    assert!(state.reload_pending);
    // Still the old payload while the debounce window is open.
    assert_eq!(loaded_vertex_count(&provider, "crate"), Some(100));

    clock.advance(11_000_000);
    provider.execute();

    assert_eq!(loaded_vertex_count(&provider, "crate"), Some(250));
    let state = provider
        .entry_state(mesh_name(), Name::intern("crate"))
        .unwrap();
    assert!(!state.reload_pending);
    assert_ne!(state.loaded_container, first_container);

    // One reload means exactly one extra loaded event.
    assert_eq!(provider.drain_loaded_events(mesh_name()).len(), 2);
}

#[test]
fn added_file_registers_after_debounce() {
    let registry = build_registry();
    let vfs = MemoryVfs::new();
    vfs.put_file("assets/crate.bin", encode_mesh(&registry, 1, "props", None));

    let clock = Arc::new(ManualClock::new());
    let mut provider = ResourceProvider::new(
        ProviderConfig::new(1_000_000_000, "assets").with_worker_count(1),
        registry.clone(),
        Arc::new(vfs.clone()),
    )
    .with_clock(clock.clone())
    .with_coordinator(Arc::new(DefaultCoordinator::new(5_000_000)));

    provider.execute();
    assert_eq!(provider.drain_registered_events(mesh_name()).len(), 1);

    // Usage arrives before the file exists; the load starts once the
    // debounced addition is promoted.
    provider.add_usage(mesh_name(), Name::intern("barrel"), 3);
    vfs.put_file("assets/barrel.bin", encode_mesh(&registry, 77, "props", None));
    provider.execute();
    assert!(provider
        .entry_state(mesh_name(), Name::intern("barrel"))
        .is_none());

    clock.advance(6_000_000);
    provider.execute();

    let state = provider
        .entry_state(mesh_name(), Name::intern("barrel"))
        .unwrap();
    assert_eq!(state.usage_count, 1);
    assert_eq!(loaded_vertex_count(&provider, "barrel"), Some(77));
    assert_eq!(provider.drain_registered_events(mesh_name()).len(), 1);
}

#[test]
fn index_driven_scan_binds_string_registry() {
    let registry = build_registry();
    let vfs = MemoryVfs::new();

    let table = Arc::new(StringRegistry::from_names(vec![
        mesh_name(),
        Name::intern("crate"),
        Name::intern("props"),
    ]));

    let mut registry_bytes = Vec::new();
    table.write(&mut registry_bytes).unwrap();
    vfs.put_file(
        format!("assets/{RESOURCE_INDEX_STRING_REGISTRY_FILE}"),
        registry_bytes,
    );

    let index = ResourceIndex {
        containers: vec![IndexContainer {
            type_name: mesh_name(),
            items: vec![IndexItem {
                name: Name::intern("crate"),
                path: "meshes/crate.bin".to_owned(),
            }],
        }],
    };
    let mut index_bytes = Vec::new();
    index.write(&mut index_bytes, Some(&table)).unwrap();
    vfs.put_file(format!("assets/{RESOURCE_INDEX_FILE}"), index_bytes);

    vfs.put_file(
        "assets/meshes/crate.bin",
        encode_mesh(&registry, 512, "props", Some(table)),
    );

    let mut provider = ResourceProvider::new(
        ProviderConfig::new(1_000_000_000, "assets").with_worker_count(1),
        registry,
        Arc::new(vfs),
    )
    .with_clock(Arc::new(ManualClock::new()));

    provider.add_usage(mesh_name(), Name::intern("crate"), 1);
    provider.execute();

    assert_eq!(provider.drain_registered_events(mesh_name()).len(), 1);
    assert_eq!(loaded_vertex_count(&provider, "crate"), Some(512));
    // The entry decoded its tag through the bound string registry.
    let tag = provider
        .with_loaded(mesh_name(), Name::intern("crate"), |bytes| {
            u64::from_ne_bytes(bytes[16..24].try_into().unwrap())
        })
        .unwrap();
    assert_eq!(tag, Name::intern("props").id() as u64);
}

#[test]
fn duplicate_entries_are_rejected() {
    let registry = build_registry();
    let vfs = MemoryVfs::new();
    vfs.put_file("assets/a/crate.bin", encode_mesh(&registry, 1, "props", None));
    vfs.put_file("assets/b/crate.bin", encode_mesh(&registry, 2, "props", None));

    let mut provider = ResourceProvider::new(
        ProviderConfig::new(1_000_000_000, "assets").with_worker_count(1),
        registry,
        Arc::new(vfs),
    )
    .with_clock(Arc::new(ManualClock::new()));

    provider.execute();
    assert_eq!(provider.drain_registered_events(mesh_name()).len(), 1);
}
