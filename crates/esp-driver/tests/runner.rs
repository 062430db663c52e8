//! Thread-table runs across several software tiles.

use esp_driver::backends::DeviceCounters;
use esp_driver::chip::{AcceleratorKind, PlatformDescriptor};
use esp_driver::{
    run_table, Accelerator, AcceleratorError, ComputeKind, DeviceManager, DmaPool, InvokeOptions,
    MacConfig, SimMemory, SoftwareAccelerator, ThreadInfo,
};
use std::sync::Arc;
use std::time::Duration;

const PLATFORM: PlatformDescriptor = PlatformDescriptor::VC707_ARIANE;

fn tiles(count: usize) -> (Vec<Accelerator>, Vec<Arc<DeviceCounters>>, Arc<dyn DmaPool>) {
    let memory = SimMemory::at_dram(&PLATFORM, 16 << 20).shared();
    let pool: Arc<dyn DmaPool> = memory.clone();
    let mut accelerators = Vec::new();
    let mut counters = Vec::new();
    for i in 0..count {
        let tile = SoftwareAccelerator::new(AcceleratorKind::Mac, Arc::clone(&memory), PLATFORM);
        counters.push(tile.counters());
        let name = format!("mac.{i}");
        accelerators.push(Accelerator::new(&name, AcceleratorKind::Mac, PLATFORM, Box::new(tile)).unwrap());
    }
    (accelerators, counters, pool)
}

fn options() -> InvokeOptions {
    InvokeOptions::default().with_interval(Duration::from_micros(10))
}

#[test]
fn distinct_devices_run_concurrently_and_in_entry_order() {
    let (mut accs, counters, pool) = tiles(3);
    let mut skipped = ThreadInfo::reference("mac.1");
    skipped.run = false;
    let table = vec![
        ThreadInfo::reference("mac.2"),
        ThreadInfo::new("mac.0", MacConfig::new(2, 10, 8)),
        skipped,
        ThreadInfo::reference("mac.1"),
        ThreadInfo::new("mac.0", MacConfig::new(1, 4, 4)),
    ];

    let outcomes = run_table(&mut accs, &pool, &table, ComputeKind::Passthrough, &options()).unwrap();

    let entries: Vec<usize> = outcomes.iter().map(|o| o.entry).collect();
    assert_eq!(entries, vec![0, 1, 3, 4]);
    assert!(outcomes.iter().all(|o| o.passed()));
    assert_eq!(outcomes[0].device, "mac.2");

    assert_eq!(counters[0].starts(), 2);
    assert_eq!(counters[1].starts(), 1);
    assert_eq!(counters[2].starts(), 1);
    assert!(counters.iter().all(|c| c.clears() == c.starts()));
}

#[test]
fn entry_for_missing_device_fails_before_running() {
    let (mut accs, counters, pool) = tiles(1);
    let table = vec![ThreadInfo::reference("mac.0"), ThreadInfo::reference("mac.7")];

    let err = run_table(&mut accs, &pool, &table, ComputeKind::Passthrough, &options()).unwrap_err();
    assert!(matches!(err, AcceleratorError::DeviceNotFound { .. }));
    assert_eq!(counters[0].starts(), 0);
}

#[test]
fn invalid_entry_rejected_up_front() {
    let (mut accs, counters, pool) = tiles(1);
    let mut p2p = ThreadInfo::reference("mac.0");
    p2p.p2p.store = true;

    let err = run_table(&mut accs, &pool, &[p2p], ComputeKind::Passthrough, &options()).unwrap_err();
    assert!(matches!(err, AcceleratorError::Configuration { .. }));
    assert_eq!(counters[0].starts(), 0);
}

#[test]
fn failing_entry_does_not_stop_others() {
    let (mut accs, _counters, pool) = tiles(2);
    let table = vec![
        ThreadInfo::reference("mac.0"),
        // 64 MiB of input does not fit the 16 MiB window.
        ThreadInfo::new("mac.1", MacConfig::new(1, 4, 1 << 22)),
    ];

    let outcomes = run_table(&mut accs, &pool, &table, ComputeKind::Passthrough, &options()).unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes[0].passed());
    assert!(!outcomes[1].passed());
}

#[test]
fn mac_compute_through_device_manager() {
    let memory = SimMemory::at_dram(&PLATFORM, 8 << 20).shared();
    let pool: Arc<dyn DmaPool> = memory.clone();
    let mut manager = DeviceManager::software(
        PLATFORM,
        (0..2).map(|i| {
            let tile = SoftwareAccelerator::new(AcceleratorKind::Mac, Arc::clone(&memory), PLATFORM)
                .with_compute(ComputeKind::MultiplyAccumulate);
            (format!("mac.{i}"), tile)
        }),
    );
    assert_eq!(manager.select(AcceleratorKind::Mac, "*").len(), 2);

    let mut accs = vec![manager.open("mac.0").unwrap(), manager.open("mac.1").unwrap()];
    assert!(matches!(
        manager.open("mac.0"),
        Err(AcceleratorError::DeviceNotFound { .. })
    ));

    let table = vec![
        ThreadInfo::new("mac.0", MacConfig::new(4, 10, 8)),
        ThreadInfo::reference("mac.1"),
    ];
    let outcomes =
        run_table(&mut accs, &pool, &table, ComputeKind::MultiplyAccumulate, &options()).unwrap();
    assert!(outcomes.iter().all(|o| o.passed()));
    assert_eq!(memory.live_allocations(), 0);
}
