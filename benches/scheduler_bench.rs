use criterion::{black_box, criterion_group, criterion_main, Criterion};
use crossbeam_channel::bounded;
use std::sync::Arc;
use std::time::Instant;

use frame_scheduler::metrics::PerformanceMonitor;
use frame_scheduler::scheduler::{
    BatchFormer, BatchParams, ConsumerRegistry, ConsumerSettings, Dispatcher, LaneSet,
};
use frame_scheduler::{Category, Priority, SchedulerConfig};

fn lanes_and_monitor(config: &SchedulerConfig) -> (Arc<LaneSet>, Arc<PerformanceMonitor>) {
    let (tx, _rx) = bounded(config.advisory_capacity);
    let monitor = Arc::new(PerformanceMonitor::new(config, tx));
    let lanes = Arc::new(LaneSet::new(
        config.lane_capacity.clone(),
        config.target_latency.clone(),
        monitor.clone(),
    ));
    lanes.open();
    (lanes, monitor)
}

fn bench_lanes(c: &mut Criterion) {
    let mut group = c.benchmark_group("lanes");
    let config = SchedulerConfig::default();
    let payload = [0u8; 64];

    group.bench_function("enqueue_drain", |b| {
        let (lanes, _monitor) = lanes_and_monitor(&config);
        b.iter(|| {
            lanes
                .enqueue(Category::Visual, Priority::Normal, black_box(&payload), None, Instant::now())
                .unwrap();
            black_box(lanes.drain_lane(Category::Visual, Priority::Normal, 1));
        });
    });

    group.bench_function("enqueue_with_eviction", |b| {
        let (lanes, _monitor) = lanes_and_monitor(&config);
        let capacity = config.lane_capacity[Priority::Low];
        for _ in 0..capacity {
            lanes
                .enqueue(Category::Audio, Priority::Low, &payload, None, Instant::now())
                .unwrap();
        }
        b.iter(|| {
            lanes
                .enqueue(Category::Audio, Priority::Low, black_box(&payload), None, Instant::now())
                .unwrap();
        });
    });
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatcher");
    let config = SchedulerConfig::default();

    group.bench_function("tick_mixed_priorities", |b| {
        let (lanes, monitor) = lanes_and_monitor(&config);
        let params = Arc::new(BatchParams::new(&config));
        let former = BatchFormer::new(&config, params, monitor.clone());
        let registry = Arc::new(ConsumerRegistry::new());
        registry.set_monitor(monitor.clone());
        for category in Category::ALL {
            registry
                .register(
                    category,
                    ConsumerSettings {
                        handoff_capacity: config.handoff_capacity,
                        stall_threshold: config.handler_stall_threshold,
                        strict: false,
                    },
                    |delivery| {
                        black_box(delivery);
                    },
                )
                .unwrap();
        }
        let dispatcher = Dispatcher::new(lanes.clone(), former, registry, monitor);

        b.iter(|| {
            let now = Instant::now();
            for (i, priority) in Priority::ALL.iter().cycle().take(64).enumerate() {
                let category = Category::ALL[i % Category::ALL.len()];
                let _ = lanes.enqueue(category, *priority, &[1, 2, 3], None, now);
            }
            black_box(dispatcher.tick(now, true));
        });
    });
}

fn bench_metrics(c: &mut Criterion) {
    let mut group = c.benchmark_group("metrics");
    let config = SchedulerConfig::default();

    group.bench_function("snapshot", |b| {
        let (lanes, monitor) = lanes_and_monitor(&config);
        let now = Instant::now();
        for i in 0..config.latency_window {
            lanes
                .enqueue(Category::Parameter, Priority::High, &[i as u8], None, now)
                .unwrap();
        }
        for event in lanes.drain_lane(Category::Parameter, Priority::High, usize::MAX) {
            monitor.record_dispatch(&event, Instant::now());
        }

        b.iter(|| black_box(monitor.snapshot(&lanes.occupancy())));
    });
}

criterion_group!(benches, bench_lanes, bench_dispatch, bench_metrics);
criterion_main!(benches);
