use std::{collections::HashSet, sync::Arc};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use hwcomposer::backend::{
    allocator::{Fourcc, Importer},
    drm::{
        compositor::{CompositorConfig, Planner, TieBreak},
        device::test::{test_buffer, TestDevice, TestImporter},
        DisplayId, Layer, LayerDescription, ResourceRegistry,
    },
};
use hwcomposer::utils::Rectangle;

fn layers(importer: &Arc<dyn Importer>, count: i32) -> Vec<Layer> {
    (0..count)
        .map(|i| {
            let geometry = Rectangle::from_loc_and_size((i * 10, i * 5), (200 + i * 30, 100 + i * 20));
            let buffer = test_buffer(Fourcc::Argb8888, geometry.size.w, geometry.size.h);
            Layer::from_description(LayerDescription::new(buffer, geometry), importer)
        })
        .collect()
}

fn criterion_benchmark(c: &mut Criterion) {
    let device = TestDevice::single_display(3);
    let mut registry = ResourceRegistry::initialize(&device).unwrap();
    registry.assign_displays();
    registry.bind_display(DisplayId(0)).unwrap();
    let importer: Arc<dyn Importer> = Arc::new(TestImporter::new());
    let claimed = HashSet::new();

    let mut group = c.benchmark_group("Planner::plan");
    for tie_break in [TieBreak::Area, TieBreak::ZOrder, TieBreak::CapabilityFit] {
        let planner = Planner::new(&CompositorConfig {
            tie_break,
            ..CompositorConfig::default()
        });
        for count in [4, 8, 16] {
            let layers = layers(&importer, count);
            group.bench_with_input(
                BenchmarkId::new(format!("{:?}", tie_break), count),
                &layers,
                |b, layers| b.iter(|| planner.plan(layers, &registry, DisplayId(0), &claimed).unwrap()),
            );
        }
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
