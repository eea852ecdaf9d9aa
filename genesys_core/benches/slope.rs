use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use genesys_core::calibration::{self, Frame};
use genesys_core::slope::{self, SLOPE_TABLE_SIZE};

// A white line with a slow falloff toward both edges, 16-bit samples.
fn synth_white_line(pixels: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(pixels * 3 * 2);
    for ch in 0..3 {
        for px in 0..pixels {
            let edge = (px.min(pixels - 1 - px) as f32 / pixels as f32).min(0.1) * 10.0;
            let level = (0x6000 as f32 + 0x4000 as f32 * edge) as u16 - ch as u16 * 0x100;
            out.extend_from_slice(&level.to_le_bytes());
        }
    }
    out
}

fn group_settings(g: &mut criterion::BenchmarkGroup<'_, criterion::measurement::WallTime>) {
    // Allow quick tweaking without CLI flags (Criterion 0.5):
    //   BENCH_SAMPLE_SIZE=10 BENCH_MEAS_MS=50 cargo bench -p genesys_core --bench slope
    if let Ok(ss) = std::env::var("BENCH_SAMPLE_SIZE") {
        if let Ok(n) = ss.parse::<usize>() {
            g.sample_size(n.max(10));
        }
    } else {
        g.sample_size(50);
    }
    if let Ok(ms) = std::env::var("BENCH_MEAS_MS")
        && let Ok(ms_u64) = ms.parse::<u64>()
    {
        g.measurement_time(std::time::Duration::from_millis(ms_u64));
    }
}

pub fn bench_slope_tables(c: &mut Criterion) {
    let mut g = c.benchmark_group("slope");
    group_settings(&mut g);

    for &g_exp in &[0.5f32, 0.8, 1.2] {
        g.bench_function(format!("generate_g_{g_exp}"), |b| {
            b.iter(|| {
                let ramp = slope::generate_slope_table(
                    black_box(SLOPE_TABLE_SIZE),
                    black_box(1023),
                    black_box(700),
                    black_box(46876),
                    black_box(700),
                    black_box(192),
                    black_box(g_exp),
                );
                black_box(ramp.sum);
            })
        });
    }

    let db = genesys_config::builtin().expect("built-in database");
    let profiles = db.motor_profiles.clone();
    g.bench_function("profile_table_300dpi", |b| {
        b.iter(|| {
            let t = slope::slope_table(300, 2768, 1200, 0, 4, "canon-lide-110-motor", black_box(&profiles));
            black_box(t.map(|t| t.sum).unwrap_or(0));
        })
    });
    g.finish();
}

pub fn bench_shading(c: &mut Criterion) {
    let mut g = c.benchmark_group("shading");
    group_settings(&mut g);

    let pixels = 10_200usize;
    let line = synth_white_line(pixels);
    g.bench_function("coefficients_1200dpi_line", |b| {
        b.iter_batched(
            || line.clone(),
            |data| {
                let frame = Frame {
                    data: &data,
                    pixels,
                    channels: 3,
                    depth: 16,
                    planar: true,
                };
                black_box(calibration::shading_coefficients(&frame, 0xfa00));
            },
            BatchSize::LargeInput,
        )
    });
    g.finish();
}

criterion_group!(slope_benches, bench_slope_tables, bench_shading);
criterion_main!(slope_benches);
