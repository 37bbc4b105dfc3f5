use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use trade_guard::risk::{historical_var_cvar, PortfolioVaR};

fn create_returns(count: usize) -> Vec<f64> {
    // deterministic pseudo-returns in roughly [-5%, +5%]
    (0..count)
        .map(|i| (((i * 7919) % 1000) as f64 - 500.0) / 10_000.0)
        .collect()
}

fn bench_historical_var_cvar(c: &mut Criterion) {
    let mut group = c.benchmark_group("historical_var_cvar");
    for count in [252usize, 1_000, 10_000] {
        let returns = create_returns(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &returns, |b, returns| {
            b.iter(|| black_box(historical_var_cvar(returns, 0.95)))
        });
    }
    group.finish();
}

fn bench_rolling_gate(c: &mut Criterion) {
    let returns = create_returns(2_000);
    c.bench_function("portfolio_var_update_and_check", |b| {
        b.iter(|| {
            let mut var = PortfolioVaR::new(252);
            for r in &returns {
                var.update(*r);
            }
            black_box(var.is_within_limit(0.05))
        })
    });
}

criterion_group!(benches, bench_historical_var_cvar, bench_rolling_gate);
criterion_main!(benches);
