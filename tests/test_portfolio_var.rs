//! Historical-simulation VaR gate

use trade_guard::risk::{historical_var_cvar, PortfolioVaR, MIN_HISTORY};

#[test]
fn test_heavy_losses_breach_limit() {
    let mut var = PortfolioVaR::new(252);
    for _ in 0..50 {
        var.update(-0.20);
    }
    assert!(!var.is_within_limit(0.05));
    assert!((var.var95() - 0.20).abs() < 1e-12);
    assert!((var.cvar95() - 0.20).abs() < 1e-12);
}

#[test]
fn test_small_gains_pass() {
    let mut var = PortfolioVaR::new(252);
    for _ in 0..50 {
        var.update(0.001);
    }
    assert!(var.is_within_limit(0.05));
    assert_eq!(var.var95(), 0.0);
}

#[test]
fn test_short_history_always_passes() {
    for n in 0..MIN_HISTORY {
        let mut var = PortfolioVaR::new(252);
        for _ in 0..n {
            var.update(-0.9);
        }
        assert!(var.is_within_limit(0.01), "n = {}", n);
    }
}

#[test]
fn test_reference_tail() {
    let mut returns = vec![-0.10; 5];
    returns.extend(vec![0.01; 95]);
    let est = historical_var_cvar(&returns, 0.95);
    assert!((est.var - 0.10).abs() < 1e-9);
    assert!((est.cvar - 0.10).abs() < 1e-9);
}

#[test]
fn test_old_losses_roll_out_of_window() {
    let mut var = PortfolioVaR::new(20);
    for _ in 0..20 {
        var.update(-0.30);
    }
    assert!(!var.is_within_limit(0.05));
    for _ in 0..20 {
        var.update(0.002);
    }
    assert_eq!(var.history_length(), 20);
    assert!(var.is_within_limit(0.05));
}

#[test]
fn test_cvar_is_at_least_var() {
    let returns: Vec<f64> = (0..200).map(|i| ((i * 37) % 100) as f64 / 1000.0 - 0.05).collect();
    let est = historical_var_cvar(&returns, 0.95);
    assert!(est.cvar >= est.var);
    assert!(est.var > 0.0);
}
