use log::warn;
use thiserror::Error;

use super::kill_switch::{KillSwitch, KillSwitchError};
use super::var::PortfolioVaR;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("trading halted: {0}")]
    Halted(#[source] KillSwitchError),
    #[error("VaR {var:.4} exceeds limit {limit:.4}")]
    VarLimitExceeded { var: f64, limit: f64 },
}

/// Single pre-order check: the kill switch first, then the VaR limit
pub fn pre_trade_check(
    kill_switch: &KillSwitch,
    var: &PortfolioVaR,
    max_var_pct: f64,
) -> Result<(), GateError> {
    kill_switch.check_and_raise().map_err(GateError::Halted)?;

    if !var.is_within_limit(max_var_pct) {
        let current = var.var95();
        warn!(
            "Pre-trade gate blocked order: VaR {:.4} > limit {:.4}",
            current, max_var_pct
        );
        return Err(GateError::VarLimitExceeded {
            var: current,
            limit: max_var_pct,
        });
    }
    Ok(())
}
