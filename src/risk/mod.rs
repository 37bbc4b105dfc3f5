pub mod gate;
pub mod kill_switch;
pub mod var;

pub use gate::{pre_trade_check, GateError};
pub use kill_switch::{KillSwitch, KillSwitchError, KillSwitchState, KillSwitchStatus};
pub use var::{historical_var_cvar, PortfolioVaR, VarEstimate, MIN_HISTORY};
