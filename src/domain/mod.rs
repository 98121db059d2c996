mod market;
mod order;
mod position;
mod state;

pub use market::{DepthLevel, Market, MarketStatus, Orderbook, Side};
pub use order::{Fill, Order, OrderAction, OrderRequest, OrderStatus, OrderType};
pub use position::{ExitPlan, Position, PositionStatus, StrategyKind, TradeIntent, TradeLog};
pub use state::{ExitReason, PositionLifecycle, RiskState};
