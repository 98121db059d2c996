mod runtime;
mod sync;

pub use runtime::TradingRuntime;
pub use sync::StartupSync;
