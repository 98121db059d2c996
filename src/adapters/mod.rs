mod kalshi;
mod postgres;

pub use kalshi::{ApiCredentials, KalshiClient};
pub use postgres::PostgresStore;
