pub mod cities;
pub mod health;
pub mod weather;

use sqlx::PgPool;

/// Shared state for the read API.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
}
