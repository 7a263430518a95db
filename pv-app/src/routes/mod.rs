pub mod channels;
pub mod health;
pub mod queue;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(channels::router())
        .merge(queue::router())
}
