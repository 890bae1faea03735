//! Webhook HTTP surface.

pub mod alert;
pub mod handlers;
pub mod routes;
pub mod state;

pub use alert::{parse_alert, AlertIntent, ParsedAlert};
pub use routes::create_router;
pub use state::AppState;

use std::future::Future;
use tokio::net::TcpListener;
use tracing::info;

use crate::error::Result;

/// Bind and serve the webhook router until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    host: &str,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = create_router(state);
    let listener = TcpListener::bind((host, port)).await?;
    info!("Webhook server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
