//! Farewell Worker Service - Entry Point
//!
//! Background worker that says goodbye to deleted clients.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    zerg_farewell_worker::run().await
}
