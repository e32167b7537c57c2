use amqp_messaging::{async_trait, HandlerError, MessageHandler};
use domain_clients::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Logs a goodbye for every deleted client
#[derive(Debug, Default)]
pub struct FarewellHandler {
    farewells: AtomicU64,
}

impl FarewellHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Goodbyes said since startup
    pub fn farewells(&self) -> u64 {
        self.farewells.load(Ordering::Relaxed)
    }

    pub fn farewell_line(client: &Client) -> String {
        format!("Goodbye, {}!", client.name)
    }
}

#[async_trait]
impl MessageHandler<Client> for FarewellHandler {
    async fn handle(&self, client: Client) -> Result<(), HandlerError> {
        if client.name.trim().is_empty() {
            return Err(HandlerError::failed(format!(
                "client {} has no name to say goodbye to",
                client.uuid
            )));
        }

        self.farewells.fetch_add(1, Ordering::Relaxed);
        info!(
            uuid = %client.uuid,
            age = client.age,
            email = client.email.as_deref().unwrap_or("-"),
            "{}",
            Self::farewell_line(&client)
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "FarewellHandler"
    }
}
