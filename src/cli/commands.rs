use crate::cli::Commands;
use crate::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn handle_command(command: Commands, token: CancellationToken) -> Result<()> {
    match command {
        Commands::Start(options) => {
            info!("Starting metrics server");
            options.run(token).await
        }
    }
}
