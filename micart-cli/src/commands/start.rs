//! `micart start` command - Start a created container.

use micart_core::OciStatus;

use super::{shutdown_signal, CliError, RuntimeContext};

pub async fn execute(
    ctx: &RuntimeContext,
    container_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let container = ctx.load(container_id)?;

    let status = container.status();
    if status != OciStatus::Created {
        return Err(CliError::NotCreated {
            id: container.id().clone(),
            status,
        }
        .into());
    }

    let mut notifier = ctx.notifier(container.id());
    notifier.bind_socket()?;

    container.start()?;
    notifier
        .wait_for_container(&container, shutdown_signal())
        .await?;

    tracing::info!(container_id = %container.id(), "Container started");
    Ok(())
}
