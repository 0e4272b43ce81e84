//! `micart delete` command - Remove a container.

use micart_core::{MicaError, OciStatus};

use super::{CliError, RuntimeContext};

pub async fn execute(
    ctx: &RuntimeContext,
    container_id: &str,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = RuntimeContext::container_id(container_id)?;

    let container = match ctx.load(container_id) {
        Ok(container) => container,
        Err(CliError::Core(MicaError::ContainerNotFound { .. })) => {
            // Leftover directory without a readable record.
            tracing::debug!(container_id = %id, "No state record, removing directory");
            ctx.store.remove(&id)?;
            if force {
                return Ok(());
            }
            return Err(CliError::Core(MicaError::ContainerNotFound { id }).into());
        }
        Err(e) => return Err(e.into()),
    };

    let options = ctx.config.force_delete;
    let force_delete = || tokio::task::block_in_place(|| container.force_delete(options));

    if force {
        force_delete()?;
        return Ok(());
    }

    match container.status() {
        OciStatus::Created => force_delete()?,
        OciStatus::Stopped => container.destroy()?,
        status => return Err(CliError::NotStopped { id, status }.into()),
    }
    Ok(())
}
