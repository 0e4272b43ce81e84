//! `micart run` command - Create and start in one step.

use std::path::Path;

use micart_core::Container;

use super::create::{create_container, main_pid};
use super::{shutdown_signal, write_pid_file, RuntimeContext};

pub async fn execute(
    ctx: &RuntimeContext,
    container_id: &str,
    bundle: &Path,
    pid_file: Option<&Path>,
    keep: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = RuntimeContext::container_id(container_id)?;
    let mut notifier = ctx.notifier(&id);

    let container = create_container(ctx, &id, bundle, &notifier)?;

    let started = notifier.bind_socket().and_then(|()| container.run());
    if let Err(e) = started {
        if keep {
            tracing::warn!(container_id = %id, "Run failed, keeping state");
        } else {
            abandon(ctx, &container);
        }
        return Err(e.into());
    }

    if let Some(path) = pid_file {
        write_pid_file(path, main_pid(&container))?;
    }

    notifier
        .wait_for_container(&container, shutdown_signal())
        .await?;

    println!("✓ Container {} running", id);
    Ok(())
}

/// Release the guest micad already allocated, then the state directory.
fn abandon(ctx: &RuntimeContext, container: &Container) {
    let id = container.id();
    if let Err(e) = container.destroy() {
        tracing::warn!(container_id = %id, error = %e, "Destroy after failed run did not complete");
        if let Err(cleanup) = ctx.store.remove(id) {
            tracing::warn!(container_id = %id, error = %cleanup, "Failed to remove state directory");
        }
    }
}
