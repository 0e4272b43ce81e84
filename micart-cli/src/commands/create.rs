//! `micart create` command - Allocate a guest for a bundle.

use std::path::Path;

use micart_core::{Container, ContainerId, ReadinessNotifier, Spec};

use super::{absolute_bundle, write_pid_file, CliError, RuntimeContext};

pub async fn execute(
    ctx: &RuntimeContext,
    container_id: &str,
    bundle: &Path,
    pid_file: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = RuntimeContext::container_id(container_id)?;
    let notifier = ctx.notifier(&id);

    let container = create_container(ctx, &id, bundle, &notifier)?;
    if let Some(path) = pid_file {
        write_pid_file(path, main_pid(&container))?;
    }

    println!("✓ Container {} created", id);
    Ok(())
}

/// Load the bundle, record the container and ask micad for a guest.
///
/// A refused allocation removes the freshly written state again.
pub(crate) fn create_container(
    ctx: &RuntimeContext,
    id: &ContainerId,
    bundle: &Path,
    notifier: &ReadinessNotifier,
) -> Result<Container, CliError> {
    let bundle = absolute_bundle(bundle)?;
    let mut spec = Spec::load(&bundle)?;
    notifier.setup_spec(&mut spec);

    let container = Container::create(
        ctx.store.clone(),
        ctx.client.clone(),
        id.clone(),
        bundle,
        spec,
    )?;

    let allocated = notifier
        .setup_socket_directory()
        .and_then(|()| container.allocate_guest());

    let reply = match allocated {
        Ok(reply) => reply,
        Err(e) => {
            discard(ctx, id);
            return Err(e.into());
        }
    };

    if !reply.advisory().is_empty() {
        eprintln!("{}", reply.advisory());
    }
    if !reply.is_success() {
        discard(ctx, id);
        return Err(CliError::AllocationFailed {
            id: id.clone(),
            advisory: reply.advisory().to_string(),
        });
    }

    Ok(container)
}

fn discard(ctx: &RuntimeContext, id: &ContainerId) {
    if let Err(e) = ctx.store.remove(id) {
        tracing::warn!(container_id = %id, error = %e, "Failed to remove state directory");
    }
}

/// Pid reported to supervisors: the attached init, else this process.
pub(crate) fn main_pid(container: &Container) -> u32 {
    container
        .init_pid()
        .map_or_else(std::process::id, |pid| pid.value())
}
