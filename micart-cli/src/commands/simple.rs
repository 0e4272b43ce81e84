//! `micart exec|pause|resume|restore` - One control command each.

use super::RuntimeContext;

/// Lifecycle operation that needs nothing but the container.
#[derive(Debug, Clone, Copy)]
pub enum Action {
    Exec,
    Pause,
    Resume,
    Restore,
}

pub async fn execute(
    ctx: &RuntimeContext,
    container_id: &str,
    action: Action,
) -> Result<(), Box<dyn std::error::Error>> {
    let container = ctx.load(container_id)?;

    match action {
        Action::Exec => container.exec()?,
        Action::Pause => container.pause()?,
        Action::Resume => container.resume()?,
        Action::Restore => container.restore()?,
    }

    tracing::debug!(container_id = %container.id(), ?action, "Done");
    Ok(())
}
