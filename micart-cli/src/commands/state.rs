//! `micart state` command - Print the OCI state document.

use super::RuntimeContext;

pub async fn execute(
    ctx: &RuntimeContext,
    container_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let container = ctx.load(container_id)?;

    let metrics = container.metrics();
    tracing::debug!(
        container_id = %metrics.container_id,
        lifecycle = %metrics.current_state,
        transitions = metrics.transition_count,
        "Loaded lifecycle"
    );

    let state = container.oci_state();
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}
