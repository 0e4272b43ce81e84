//! `micart kill` command - Forward a signal number to micad.

use std::str::FromStr;

use nix::sys::signal::Signal;

use super::{CliError, RuntimeContext};

pub async fn execute(
    ctx: &RuntimeContext,
    container_id: &str,
    signal: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let signal = parse_signal(signal)?;
    let container = ctx.load(container_id)?;
    container.signal(signal)?;
    Ok(())
}

/// Accepts `9`, `KILL` or `SIGKILL`. `0` is the liveness probe.
pub fn parse_signal(raw: &str) -> Result<Option<Signal>, CliError> {
    let raw = raw.trim();
    if let Ok(number) = raw.parse::<i32>() {
        if number == 0 {
            return Ok(None);
        }
        return Signal::try_from(number)
            .map(Some)
            .map_err(|_| CliError::UnknownSignal(raw.to_string()));
    }

    let upper = raw.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&name)
        .map(Some)
        .map_err(|_| CliError::UnknownSignal(raw.to_string()))
}
