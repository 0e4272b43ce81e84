//! `micart spec` command - Write an example config.json.

use std::path::Path;

use micart_core::Spec;

pub async fn execute(bundle: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let path = Spec::example().write_new(bundle)?;
    println!("✓ Wrote {}", path.display());
    Ok(())
}
