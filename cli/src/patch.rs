use std::path::Path;

use importpatch::patch::{PatchError, PatchOutcome, patch_file};
use tracing::{error, info};
use tracing_attributes::instrument;

pub const SUCCESS_MESSAGE: &str = "✅ Import added successfully!";

/// Patch `path` and report success on stdout.
///
/// The message is printed even when the file was too short to change.
#[instrument(skip_all, fields(file = %path.display()))]
pub fn run(path: &Path) -> Result<(), PatchError> {
    let outcome = patch_file(path).inspect_err(|err| error!(%err, "patch failed"))?;
    if let PatchOutcome::Unchanged { line_count } = outcome {
        info!(line_count, "no line 18, file rewritten as is");
    }
    println!("{SUCCESS_MESSAGE}");
    Ok(())
}
