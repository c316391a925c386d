//! Persona file loading.

use std::path::Path;
use tracing::warn;

/// Load the persona text, or an empty string when the file is missing.
pub fn load_persona(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => {
            warn!(path = %path.display(), "persona file missing, using empty persona");
            String::new()
        }
    }
}
