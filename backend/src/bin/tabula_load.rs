// backend/src/bin/tabula_load.rs
//
// Sandbox-side loader shim. Generated code calls this instead of parsing
// files itself: `tabula-load <filename>` resolves the name against the data
// directory and prints the file as normalized CSV on stdout.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tabula_backend::loader::FileLoader;

const DEFAULT_MAX_FILE_BYTES: u64 = 100 * 1024 * 1024;

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(name) = args.next() else {
        bail!("usage: tabula-load <filename>");
    };

    let data_dir: PathBuf = std::env::var_os("TABULA_DATA_DIR")
        .or_else(|| std::env::var_os("DATA_DIR"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/app/data"));

    let candidate = PathBuf::from(&name);
    let path = if candidate.is_absolute() || candidate.is_file() {
        candidate
    } else {
        data_dir.join(&name)
    };

    let max_bytes = std::env::var("MAX_FILE_BYTES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_FILE_BYTES);

    let frame = FileLoader::new(max_bytes)
        .load(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    print!("{}", frame.to_csv_string());
    Ok(())
}
