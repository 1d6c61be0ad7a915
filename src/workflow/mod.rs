//! Command handlers.
//!
//! Each handler loads the config, builds the pieces a pass needs and prints a
//! report; the engine itself lives in `enrich`.
mod run;
mod validate;

pub use run::run_run;
pub use validate::run_validate;

use crate::config::Config;
use crate::sheet::XlsxStore;

fn workbook_store(config: &Config) -> XlsxStore {
    XlsxStore::new(
        config.excel.input_path.clone(),
        config.excel.output_path.clone(),
        &config.excel.sheet_name,
    )
}
