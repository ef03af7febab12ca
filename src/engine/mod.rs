pub mod soffice;
pub mod types;

use crate::error::ConversionResult;
use anyhow::Result;
use std::path::PathBuf;

pub use types::{ConversionRequest, EngineDiag};

pub trait Engine {
    fn doctor(&self) -> Result<EngineDiag>;
    /// Converts one document, returning the path of the verified PDF.
    fn convert(&self, req: &ConversionRequest) -> ConversionResult<PathBuf>;
}
