#[cfg(feature = "integration_dscript")]
pub mod dscript;
