pub mod cdo;
pub mod climo;
pub mod logging;
#[cfg(feature = "netcdf")]
pub mod nc;
pub mod units;
