pub mod check_exclude;
pub mod config;
pub mod run;
pub mod status;
