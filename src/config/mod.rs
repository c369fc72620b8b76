//! Configuration comes from two places: a TOML file merged over the built-in
//! defaults ([`file`]), and command line parameters ([`runtime`]) that are
//! combined with it into the configuration a run uses.
pub mod file;
pub mod runtime;
