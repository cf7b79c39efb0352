#[cfg(test)]
#[macro_use]
extern crate maplit;

#[macro_use]
pub mod macros;

mod bindings;
pub mod config;
mod counter;
pub mod diagnostic;
pub mod error;
pub mod events;
mod folder;
pub mod formatting;
pub mod kb;
pub mod messages;
pub mod numerics;
pub mod policy;
pub mod polar;
pub mod query;
mod rewrites;
pub mod rule_types;
pub mod rules;
mod runnable;
pub mod sources;
pub mod terms;
mod validations;
mod visitor;
mod vm;
