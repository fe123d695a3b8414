pub mod engine;
pub mod validators;

pub use validators::{ValidateFieldEvent, Validator, Validators, Verdict};
