pub mod errors;
pub mod ledger;
pub mod lifecycle;
pub mod models;
pub mod recurrence;
pub mod time_format;
