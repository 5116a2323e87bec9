pub mod bootstrap;
pub mod commands;
pub mod family_store;
pub mod migration;
pub mod realtime;
pub mod reconciler;
pub mod ticker;
