pub mod activity;
pub mod apps;
pub mod collab;
pub mod db;
pub mod lifecycle;
pub mod runtime;
pub mod terminal;
