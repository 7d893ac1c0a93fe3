pub mod actions;
pub mod health;
pub mod persona;
pub mod telemetry;
pub mod turns;
