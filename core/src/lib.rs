pub mod actions;
pub mod answerability;
pub mod auth;
pub mod context;
pub mod error;
pub mod evidence;
pub mod judge;
pub mod persona;
pub mod routing;
