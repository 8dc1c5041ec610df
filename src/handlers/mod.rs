pub mod health_handlers;
pub mod map_handlers;
