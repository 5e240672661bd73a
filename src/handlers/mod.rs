pub mod health_handlers;
pub mod zip_handlers;
