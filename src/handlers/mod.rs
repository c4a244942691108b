pub mod caller;
pub mod document_handlers;
pub mod health_handlers;
pub mod object_handlers;
pub mod optimizer_handlers;
pub mod web_handlers;
