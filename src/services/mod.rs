pub mod document_service;
pub mod image_transform;
pub mod object_store;
pub mod optimizer_service;
pub mod signing;
pub mod storage_service;
