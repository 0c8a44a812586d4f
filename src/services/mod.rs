pub mod account_service;
pub mod aggregate_service;
pub mod catalog_service;
pub mod order_service;
pub mod review_service;
