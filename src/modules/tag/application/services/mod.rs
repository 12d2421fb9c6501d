pub mod tag_service;
