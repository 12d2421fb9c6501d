pub mod feature_service;
