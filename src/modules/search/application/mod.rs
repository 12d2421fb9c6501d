pub mod post_search_service;
