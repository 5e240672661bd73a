pub mod archive_streamer;
pub mod object_fetcher;
pub mod path_builder;
pub mod reference_resolver;
