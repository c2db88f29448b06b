//! Engine services: collection, fusion, persistence, run lifecycle

pub mod cache;
pub mod collector;
pub mod pipeline;
pub mod publisher;
pub mod runner;
pub mod scraper_runtime;
pub mod selector;
pub mod warnings;

pub use cache::CacheService;
pub use collector::CollectionService;
pub use pipeline::PipelineService;
pub use publisher::DeltaPublisher;
pub use runner::RunController;
pub use scraper_runtime::ScraperRuntime;
pub use warnings::WarningStore;
