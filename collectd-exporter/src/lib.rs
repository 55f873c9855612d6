//! Prometheus exporter for collectd.
//!
//! Samples arrive as `write_http` JSON pushes or as collectd binary network
//! packets, are kept in an expiring store holding the latest sample per
//! identifier, and are exposed on an HTTP endpoint for scraping.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  HTTP push      │──┐
//! │  (JSON)         │  │   ┌──────────┐   ┌─────────┐   ┌─────────────────┐
//! └─────────────────┘  ├──>│ Ingestor │──>│  Store  │──>│   Exporter +    │
//! ┌─────────────────┐  │   └──────────┘   └─────────┘   │  TextRenderer   │
//! │  UDP listener   │──┘                       ▲        │   (/metrics)    │
//! │  (binary)       │                          │        └─────────────────┘
//! └─────────────────┘                     ┌─────────┐
//!                                         │ Sweeper │
//!                                         └─────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! collectd-exporter --config config.json5
//! ```
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod config;
pub mod export;
pub mod http;
pub mod ingest;
pub mod naming;
pub mod network;
pub mod push;
pub mod render;
pub mod store;
pub mod sweeper;

pub use config::ExporterConfig;
pub use export::{ExportedMetric, Exporter, MetricKind, MetricSink, SharedExporter};
pub use http::{AppState, HttpServer, create_router};
pub use ingest::{IngestReport, Ingestor, LastPush, SharedIngestor};
pub use network::{BinaryListener, TypesDb};
pub use render::TextRenderer;
pub use store::{MetricStore, SharedStore};
pub use sweeper::spawn_sweeper;
