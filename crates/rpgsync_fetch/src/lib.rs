#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![doc = include_str!("../README.md")]
#![cfg_attr(
    feature = "document-features",
    doc = concat!("# Feature flags\n\n", document_features::document_features!())
)]

pub mod config;
pub mod download;
pub mod http;
pub mod manifest;
pub mod path;
pub mod request;
mod runtime;
pub mod service;

pub use {
    reqwest,
    runtime::FetchRuntime,
    service::FetchService,
};
