#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![doc = include_str!("../README.md")]
#![cfg_attr(
    feature = "document-features",
    doc = concat!("# Feature flags\n\n", document_features::document_features!())
)]

pub mod channel;
pub mod connection;
pub mod dispatch;
pub mod framing;
pub mod packet;
pub mod queue;
pub mod transport;

pub use {anyhow, bytes};
