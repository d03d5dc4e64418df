// Library interface for the stealth trap
// Detection pipeline, storage adapters and the HTTP front

pub mod admin;
pub mod ban_log;
pub mod ban_store;
pub mod block_page;
pub mod body;
pub mod browser;
pub mod cache;
pub mod challenge;
pub mod cidr;
pub mod config;
pub mod context;
pub mod error;
pub mod exemption;
pub mod fingerprint;
pub mod geo;
pub mod honeypot;
pub mod ip_extraction;
pub mod js_check;
pub mod keyed_hash;
pub mod layers;
pub mod lock_utils;
pub mod maintenance;
pub mod pipeline;
pub mod rate_limit;
pub mod request;
pub mod server;

pub use config::Config;
pub use context::TrapContext;
pub use error::{TrapError, TrapResult};
pub use pipeline::{Pipeline, Verdict};
pub use request::RequestInfo;
pub use server::TrapServer;
