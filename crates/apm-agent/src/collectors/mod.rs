//! Collectors (spec §4.6–§4.9): database instrumentation, the Queue Wait
//! Collector, the Observer Collector, and the thin collectors sharing
//! [`support`]'s buffer/percentile/top-N helpers.

pub mod cpu_profile;
pub mod db;
pub mod deprecated;
pub mod dns;
pub mod env;
pub mod job;
pub mod log;
pub mod observer;
pub mod outbound_http;
pub mod publication;
pub mod queue_wait;
pub mod system_metrics;
mod support;
