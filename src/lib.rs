//! callcore - real-time call-control substrate
//!
//! A broker client (reconnecting transport, publisher, RPC over the broker)
//! and a switch event engine that mirrors channel and bridge state and
//! issues corrective commands back to the switch.
//!
//! ```text
//! [switch events] -> bus::Subscriber -> engine::EventConsumer
//!                                         -> ari::decode -> engine::Dispatcher
//!                                         -> lifecycle handlers -> store
//!                                                       |
//!                                      switch::SwitchClient -> rpc::RpcClient
//! ```

pub mod ari;
pub mod bus;
pub mod call_control;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod models;
pub mod rpc;
pub mod store;
pub mod switch;
pub mod utils;
