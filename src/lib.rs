pub mod client;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod heartbeat;
pub mod message;
pub mod poller;
pub mod registry;
pub mod retry;
pub mod supervisor;

// mimalloc keeps allocation overhead low on the receive path.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;
