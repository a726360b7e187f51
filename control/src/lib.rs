pub mod agents;
pub mod args;
pub mod cli;
pub mod clusters;
pub mod credentials;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod executions;
pub mod http;
pub mod models;
pub mod monitor;
pub mod queue;
pub mod registry;
pub mod server;
pub mod session;
pub mod state;

pub mod proto {
    pub mod relayer {
        tonic::include_proto!("relayer");
    }
}
