pub mod batch;
pub mod capture;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod fetch;
pub mod matcher;
pub mod model;
pub mod output;
pub mod parser;
pub mod pipeline;
pub mod reconcile;
pub mod store;
pub mod trip_id;
pub mod writer;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
