pub mod budget;
pub mod checkpoint;
pub mod completion;
pub mod dataset;
pub mod debate;
pub mod decode;
pub mod gateway;
pub mod harness;
pub mod logging;
pub mod retry;
pub mod schedule;
pub mod state;
pub mod store;
