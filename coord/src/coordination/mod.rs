//! Filesystem coordination between one controller and its workers

mod manager;
mod state;

pub use manager::CoordinationManager;
pub use state::{
    AckStatus, CoordinationState, SCHEMA_VERSION, STATE_FILE_NAME, WorkerAck, ack_file_name, is_ack_file_name,
};
