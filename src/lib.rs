pub mod config;
pub mod discipline;
pub mod error;
pub mod freq_counter;
pub mod gnss;
pub mod irq;
pub mod net;
pub mod ntp_server;
pub mod pps;
pub mod pps_gen;
pub mod ptp;
pub mod ptp_server;
pub mod status;
pub mod sync_state;
pub mod time_oracle;
pub mod timekeeper;
pub mod timestamp;
pub mod traits;

pub mod platform;
