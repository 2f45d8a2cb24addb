pub mod config_parser; // gateway TOML config file
pub mod endpoints; // API endpoints
pub mod error; // error handling
pub mod gateway_util; // shared application state
pub mod insight; // insight cooldown tracking and generation
pub mod observability; // logging setup
pub mod tier; // tier policy table
pub mod usage; // period-bucketed usage counting
