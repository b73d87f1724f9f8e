pub mod config_cmd;
pub mod corpus;
pub mod doctor;
pub mod run;
