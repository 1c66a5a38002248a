pub mod common;

mod session_run;
mod status_server;
