mod run;
mod worker;

pub use run::{RunArgs, run_code};
pub use worker::{WorkerArgs, run_worker};
