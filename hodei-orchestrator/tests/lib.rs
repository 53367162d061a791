test_r::enable!();

mod common;
mod engine_scenarios;
mod protocol;
