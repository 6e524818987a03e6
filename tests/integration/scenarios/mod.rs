pub mod cli_tests;
pub mod hop_worker_tests;
